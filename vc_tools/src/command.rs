use log::debug;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {tool}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with code {code:?}:\n{stderr}")]
    Exit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error while running {tool}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    /// Exit code and stderr of a tool that ran and failed.
    pub fn exit_status(&self) -> Option<(Option<i32>, &str)> {
        match self {
            ToolError::Exit { code, stderr, .. } => Some((*code, stderr)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub code: Option<i32>,
    /// Empty when stdout was redirected to a file.
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A subprocess invocation with a fixed argv.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    success_codes: Vec<i32>,
    stdin_file: Option<PathBuf>,
    stdout_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Self {
        ToolCommand {
            name: name.to_string(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            success_codes: vec![0],
            stdin_file: None,
            stdout_file: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Exit codes treated as success; `[0]` by default.
    pub fn success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }

    pub fn stdout_file(mut self, path: &Path) -> Self {
        self.stdout_file = Some(path.to_path_buf());
        self
    }

    /// The command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    fn io_err(&self, source: io::Error) -> ToolError {
        ToolError::Io {
            tool: self.name.clone(),
            source,
        }
    }

    /// Run to completion, capturing stderr and stdout (unless redirected).
    pub fn run(&self) -> Result<ToolOutput, ToolError> {
        debug!("running {}", self.display());
        let mut cmd = self.build();
        match &self.stdin_file {
            Some(path) => cmd.stdin(File::open(path).map_err(|e| self.io_err(e))?),
            None => cmd.stdin(Stdio::null()),
        };
        if let Some(path) = &self.stdout_file {
            cmd.stdout(File::create(path).map_err(|e| self.io_err(e))?);
        }
        let output = cmd.output().map_err(|source| ToolError::Spawn {
            tool: self.name.clone(),
            source,
        })?;
        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !code.is_some_and(|c| self.success_codes.contains(&c)) {
            return Err(ToolError::Exit {
                tool: self.name.clone(),
                code,
                stderr,
            });
        }
        Ok(ToolOutput {
            code,
            stdout: output.stdout,
            stderr,
        })
    }

    /// Start with piped stdin and stdout; stderr is collected in the background.
    pub fn spawn_piped(&self) -> Result<ToolProcess, ToolError> {
        debug!("spawning {}", self.display());
        let mut child = self
            .build()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.name.clone(),
                source,
            })?;
        let stderr = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });
        Ok(ToolProcess {
            name: self.name.clone(),
            success_codes: self.success_codes.clone(),
            child,
            stderr,
        })
    }
}

/// A running tool with piped stdin/stdout.
pub struct ToolProcess {
    name: String,
    success_codes: Vec<i32>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl ToolProcess {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }

    /// Kill the process; used once the caller has read everything it needs.
    pub fn kill(mut self) -> String {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.collect_stderr()
    }

    /// Wait for exit and check the exit code.
    pub fn wait(mut self) -> Result<String, ToolError> {
        let status = self.child.wait().map_err(|source| ToolError::Io {
            tool: self.name.clone(),
            source,
        })?;
        let stderr = self.collect_stderr();
        let code = status.code();
        if !code.is_some_and(|c| self.success_codes.contains(&c)) {
            return Err(ToolError::Exit {
                tool: self.name,
                code,
                stderr,
            });
        }
        Ok(stderr)
    }
}
