use crate::command::ToolCommand;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Names of the binaries and scripts the pipeline invokes.
pub mod names {
    pub const GEM_INDEXER: &str = "gem-indexer";
    pub const GZTOOL: &str = "gztool";
    pub const FASTQ_DUMP: &str = "fastq-dump";
    pub const ALIGNER: &str = "map_index_and_filter_map_file_cmd_awsruntime.sh";
    pub const BINARY_REDUCER: &str = "binary_reducer.sh";
    pub const MERGE_ALIGNMENT_METRICS: &str = "merge_gem_alignment_metrics.sh";
    pub const FILTER_MERGED_INDEX: &str = "filter_merged_index.sh";
    pub const INDEX_CORRECTION: &str = "map_file_index_correction.sh";
    pub const PILEUP: &str = "gempileup_run.sh";
    pub const MPILEUP_MERGE: &str = "mpileup_merge_reducev3_nosinple.sh";
}

/// Resolves tool names against an optional tools directory, falling back to
/// `PATH`. When a directory is set it is also prepended to the `PATH` of every
/// child, so scripts that call each other by name find their siblings.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    tools_dir: Option<PathBuf>,
}

impl ToolPaths {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        ToolPaths { tools_dir }
    }

    pub fn tools_dir(&self) -> Option<&Path> {
        self.tools_dir.as_deref()
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        match &self.tools_dir {
            Some(dir) if dir.join(name).is_file() => dir.join(name),
            _ => PathBuf::from(name),
        }
    }

    pub fn command(&self, name: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(name, self.resolve(name));
        if let Some(dir) = &self.tools_dir {
            let mut path = OsString::from(dir.as_os_str());
            if let Some(current) = std::env::var_os("PATH") {
                path.push(":");
                path.push(current);
            }
            cmd = cmd.env("PATH", path);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gztool"), "#!/bin/sh\n").unwrap();
        let tools = ToolPaths::new(Some(dir.path().to_path_buf()));
        assert_eq!(tools.resolve("gztool"), dir.path().join("gztool"));
        assert_eq!(tools.resolve("fastq-dump"), PathBuf::from("fastq-dump"));
        assert_eq!(
            ToolPaths::default().resolve(names::GEM_INDEXER),
            PathBuf::from("gem-indexer")
        );
    }
}
