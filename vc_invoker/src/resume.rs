use anyhow::{Context, Result};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Per-run store of finished stage results: `{cache_dir}/{run_id}/{stage}.json`.
#[derive(Debug, Clone)]
pub struct ResumeCache {
    dir: PathBuf,
    enabled: bool,
}

impl ResumeCache {
    pub fn new(cache_dir: &Path, run_id: &str, enabled: bool) -> Self {
        ResumeCache {
            dir: cache_dir.join(run_id),
            enabled,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{stage}.json"))
    }

    /// The saved result of `stage`, if any. Unreadable entries are ignored.
    pub fn load<T: DeserializeOwned>(&self, stage: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let path = self.path(stage);
        let body = fs::read(&path).ok()?;
        match serde_json::from_slice(&body) {
            Ok(value) => {
                info!("{stage}: loaded result from {}", path.display());
                Some(value)
            }
            Err(e) => {
                warn!("{stage}: ignoring unreadable resume entry {}: {e}", path.display());
                None
            }
        }
    }

    /// Forget the saved result of `stage`.
    pub fn remove(&self, stage: &str) -> Result<()> {
        let path = self.path(stage);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("removing {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    /// Persist the result of `stage`. The file is replaced atomically.
    pub fn save<T: Serialize>(&self, stage: &str, value: &T) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).with_context(|| self.dir.display().to_string())?;
        let path = self.path(stage);
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.persist(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
