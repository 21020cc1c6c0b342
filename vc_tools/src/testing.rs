//! Helpers for tests that stand in fake tools for the real binaries.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .with_context(|| path.display().to_string())?;
    set_executable(&path)?;
    Ok(path)
}

/// Set the executable bits (unix only).
pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(path, permissions)
            .with_context(|| path.display().to_string())?;
    }
    Ok(())
}
