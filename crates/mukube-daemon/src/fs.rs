//! Filesystem helpers: state directory bring-up and binary discovery.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Ensure `root/subdirectory` exists, is a directory and carries `mode`.
///
/// An existing directory is left untouched.
///
/// # Errors
///
/// Fails when the path cannot be created or exists but is not a directory.
pub fn ensure_dir(root: &Path, subdirectory: &str, mode: u32) -> Result<()> {
    let dir = root.join(subdirectory);

    match std::fs::DirBuilder::new().mode(mode).create(&dir) {
        Ok(()) => debug!(dir = %dir.display(), "Directory created"),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(err).with_context(|| format!("couldn't create {}", dir.display()));
        }
    }

    let info = std::fs::metadata(&dir)
        .with_context(|| format!("couldn't stat {}", dir.display()))?;
    if !info.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(())
}

/// Try to find binary `name`.
///
/// The following locations are checked in this order, first hit wins:
///
/// - `cwd/../../../third_party/<name>`
/// - `cwd/../../third_party/<name>`
/// - `cwd/../third_party/<name>`
/// - `cwd/third_party/<name>`
/// - `<app_dir>/third_party/<name>`
/// - `<extra_dir>/<name>`
///
/// # Errors
///
/// Fails when the working directory cannot be read or no location holds the
/// binary.
pub fn find_binary(name: &str, app_dir: &Path, extra_dir: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("couldn't read cwd")?;

    let mut candidates: Vec<PathBuf> = [3usize, 2, 1, 0]
        .iter()
        .map(|levels| {
            let mut dir = cwd.as_path();
            for _ in 0..*levels {
                dir = dir.parent().unwrap_or(dir);
            }
            dir.join("third_party")
        })
        .collect();
    candidates.push(app_dir.join("third_party"));
    if let Some(extra) = extra_dir {
        candidates.push(extra.to_path_buf());
    }

    for candidate in &candidates {
        let path = candidate.join(name);
        if path.exists() {
            debug!(binary = name, path = %path.display(), "Binary found");
            return Ok(path);
        }
    }

    bail!("couldn't find binary '{name}'");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dir_creates_and_tolerates_existing() {
        let root = tempfile::tempdir().unwrap();

        ensure_dir(root.path(), "state", 0o770).unwrap();
        assert!(root.path().join("state").is_dir());

        // Second call is a no-op.
        ensure_dir(root.path(), "state", 0o770).unwrap();
    }

    #[test]
    fn test_ensure_dir_rejects_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("occupied"), b"").unwrap();

        assert!(ensure_dir(root.path(), "occupied", 0o770).is_err());
    }

    #[test]
    fn test_find_binary_in_extra_dir() {
        let extra = tempfile::tempdir().unwrap();
        std::fs::write(extra.path().join("etcd"), b"#!/bin/sh\n").unwrap();

        let found = find_binary("etcd", Path::new("/nonexistent"), Some(extra.path())).unwrap();
        assert_eq!(found, extra.path().join("etcd"));
    }

    #[test]
    fn test_find_binary_missing() {
        assert!(find_binary("no_such_binary_9981", Path::new("/nonexistent"), None).is_err());
    }
}
