//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / removal boilerplate.

use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Whether a regular file exists at `path`.
pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Size of the file at `path` in bytes.
pub async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| io_error("reading metadata of", path, e))
}

/// Remove a file, treating an already missing file as success.
pub async fn remove_file_quiet(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.ts");
        remove_file_quiet(&path).await;
        assert!(!file_exists(&path).await);
    }

    #[tokio::test]
    async fn test_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.ts");
        tokio::fs::write(&path, b"12345").await.unwrap();
        assert_eq!(file_size(&path).await.unwrap(), 5);
        assert!(file_size(&dir.path().join("b.ts")).await.unwrap_err().is_not_found_io());
    }
}
