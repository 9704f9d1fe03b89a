//! Durable storage: config records, crash-safe session records, retention.

pub mod config_store;
pub mod retention;
pub mod session_store;

use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

pub use config_store::ConfigStore;
pub use retention::spawn_retention_task;
pub use session_store::SessionStore;

use crate::{AppError, Result};

/// Derive a deterministic, filesystem-safe namespace slug for a project
/// identifier.
///
/// Distinct identifiers yield distinct slugs: the readable prefix is
/// lossy, so an 8-hex-char digest of the full identifier is appended.
///
/// # Errors
///
/// Returns `AppError::Validation` for identifiers that are empty or carry
/// path-traversal material (separators, `..`, NUL).
pub fn project_slug(identifier: &str) -> Result<String> {
    if identifier.is_empty() {
        return Err(AppError::Validation("project identifier is empty".into()));
    }
    if identifier.contains('/')
        || identifier.contains('\\')
        || identifier.contains('\0')
        || identifier.contains("..")
    {
        return Err(AppError::Validation(format!(
            "project identifier '{identifier}' contains path-traversal material"
        )));
    }

    let readable: String = identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(32)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    Ok(format!("{readable}-{}", &digest[..8]))
}

/// Write `bytes` to `path` atomically: stage to a temp file in the same
/// directory, flush, copy the current canonical file (if any) to `backup`,
/// then promote via atomic rename.
///
/// A crash before promotion leaves the prior canonical record intact; a
/// reader never observes a partially written file.
///
/// # Errors
///
/// Returns `AppError::Io` on any staging, backup, or promotion failure.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], backup: Option<&Path>) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|err| AppError::Io(format!("failed to create {}: {err}", parent.display())))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(bytes)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.flush()
        .map_err(|err| AppError::Io(format!("failed to flush temporary file: {err}")))?;

    if let Some(backup_path) = backup {
        if path.exists() {
            fs::copy(path, backup_path).map_err(|err| {
                AppError::Io(format!(
                    "failed to back up {} before promotion: {err}",
                    path.display()
                ))
            })?;
        }
    }

    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("failed to persist {}: {err}", path.display())))?;

    Ok(())
}
