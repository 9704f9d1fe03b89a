//! Crash-safe session persistence with backup-based corruption recovery.
//!
//! Every write stages to a temp file, flushes, copies the prior canonical
//! record to a `.backup` sibling, then promotes atomically. Reads fall back
//! to the backup when the canonical record fails to parse and only surface
//! `StorageCorruption` when both copies are unreadable.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::models::session::Session;
use crate::settings::Settings;
use crate::{AppError, Result};

use super::{project_slug, write_atomic};

/// Nesting depth beyond which payload subtrees are stringified.
const MAX_PAYLOAD_DEPTH: usize = 64;

/// File-backed store of [`Session`] records, namespaced per project.
///
/// Layout: `<data_dir>/projects/<slug>/sessions/<session_id>.json` plus a
/// `.json.backup` sibling holding the previous committed version.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the session store under
    /// `settings.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store root cannot be created.
    pub fn open(settings: &Settings) -> Result<Self> {
        let root = settings.data_dir.join("projects");
        fs::create_dir_all(&root)
            .map_err(|err| AppError::Io(format!("failed to create session root: {err}")))?;
        Ok(Self { root })
    }

    /// Persist a session record with the atomic-write protocol.
    ///
    /// Transcript payloads are sanitized before serialization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an invalid project identifier or
    /// `AppError::Io` on write failure.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.record_path(&session.project, &session.session_id)?;
        let backup = backup_path(&path);

        let mut record = session.clone();
        for entry in &mut record.transcript {
            entry.content = sanitize_payload(entry.content.clone());
        }

        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&path, &bytes, Some(&backup))
    }

    /// Load a session, recovering from the backup if the canonical record
    /// is corrupt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists,
    /// `AppError::StorageCorruption` if both canonical and backup copies
    /// fail to parse.
    pub fn load(&self, project: &str, session_id: &str) -> Result<Session> {
        let path = self.record_path(project, session_id)?;
        if !path.exists() {
            return Err(AppError::NotFound(format!(
                "session {session_id} not found in project {project}"
            )));
        }

        match read_record(&path) {
            Ok(session) => Ok(session),
            Err(canonical_err) => {
                let backup = backup_path(&path);
                warn!(
                    session_id,
                    error = %canonical_err,
                    "canonical session record unreadable, trying backup"
                );
                read_record(&backup).map_err(|backup_err| {
                    AppError::StorageCorruption(format!(
                        "session {session_id}: canonical ({canonical_err}) and backup \
                         ({backup_err}) records both unreadable"
                    ))
                })
            }
        }
    }

    /// List a project's sessions, most recently modified first.
    ///
    /// Records that are unreadable in both copies are skipped with a
    /// warning rather than failing the whole listing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an invalid project identifier or
    /// `AppError::Io` if the namespace directory cannot be read.
    pub fn list(&self, project: &str) -> Result<Vec<Session>> {
        let dir = self.sessions_dir(project)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let entries = fs::read_dir(&dir)
            .map_err(|err| AppError::Io(format!("failed to read session dir: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| AppError::Io(err.to_string()))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(project, stem) {
                Ok(session) => sessions.push(session),
                Err(err) => warn!(record = stem, %err, "skipping unreadable session record"),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// List every session record across all project namespaces.
    ///
    /// Session records are durable, so referential checks must see
    /// sessions created by earlier processes, not just namespaces this
    /// process has touched. Unreadable records are skipped with a warning,
    /// as in [`list`](Self::list).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a namespace directory cannot be read.
    pub fn list_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let namespaces = fs::read_dir(&self.root)
            .map_err(|err| AppError::Io(format!("failed to read session root: {err}")))?;
        for namespace in namespaces {
            let namespace = namespace.map_err(|err| AppError::Io(err.to_string()))?;
            let dir = namespace.path().join("sessions");
            if !dir.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .map_err(|err| AppError::Io(format!("failed to read session dir: {err}")))?;
            for entry in entries {
                let entry = entry.map_err(|err| AppError::Io(err.to_string()))?;
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match read_record(&path).or_else(|_| read_record(&backup_path(&path))) {
                    Ok(session) => sessions.push(session),
                    Err(err) => {
                        warn!(record = %path.display(), %err, "skipping unreadable session record");
                    }
                }
            }
        }
        Ok(sessions)
    }

    /// Delete a session record and its backup.
    ///
    /// Returns `false` if no such record existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an invalid project identifier or
    /// `AppError::Io` on removal failure.
    pub fn delete(&self, project: &str, session_id: &str) -> Result<bool> {
        let path = self.record_path(project, session_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .map_err(|err| AppError::Io(format!("failed to delete session record: {err}")))?;
        let backup = backup_path(&path);
        if backup.exists() {
            fs::remove_file(&backup)
                .map_err(|err| AppError::Io(format!("failed to delete session backup: {err}")))?;
        }
        Ok(true)
    }

    /// Delete terminal sessions whose last modification is older than `age`.
    ///
    /// Active sessions are never purged regardless of age.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an invalid project identifier or
    /// `AppError::Io` on listing/removal failure.
    pub fn delete_older_than(&self, project: &str, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - age;
        let mut removed = 0;
        for session in self.list(project)? {
            if session.status.is_terminal()
                && session.updated_at < cutoff
                && self.delete(project, &session.session_id)?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(project, removed, "purged expired sessions");
        }
        Ok(removed)
    }

    fn sessions_dir(&self, project: &str) -> Result<PathBuf> {
        let slug = project_slug(project)?;
        Ok(self.root.join(slug).join("sessions"))
    }

    fn record_path(&self, project: &str, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty() || session_id.contains('/') || session_id.contains("..") {
            return Err(AppError::Validation(format!(
                "session id '{session_id}' is not a valid record key"
            )));
        }
        Ok(self.sessions_dir(project)?.join(format!("{session_id}.json")))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".backup");
    PathBuf::from(backup)
}

fn read_record(path: &Path) -> std::result::Result<Session, String> {
    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&raw).map_err(|err| err.to_string())
}

/// Recursively convert a transcript payload into a form that is safe to
/// persist.
///
/// Primitives and containers pass through unchanged; subtrees nested past
/// [`MAX_PAYLOAD_DEPTH`] are stringified. The walk is deterministic and
/// lossless for every value it accepts within the depth cap.
#[must_use]
pub fn sanitize_payload(value: Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: Value, depth: usize) -> Value {
    if depth >= MAX_PAYLOAD_DEPTH {
        // Only containers carry further nesting; primitives at the cap
        // pass through so sanitization is idempotent.
        return match value {
            container @ (Value::Array(_) | Value::Object(_)) => {
                Value::String(container.to_string())
            }
            primitive => primitive,
        };
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_at(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut sanitized = Map::with_capacity(map.len());
            for (key, item) in map {
                sanitized.insert(key, sanitize_at(item, depth + 1));
            }
            Value::Object(sanitized)
        }
        primitive => primitive,
    }
}
