//! Prepared-bundle artifact and fingerprint computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute the content-addressed cache fingerprint for a config.
///
/// Hashes identity and content together so any content edit produces a new
/// key without an explicit invalidation call.
#[must_use]
pub fn fingerprint(config_id: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Source kind of a resolved include mount.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// Filesystem path relative to the bundle or absolute.
    LocalPath,
    /// Git repository URL.
    GitUrl,
    /// Named bundle from the shared registry.
    Registry,
}

/// One resolved include mount inside a mount plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MountEntry {
    /// Include source string exactly as declared.
    pub source: String,
    /// Classified source kind.
    pub kind: MountSource,
}

/// Deterministic artifact produced by resolving a bundle's content.
///
/// Lists include mounts in declaration order and the registered modules per
/// section sorted by identifier, so two builds of identical content compare
/// equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MountPlan {
    /// Resolved include mounts, declaration order, first occurrence wins.
    pub mounts: Vec<MountEntry>,
    /// Provider module identifiers, sorted.
    pub providers: Vec<String>,
    /// Tool module identifiers, sorted.
    pub tools: Vec<String>,
    /// Hook module identifiers, sorted.
    pub hooks: Vec<String>,
}

/// Cache value: the expensive resolved/mounted artifact for one fingerprint.
///
/// Owned exclusively by the bundle cache. Sessions hold only the
/// fingerprint, so eviction never corrupts a session record — resumption
/// simply rebuilds on miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBundle {
    /// Content-addressed cache key.
    pub fingerprint: String,
    /// Config this bundle was built from.
    pub config_id: String,
    /// Resolved mount-plan artifact.
    pub mount_plan: MountPlan,
    /// Build completion timestamp.
    pub built_at: DateTime<Utc>,
}
