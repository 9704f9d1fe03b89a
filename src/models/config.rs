//! Config entity: a named, versioned declarative runtime bundle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named declarative runtime bundle persisted by the config store.
///
/// `content` is the raw YAML bundle text exactly as supplied by the caller;
/// it is parsed for validation but stored verbatim so a `create` → `get`
/// round trip is byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Unique record identifier.
    pub config_id: String,
    /// Human-readable bundle name.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Raw YAML bundle text.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp; bumped on every content replace.
    pub updated_at: DateTime<Utc>,
    /// Free-form key/value tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Config {
    /// Construct a new config record with a generated identifier.
    #[must_use]
    pub fn new(
        name: String,
        content: String,
        description: Option<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            config_id: Uuid::new_v4().to_string(),
            name,
            description,
            content,
            created_at: now,
            updated_at: now,
            tags,
        }
    }
}

/// Partial field set applied by `ConfigStore::update`.
///
/// `None` fields are left untouched; `content` replacement is always a full
/// replace and triggers re-validation before commit.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    /// Replacement bundle name.
    pub name: Option<String>,
    /// Replacement description.
    pub description: Option<String>,
    /// Replacement bundle text (full replace).
    pub content: Option<String>,
    /// Replacement tag map (full replace).
    pub tags: Option<BTreeMap<String, String>>,
}
