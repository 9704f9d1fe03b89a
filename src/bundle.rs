//! Declarative bundle content: parsing, structural validation, and
//! read-modify-write mutators.
//!
//! Validation is structural only — it checks section shape, include source
//! kinds, registry duplicates and spawn-policy conflicts, never
//! provider-specific field semantics.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::bundle::MountSource;
use crate::{AppError, Result};

/// Bundle identity section (`bundle:` top-level key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BundleIdentity {
    /// Bundle name.
    pub name: String,
    /// Optional bundle version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One registry entry in a `providers:`/`tools:`/`hooks:` section.
///
/// Provider-specific options ride along untyped in `options`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ModuleEntry {
    /// Stable module identifier; unique within its section.
    pub module: String,
    /// Module-specific options, passed through unvalidated.
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl ModuleEntry {
    /// Construct an entry with no options.
    #[must_use]
    pub fn named(module: &str) -> Self {
        Self {
            module: module.to_owned(),
            options: BTreeMap::new(),
        }
    }
}

/// Session policy section (`session:` top-level key). Required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionPolicy {
    /// Optional cap on exchanges per session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u64>,
    /// Optional system prompt prepended by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Policy fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Spawn policy section (`spawn:` top-level key). Optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SpawnPolicy {
    /// Explicit tool allow-list for spawned agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    /// Tool exclude-list; mutually exclusive with `tools`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tools: Option<Vec<String>>,
    /// Maximum delegation depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    /// Policy fields this crate does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed YAML bundle content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BundleContent {
    /// Bundle identity. Required by validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleIdentity>,
    /// Include references mounted into the prepared bundle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    /// Provider registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ModuleEntry>,
    /// Tool registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ModuleEntry>,
    /// Hook registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<ModuleEntry>,
    /// Session policy. Required by validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionPolicy>,
    /// Spawn policy for agent delegation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnPolicy>,
    /// Secret-bearing fields gated by the service secret key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, serde_yaml::Value>,
}

/// Classify an include source string, or `None` if it matches no known kind.
#[must_use]
pub fn include_kind(source: &str) -> Option<MountSource> {
    if source.starts_with("./") || source.starts_with("../") || source.starts_with('/') {
        return Some(MountSource::LocalPath);
    }
    if source.starts_with("git+")
        || source.starts_with("git@")
        || (source.starts_with("https://") || source.starts_with("http://"))
            && source.ends_with(".git")
    {
        return Some(MountSource::GitUrl);
    }
    let is_registry_name = !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if is_registry_name {
        return Some(MountSource::Registry);
    }
    None
}

impl BundleContent {
    /// Parse bundle content from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the text is not well-formed YAML
    /// matching the bundle shape.
    pub fn parse(content: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(content)?;
        Ok(parsed)
    }

    /// Serialize back to YAML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(AppError::from)
    }

    /// Whether the bundle declares any secret-bearing fields.
    #[must_use]
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Enforce the structural rules all bundles must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` on a missing required section, an
    /// unrecognized include source, a spawn policy declaring both an
    /// allow-list and an exclude-list, or duplicate module identifiers
    /// within one registry section.
    pub fn validate(&self) -> Result<()> {
        let identity = self
            .bundle
            .as_ref()
            .ok_or_else(|| AppError::Validation("missing required section: bundle".into()))?;
        if identity.name.is_empty() {
            return Err(AppError::Validation("bundle.name must not be empty".into()));
        }

        if self.session.is_none() {
            return Err(AppError::Validation("missing required section: session".into()));
        }

        for source in &self.includes {
            if include_kind(source).is_none() {
                return Err(AppError::Validation(format!(
                    "include '{source}' is not a local path, git URL, or registry bundle name"
                )));
            }
        }

        if let Some(spawn) = &self.spawn {
            if spawn.tools.is_some() && spawn.exclude_tools.is_some() {
                return Err(AppError::Validation(
                    "spawn policy declares both tools and exclude_tools".into(),
                ));
            }
        }

        check_duplicates("providers", &self.providers)?;
        check_duplicates("tools", &self.tools)?;
        check_duplicates("hooks", &self.hooks)?;

        Ok(())
    }

    /// Append a tool registry entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the module identifier already
    /// exists in the tools section.
    pub fn add_tool(&mut self, entry: ModuleEntry) -> Result<()> {
        add_module("tools", &mut self.tools, entry)
    }

    /// Append a provider registry entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the module identifier already
    /// exists in the providers section.
    pub fn add_provider(&mut self, entry: ModuleEntry) -> Result<()> {
        add_module("providers", &mut self.providers, entry)
    }

    /// Merge an include reference, deduplicating by full source string.
    ///
    /// Returns `true` if the include was appended, `false` if it was
    /// already present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the source matches no known kind.
    pub fn merge_include(&mut self, source: &str) -> Result<bool> {
        if include_kind(source).is_none() {
            return Err(AppError::Validation(format!(
                "include '{source}' is not a local path, git URL, or registry bundle name"
            )));
        }
        if self.includes.iter().any(|existing| existing == source) {
            return Ok(false);
        }
        self.includes.push(source.to_owned());
        Ok(true)
    }
}

fn check_duplicates(section: &str, entries: &[ModuleEntry]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert(entry.module.as_str()) {
            return Err(AppError::Validation(format!(
                "duplicate module '{}' in {section} section",
                entry.module
            )));
        }
    }
    Ok(())
}

fn add_module(section: &str, entries: &mut Vec<ModuleEntry>, entry: ModuleEntry) -> Result<()> {
    if entries.iter().any(|existing| existing.module == entry.module) {
        return Err(AppError::Validation(format!(
            "duplicate module '{}' in {section} section",
            entry.module
        )));
    }
    entries.push(entry);
    Ok(())
}
