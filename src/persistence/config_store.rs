//! Config record CRUD with full structural re-validation before commit.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, info_span};

use crate::bundle::{BundleContent, ModuleEntry};
use crate::models::config::{Config, ConfigUpdate};
use crate::settings::Settings;
use crate::{AppError, Result};

use super::write_atomic;

/// File-backed store of [`Config`] records.
///
/// Records live as JSON under `<data_dir>/configs/<config_id>.json` and are
/// written with the same staged-then-promote discipline as session records.
/// Every mutation re-validates the full bundle content before commit; on
/// failure the stored record is unchanged.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    /// Open (creating if needed) the config store under `settings.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store directory cannot be created.
    pub fn open(settings: &Settings) -> Result<Self> {
        let dir = settings.data_dir.join("configs");
        fs::create_dir_all(&dir)
            .map_err(|err| AppError::Io(format!("failed to create config dir: {err}")))?;
        Ok(Self {
            dir,
            settings: settings.clone(),
        })
    }

    /// Validate bundle text against the structural rules and the secrets
    /// gate, returning the parsed content.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` on malformed or conflicting content,
    /// or when secret-bearing sections are present without the secret key
    /// environment variable.
    pub fn validate_content(&self, content: &str) -> Result<BundleContent> {
        let parsed = BundleContent::parse(content)?;
        parsed.validate()?;
        if parsed.has_secrets() && self.settings.secret_key().is_none() {
            return Err(AppError::Validation(format!(
                "bundle declares secrets but {} is not set",
                self.settings.secret_key_env
            )));
        }
        Ok(parsed)
    }

    /// Create a new config record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the content fails structural
    /// validation, or `AppError::Io` on persistence failure.
    pub fn create(
        &self,
        name: &str,
        content: &str,
        description: Option<String>,
        tags: BTreeMap<String, String>,
    ) -> Result<Config> {
        let span = info_span!("config_create", name);
        let _guard = span.enter();

        self.validate_content(content)?;
        let config = Config::new(name.to_owned(), content.to_owned(), description, tags);
        self.persist(&config)?;

        info!(config_id = config.config_id, "config created");
        Ok(config)
    }

    /// Retrieve a config by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such record exists.
    pub fn get(&self, config_id: &str) -> Result<Config> {
        let path = self.record_path(config_id)?;
        if !path.exists() {
            return Err(AppError::NotFound(format!("config {config_id} not found")));
        }
        let raw = fs::read_to_string(&path)
            .map_err(|err| AppError::Io(format!("failed to read config record: {err}")))?;
        serde_json::from_str(&raw)
            .map_err(|err| AppError::Io(format!("config record {config_id} unreadable: {err}")))
    }

    /// Apply a partial update, re-validating full content before commit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::Validation` if the replacement content fails validation;
    /// the stored record is unchanged on failure.
    pub fn update(&self, config_id: &str, fields: ConfigUpdate) -> Result<Config> {
        let span = info_span!("config_update", config_id);
        let _guard = span.enter();

        let mut config = self.get(config_id)?;
        if let Some(name) = fields.name {
            config.name = name;
        }
        if let Some(description) = fields.description {
            config.description = Some(description);
        }
        if let Some(tags) = fields.tags {
            config.tags = tags;
        }
        if let Some(content) = fields.content {
            config.content = content;
        }

        self.validate_content(&config.content)?;
        config.updated_at = Utc::now();
        self.persist(&config)?;

        info!(config_id, "config updated");
        Ok(config)
    }

    /// Delete a config record.
    ///
    /// Referential integrity against live sessions is enforced by the
    /// session manager, which can see both stores.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or `AppError::Io` on
    /// removal failure.
    pub fn delete(&self, config_id: &str) -> Result<bool> {
        let path = self.record_path(config_id)?;
        if !path.exists() {
            return Err(AppError::NotFound(format!("config {config_id} not found")));
        }
        fs::remove_file(&path)
            .map_err(|err| AppError::Io(format!("failed to delete config record: {err}")))?;
        info!(config_id, "config deleted");
        Ok(true)
    }

    /// List configs ordered by creation time, oldest first.
    ///
    /// Returns one page of records plus the total count before paging.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store directory cannot be read.
    pub fn list(&self, limit: usize, offset: usize) -> Result<(Vec<Config>, usize)> {
        let mut configs = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| AppError::Io(format!("failed to read config dir: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| AppError::Io(err.to_string()))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .map_err(|err| AppError::Io(format!("failed to read config record: {err}")))?;
            if let Ok(config) = serde_json::from_str::<Config>(&raw) {
                configs.push(config);
            }
        }

        configs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.config_id.cmp(&b.config_id))
        });
        let total = configs.len();
        let page = configs.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    /// Read-modify-write: add a tool registry entry to the bundle content.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::Validation` if the mutated content fails re-validation.
    pub fn add_tool(&self, config_id: &str, entry: ModuleEntry) -> Result<Config> {
        self.mutate_content(config_id, |content| content.add_tool(entry))
    }

    /// Read-modify-write: add a provider registry entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::Validation` if the mutated content fails re-validation.
    pub fn add_provider(&self, config_id: &str, entry: ModuleEntry) -> Result<Config> {
        self.mutate_content(config_id, |content| content.add_provider(entry))
    }

    /// Read-modify-write: merge an include reference, deduplicated by
    /// source identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or
    /// `AppError::Validation` if the source is unrecognized.
    pub fn merge_include(&self, config_id: &str, source: &str) -> Result<Config> {
        self.mutate_content(config_id, |content| content.merge_include(source).map(|_| ()))
    }

    fn mutate_content(
        &self,
        config_id: &str,
        mutate: impl FnOnce(&mut BundleContent) -> Result<()>,
    ) -> Result<Config> {
        let config = self.get(config_id)?;
        let mut parsed = BundleContent::parse(&config.content)?;
        mutate(&mut parsed)?;
        let rewritten = parsed.to_yaml()?;
        self.update(
            config_id,
            ConfigUpdate {
                content: Some(rewritten),
                ..ConfigUpdate::default()
            },
        )
    }

    fn persist(&self, config: &Config) -> Result<()> {
        let path = self.record_path(&config.config_id)?;
        let bytes = serde_json::to_vec_pretty(config)?;
        write_atomic(&path, &bytes, None)
    }

    fn record_path(&self, config_id: &str) -> Result<PathBuf> {
        if config_id.is_empty() || config_id.contains('/') || config_id.contains("..") {
            return Err(AppError::Validation(format!(
                "config id '{config_id}' is not a valid record key"
            )));
        }
        Ok(self.dir.join(format!("{config_id}.json")))
    }
}
