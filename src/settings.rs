//! Service settings parsing, validation, and secret-key lookup.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

fn default_retention_days() -> u32 {
    30
}

fn default_cache_capacity() -> usize {
    64
}

fn default_secret_key_env() -> String {
    "AGENT_FOUNDRY_SECRET_KEY".into()
}

/// Service settings parsed from `settings.toml`.
///
/// These configure the foundry process itself, not the declarative agent
/// bundles it stores; those are the [`Config`](crate::models::Config) domain
/// entities managed by the config store.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    /// Root directory for persisted configs and session namespaces.
    pub data_dir: PathBuf,
    /// Days after a session reaches a terminal state before it is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Maximum prepared bundles retained before eager eviction kicks in.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Environment variable holding the key that gates secret-bearing
    /// bundle sections. Only presence is checked here; the encryption
    /// mechanism lives outside this crate.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
}

impl Settings {
    /// Load and validate settings from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Settings` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Settings(format!("failed to read settings: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse settings from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Settings` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Construct settings rooted at an existing directory, using defaults
    /// for everything else.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Settings` if `data_dir` cannot be canonicalized.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut settings = Self {
            data_dir: data_dir.into(),
            retention_days: default_retention_days(),
            cache_capacity: default_cache_capacity(),
            secret_key_env: default_secret_key_env(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Value of the configured secret-key environment variable, if set
    /// and non-empty.
    #[must_use]
    pub fn secret_key(&self) -> Option<String> {
        env::var(&self.secret_key_env).ok().filter(|v| !v.is_empty())
    }

    fn validate(&mut self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(AppError::Settings(
                "retention_days must be greater than zero".into(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(AppError::Settings(
                "cache_capacity must be greater than zero".into(),
            ));
        }

        if self.secret_key_env.is_empty() {
            return Err(AppError::Settings("secret_key_env must not be empty".into()));
        }

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Settings(format!("cannot create data_dir: {err}")))?;
        let canonical = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Settings(format!("data_dir invalid: {err}")))?;
        self.data_dir = canonical;

        Ok(())
    }
}
