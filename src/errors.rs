//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Service settings parsing or validation failure.
    Settings(String),
    /// Malformed or structurally conflicting Config content, or a bad merge
    /// input to the resolver.
    Validation(String),
    /// Requested config or session does not exist.
    NotFound(String),
    /// Conflicting declaration (e.g. a spawn override supplying both a tool
    /// allow-list and an exclude-list) that the caller must resolve.
    Conflict(String),
    /// Both the canonical session record and its backup failed to parse.
    StorageCorruption(String),
    /// Prepared-bundle build failure, surfaced to every single-flight waiter.
    CacheBuild(String),
    /// Execution-engine failure during a message exchange.
    Engine(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Settings(msg) => write!(f, "settings: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::StorageCorruption(msg) => write!(f, "storage corruption: {msg}"),
            Self::CacheBuild(msg) => write!(f, "cache build: {msg}"),
            Self::Engine(msg) => write!(f, "engine: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Settings(format!("invalid settings: {err}"))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Validation(format!("invalid bundle content: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("serialization failed: {err}"))
    }
}
