#![forbid(unsafe_code)]

//! `agent-foundry` — declarative agent runtime bundles.
//!
//! Callers define a reusable runtime configuration (a YAML bundle of
//! includes, providers, tools, hooks and session policy) and instantiate
//! lightweight sessions against it, including correlated sub-sessions for
//! agent delegation. The heavy lifting lives in the content-addressed
//! prepared-bundle cache (single-flight builds), the crash-safe session
//! store (atomic writes with backup recovery) and the spawner's
//! deterministic per-agent override merging.

pub mod bundle;
pub mod cache;
pub mod engine;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod resolver;
pub mod settings;

pub use errors::{AppError, Result};
pub use settings::Settings;
