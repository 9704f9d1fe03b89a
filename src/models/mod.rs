//! Domain entities shared across the crate.

pub mod bundle;
pub mod config;
pub mod session;

pub use bundle::{MountEntry, MountPlan, PreparedBundle};
pub use config::Config;
pub use session::{Session, SessionStatus, TranscriptEntry, TranscriptRole};
