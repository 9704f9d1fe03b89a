//! Session orchestration: bundle building, session lifecycle, spawning.

pub mod builder;
pub mod session_manager;
pub mod spawner;

pub use builder::{BundleBuilder, MountPlanBuilder};
pub use session_manager::SessionManager;
pub use spawner::{SessionSpawner, SpawnOutcome, SpawnRequest};
