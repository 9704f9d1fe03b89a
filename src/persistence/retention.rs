//! Retention service for time-based session purge.
//!
//! Runs as a background task deleting terminal sessions older than
//! `retention_days` from every tracked project namespace.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::session_store::SessionStore;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it removes, for every project in
/// `projects`, terminal sessions last modified more than `retention_days`
/// ago.
#[must_use]
pub fn spawn_retention_task(
    store: SessionStore,
    projects: Vec<String>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&store, &projects, retention_days) {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

fn purge(store: &SessionStore, projects: &[String], retention_days: u32) -> Result<()> {
    let age = chrono::Duration::days(i64::from(retention_days));
    let mut total = 0;
    for project in projects {
        total += store.delete_older_than(project, age)?;
    }
    if total > 0 {
        info!(retention_days, total, "retention purge completed");
    }
    Ok(())
}
