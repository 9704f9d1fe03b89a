//! Content-addressed prepared-bundle cache with single-flight builds.
//!
//! At most one build runs per fingerprint: concurrent requesters await the
//! in-flight build and share its outcome. Failed outcomes are delivered to
//! every waiter but never cached, so the next request for that fingerprint
//! starts a fresh build attempt.
//!
//! The cache is a process-scoped object owned by whoever constructs it —
//! there is no ambient singleton. Eviction is safe at any time because
//! sessions hold only fingerprints, never the artifact.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::models::bundle::PreparedBundle;
use crate::{AppError, Result};

type BuildOutcome = std::result::Result<Arc<PreparedBundle>, String>;

struct Slot {
    config_id: String,
    cell: Arc<OnceCell<BuildOutcome>>,
}

/// Cache mapping config fingerprints to prepared bundles.
pub struct BundleCache {
    slots: Mutex<HashMap<String, Slot>>,
    capacity: usize,
}

impl BundleCache {
    /// Create a cache bounded to roughly `capacity` completed entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Return the cached bundle for `fingerprint`, or run `build` to
    /// produce it.
    ///
    /// Single-flight: if a build for this fingerprint is already in
    /// progress the caller awaits it and shares its result, success or
    /// failure, rather than triggering a duplicate build.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheBuild` when the (possibly shared) build
    /// fails. The failure is not retried automatically; resubmitting starts
    /// a new attempt.
    pub async fn get_or_build<F, Fut>(
        &self,
        config_id: &str,
        fingerprint: &str,
        build: F,
    ) -> Result<Arc<PreparedBundle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreparedBundle>>,
    {
        let cell = {
            let mut slots = self.slots.lock().await;
            if !slots.contains_key(fingerprint) && slots.len() >= self.capacity {
                evict_one_completed(&mut slots);
            }
            let slot = slots.entry(fingerprint.to_owned()).or_insert_with(|| Slot {
                config_id: config_id.to_owned(),
                cell: Arc::new(OnceCell::new()),
            });
            Arc::clone(&slot.cell)
        };

        let outcome = cell
            .get_or_init(|| async {
                debug!(fingerprint, config_id, "building prepared bundle");
                match build().await {
                    Ok(bundle) => Ok(Arc::new(bundle)),
                    Err(err) => Err(err.to_string()),
                }
            })
            .await
            .clone();

        match outcome {
            Ok(bundle) => Ok(bundle),
            Err(message) => {
                // Drop the failed cell so the next request rebuilds, but only
                // if it has not already been replaced by a newer attempt.
                let mut slots = self.slots.lock().await;
                let stale = slots
                    .get(fingerprint)
                    .is_some_and(|slot| Arc::ptr_eq(&slot.cell, &cell));
                if stale {
                    slots.remove(fingerprint);
                }
                Err(AppError::CacheBuild(message))
            }
        }
    }

    /// Look up a cached bundle without building.
    pub async fn get(&self, fingerprint: &str) -> Option<Arc<PreparedBundle>> {
        let slots = self.slots.lock().await;
        slots
            .get(fingerprint)
            .and_then(|slot| slot.cell.get())
            .and_then(|outcome| outcome.as_ref().ok().cloned())
    }

    /// Eagerly evict every entry built from `config_id`.
    ///
    /// Returns the number of entries removed. In-flight builds keep running
    /// for their current waiters; only the cache references are dropped.
    pub async fn invalidate(&self, config_id: &str) -> usize {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| slot.config_id != config_id);
        let removed = before - slots.len();
        if removed > 0 {
            info!(config_id, removed, "invalidated cached bundles");
        }
        removed
    }

    /// Remove a single fingerprint entry.
    pub async fn remove(&self, fingerprint: &str) -> bool {
        self.slots.lock().await.remove(fingerprint).is_some()
    }

    /// Drop every cache entry.
    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    /// Number of entries currently tracked (completed or in flight).
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

fn evict_one_completed(slots: &mut HashMap<String, Slot>) {
    let victim = slots
        .iter()
        .find(|(_, slot)| matches!(slot.cell.get(), Some(Ok(_))))
        .map(|(key, _)| key.clone());
    if let Some(key) = victim {
        debug!(fingerprint = key, "evicting completed bundle at capacity");
        slots.remove(&key);
    }
}
