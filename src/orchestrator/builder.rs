//! Prepared-bundle construction.
//!
//! Building a bundle is the expensive step behind the cache: resolving
//! include sources and registering modules into a mount plan. The trait
//! seam lets tests substitute builders that count invocations or fail on
//! demand.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use tracing::{debug, info_span};

use crate::bundle::{include_kind, BundleContent};
use crate::models::bundle::{MountEntry, MountPlan, PreparedBundle};
use crate::{AppError, Result};

/// Capability that turns validated bundle content into a prepared bundle.
pub trait BundleBuilder: Send + Sync {
    /// Build the prepared bundle for one fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CacheBuild`](crate::AppError::CacheBuild) when
    /// resolution fails (e.g. a remote include cannot be fetched).
    fn build(
        &self,
        config_id: &str,
        fingerprint: &str,
        content: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PreparedBundle>> + Send + '_>>;
}

/// Default builder: resolves includes and module registries into a
/// deterministic [`MountPlan`].
#[derive(Debug, Clone, Default)]
pub struct MountPlanBuilder;

impl MountPlanBuilder {
    fn build_plan(content: &BundleContent) -> Result<MountPlan> {
        let mut plan = MountPlan::default();

        for source in &content.includes {
            let kind = include_kind(source).ok_or_else(|| {
                AppError::CacheBuild(format!("include '{source}' has no resolvable source kind"))
            })?;
            // First occurrence wins; duplicate declarations mount once.
            if plan.mounts.iter().all(|mount| mount.source != *source) {
                plan.mounts.push(MountEntry {
                    source: source.clone(),
                    kind,
                });
            }
        }

        plan.providers = content.providers.iter().map(|e| e.module.clone()).collect();
        plan.tools = content.tools.iter().map(|e| e.module.clone()).collect();
        plan.hooks = content.hooks.iter().map(|e| e.module.clone()).collect();
        plan.providers.sort();
        plan.tools.sort();
        plan.hooks.sort();

        Ok(plan)
    }
}

impl BundleBuilder for MountPlanBuilder {
    fn build(
        &self,
        config_id: &str,
        fingerprint: &str,
        content: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PreparedBundle>> + Send + '_>> {
        let config_id = config_id.to_owned();
        let fingerprint = fingerprint.to_owned();
        let content = content.to_owned();
        Box::pin(async move {
            let span = info_span!("bundle_build", config_id, fingerprint);
            let _guard = span.enter();

            let parsed = BundleContent::parse(&content)
                .map_err(|err| AppError::CacheBuild(format!("bundle content unusable: {err}")))?;
            parsed
                .validate()
                .map_err(|err| AppError::CacheBuild(format!("bundle content invalid: {err}")))?;

            let mount_plan = Self::build_plan(&parsed)?;
            debug!(
                mounts = mount_plan.mounts.len(),
                tools = mount_plan.tools.len(),
                providers = mount_plan.providers.len(),
                "mount plan resolved"
            );

            Ok(PreparedBundle {
                fingerprint,
                config_id,
                mount_plan,
                built_at: Utc::now(),
            })
        })
    }
}
