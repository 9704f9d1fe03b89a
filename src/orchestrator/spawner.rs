//! Sub-session spawning for agent delegation.
//!
//! Spawned sessions are correlated with their ancestry: the root session's
//! 128-bit trace id is shared down the whole delegation tree while every
//! node carries a fresh span id, so cross-session correlation needs no
//! central registry. Per-agent overrides merge onto the agent's base
//! config with the smart-single-value rule before the child's bundle is
//! prepared.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, info_span};

use crate::models::session::{Session, TranscriptEntry};
use crate::resolver::merge_values;
use crate::{AppError, Result};

use super::session_manager::SessionManager;

/// One delegation request.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Name of the agent to delegate to; must be registered.
    pub agent: String,
    /// Instruction delivered as the child session's next user message.
    pub instruction: String,
    /// Per-invocation config overrides merged onto the agent's base
    /// config. Scalars replace, lists union by identity, maps merge
    /// recursively.
    pub overrides: Map<String, Value>,
}

impl SpawnRequest {
    /// Construct a request with no overrides.
    #[must_use]
    pub fn new(agent: &str, instruction: &str) -> Self {
        Self {
            agent: agent.to_owned(),
            instruction: instruction.to_owned(),
            overrides: Map::new(),
        }
    }
}

/// Result of one delegated turn.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    /// Child session state after the exchange.
    pub session: Session,
    /// The agent's response entry.
    pub response: TranscriptEntry,
}

/// Creates correlated sub-sessions and drives delegated turns through the
/// session manager.
pub struct SessionSpawner {
    manager: Arc<SessionManager>,
}

impl SessionSpawner {
    /// Wrap a session manager.
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Delegate `request.instruction` to the named agent under `parent`.
    ///
    /// Resolves the merged agent config, creates (or reuses) a child
    /// session in the parent's project namespace, and executes the
    /// instruction. Subsequent delegated turns to the same agent instance
    /// reuse the same child session id, giving multi-turn resumption;
    /// children may themselves spawn, so delegation recurses naturally.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unregistered agent,
    /// `AppError::Conflict` when the overrides declare both a tool
    /// allow-list and an exclude-list (no child session is created), or
    /// any session-manager error from the exchange itself.
    pub async fn spawn(
        &self,
        parent: &Session,
        request: SpawnRequest,
        agent_configs: &BTreeMap<String, String>,
    ) -> Result<SpawnOutcome> {
        let span = info_span!("spawn", agent = request.agent, parent = parent.session_id);
        let _guard = span.enter();

        let config_id = agent_configs.get(&request.agent).ok_or_else(|| {
            AppError::NotFound(format!("agent '{}' is not registered", request.agent))
        })?;

        let overrides = Value::Object(request.overrides.clone());
        if has_allow_exclude_conflict(&overrides) {
            return Err(AppError::Conflict(format!(
                "spawn overrides for agent '{}' declare both tools and exclude_tools",
                request.agent
            )));
        }

        let base = self.manager.config_store().get(config_id)?;
        let base_value: Value = serde_yaml::from_str(&base.content)?;
        let merged = merge_values(base_value, overrides);
        if spawn_policy_conflict(&merged) {
            return Err(AppError::Conflict(format!(
                "merged config for agent '{}' declares both tools and exclude_tools",
                request.agent
            )));
        }
        let merged_text = serde_yaml::to_string(&merged)?;

        let child = match self.find_child(parent, &request.agent)? {
            Some(existing) => existing,
            None => {
                self.manager
                    .create_child_session(parent, &request.agent, config_id, &merged_text)
                    .await?
            }
        };

        let response = self
            .manager
            .send_message(
                &parent.project,
                &child.session_id,
                Value::String(request.instruction),
            )
            .await?;
        let session = self
            .manager
            .session_store()
            .load(&parent.project, &child.session_id)?;

        info!(
            session_id = session.session_id,
            trace_id = session.trace_id,
            span_id = session.span_id,
            "delegated turn completed"
        );
        Ok(SpawnOutcome { session, response })
    }

    /// Find a live child of `parent` for `agent`, keyed on the parent's
    /// span id so each delegation site gets its own agent instance.
    fn find_child(&self, parent: &Session, agent: &str) -> Result<Option<Session>> {
        let children = self.manager.session_store().list(&parent.project)?;
        Ok(children.into_iter().find(|s| {
            s.agent.as_deref() == Some(agent)
                && s.parent_span_id.as_deref() == Some(parent.span_id.as_str())
                && !s.status.is_terminal()
        }))
    }
}

/// Whether any object level of `value` declares both `tools` and
/// `exclude_tools`.
fn has_allow_exclude_conflict(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            if map.contains_key("tools") && map.contains_key("exclude_tools") {
                return true;
            }
            map.values().any(has_allow_exclude_conflict)
        }
        Value::Array(items) => items.iter().any(has_allow_exclude_conflict),
        _ => false,
    }
}

/// Whether the merged config's spawn policy ended up with both lists set.
fn spawn_policy_conflict(merged: &Value) -> bool {
    merged
        .get("spawn")
        .and_then(Value::as_object)
        .is_some_and(|spawn| {
            spawn.get("tools").is_some_and(|v| !v.is_null())
                && spawn.get("exclude_tools").is_some_and(|v| !v.is_null())
        })
}
