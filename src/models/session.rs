//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate an OTel-style 128-bit trace identifier (32 lowercase hex chars).
#[must_use]
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a 64-bit span identifier (16 lowercase hex chars).
#[must_use]
pub fn new_span_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..16].to_string()
}

/// Lifecycle status for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session accepting message exchanges.
    Active,
    /// Session finished normally. Terminal.
    Completed,
    /// Session ended by an execution-engine failure. Terminal.
    Failed,
    /// Session cancelled mid-stream by the caller. Terminal.
    Cancelled,
}

impl SessionStatus {
    /// Whether this status permits no further mutation except deletion.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Sender tag on a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    /// Caller-supplied message.
    User,
    /// Execution-engine response.
    Assistant,
    /// Engine or foundry status record (e.g. a recorded engine failure).
    System,
}

/// One append-only transcript record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptEntry {
    /// Sender tag.
    pub role: TranscriptRole,
    /// Sanitized message payload.
    pub content: serde_json::Value,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Construct an entry stamped with the current time.
    #[must_use]
    pub fn new(role: TranscriptRole, content: serde_json::Value) -> Self {
        Self {
            role,
            content,
            created_at: Utc::now(),
        }
    }

    /// Construct a plain-text entry.
    #[must_use]
    pub fn text(role: TranscriptRole, text: &str) -> Self {
        Self::new(role, serde_json::Value::String(text.to_owned()))
    }
}

/// Session domain entity persisted by the session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub session_id: String,
    /// Referenced config; not owned — the session pins a prepared-bundle
    /// fingerprint, never live config text.
    pub config_id: String,
    /// Project namespace this session is persisted under.
    pub project: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub updated_at: DateTime<Utc>,
    /// Completed user→response exchanges.
    pub message_count: u64,
    /// Ordered, append-only message records.
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    /// Prepared-bundle fingerprint the session was last driven with.
    pub fingerprint: String,
    /// Trace identifier shared with the session's root ancestor.
    pub trace_id: String,
    /// Span identifier unique to this session.
    pub span_id: String,
    /// Parent span for spawned sub-sessions; `None` on roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Agent name for spawned sub-sessions; `None` on roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Session {
    /// Construct a new root session with a fresh trace.
    #[must_use]
    pub fn new(config_id: String, project: String, fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            config_id,
            project,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            message_count: 0,
            transcript: Vec::new(),
            fingerprint,
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            agent: None,
        }
    }

    /// Construct a child session correlated with `parent` for agent `agent`.
    #[must_use]
    pub fn child_of(
        parent: &Session,
        config_id: String,
        fingerprint: String,
        agent: String,
    ) -> Self {
        let mut session = Self::new(config_id, parent.project.clone(), fingerprint);
        session.trace_id = parent.trace_id.clone();
        session.parent_span_id = Some(parent.span_id.clone());
        session.agent = Some(agent);
        session
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Active,
                SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
            )
        )
    }
}
