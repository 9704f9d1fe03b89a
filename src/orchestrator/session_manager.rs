//! Session lifecycle orchestration: create, resume, message exchange,
//! deletion.
//!
//! The manager ties the stores, the bundle cache and the execution engine
//! together. Message handling is serialized per session id so transcript
//! appends keep their order; operations on distinct sessions run fully in
//! parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use crate::cache::BundleCache;
use crate::engine::{EngineChunk, ExecutionEngine};
use crate::models::bundle::{fingerprint, PreparedBundle};
use crate::models::config::Config;
use crate::models::session::{Session, SessionStatus, TranscriptEntry, TranscriptRole};
use crate::persistence::{ConfigStore, SessionStore};
use crate::{AppError, Result};

use super::builder::BundleBuilder;

/// Capacity of the chunk channel handed to streaming callers.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Orchestrates config resolution, bundle preparation, and session
/// message flow.
pub struct SessionManager {
    configs: ConfigStore,
    sessions: SessionStore,
    cache: Arc<BundleCache>,
    builder: Arc<dyn BundleBuilder>,
    engine: Arc<dyn ExecutionEngine>,
    send_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Project identifiers seen by this process; feeds retention sweeps.
    projects: StdMutex<BTreeSet<String>>,
}

impl SessionManager {
    /// Assemble a manager from its collaborators.
    #[must_use]
    pub fn new(
        configs: ConfigStore,
        sessions: SessionStore,
        cache: Arc<BundleCache>,
        builder: Arc<dyn BundleBuilder>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            configs,
            sessions,
            cache,
            builder,
            engine,
            send_locks: StdMutex::new(HashMap::new()),
            projects: StdMutex::new(BTreeSet::new()),
        }
    }

    /// The underlying config store.
    #[must_use]
    pub fn config_store(&self) -> &ConfigStore {
        &self.configs
    }

    /// The underlying session store.
    #[must_use]
    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    /// Project identifiers this process has created or resumed sessions in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the registry lock is poisoned.
    pub fn known_projects(&self) -> Result<Vec<String>> {
        let projects = self
            .projects
            .lock()
            .map_err(|_| AppError::Io("project registry lock poisoned".into()))?;
        Ok(projects.iter().cloned().collect())
    }

    /// Create a new session against `config_id` in `project`.
    ///
    /// Loads the config, computes its fingerprint, gets-or-builds the
    /// prepared bundle, then persists a fresh active session with an empty
    /// transcript. A bundle build failure leaves no partial session behind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown config or
    /// `AppError::CacheBuild` when bundle preparation fails.
    pub async fn create_session(&self, project: &str, config_id: &str) -> Result<Session> {
        let span = info_span!("create_session", project, config_id);
        let _guard = span.enter();

        let config = self.configs.get(config_id)?;
        let (fp, _bundle) = self.prepare(&config).await?;

        let session = Session::new(config_id.to_owned(), project.to_owned(), fp);
        self.sessions.save(&session)?;
        self.register_project(project)?;

        info!(session_id = session.session_id, "session created");
        Ok(session)
    }

    /// Resume an existing session.
    ///
    /// Live-config semantics: the fingerprint is recomputed from the
    /// config's *current* content, so a config updated since creation
    /// triggers a rebuild and the session follows the new bundle. The
    /// transcript is replayed from the persisted record untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or config,
    /// `AppError::Conflict` if the session is in a terminal state,
    /// `AppError::CacheBuild` when the rebuild fails.
    pub async fn resume_session(&self, project: &str, session_id: &str) -> Result<Session> {
        let span = info_span!("resume_session", project, session_id);
        let _guard = span.enter();

        let mut session = self.sessions.load(project, session_id)?;
        ensure_not_terminal(&session)?;

        let config = self.configs.get(&session.config_id)?;
        let (fp, _bundle) = self.prepare(&config).await?;
        if fp != session.fingerprint {
            session.fingerprint = fp;
            session.updated_at = Utc::now();
            self.sessions.save(&session)?;
        }
        self.register_project(project)?;

        info!(session_id, "session resumed");
        Ok(session)
    }

    /// Send a message and wait for the complete response.
    ///
    /// Serialized per session id. Appends the user message, runs the
    /// engine with the prepared bundle and the prior transcript, appends
    /// the response, bumps `message_count`, and persists. An engine
    /// failure is recorded in the transcript and the session transitions
    /// to `failed`; it is not a storage error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Conflict` for terminal
    /// sessions, `AppError::CacheBuild` when rehydration fails, or
    /// `AppError::Engine` when the exchange fails.
    pub async fn send_message(
        &self,
        project: &str,
        session_id: &str,
        message: Value,
    ) -> Result<TranscriptEntry> {
        let lock = self.send_lock(session_id)?;
        let _serial = lock.lock().await;

        let span = info_span!("send_message", project, session_id);
        let _guard = span.enter();

        let mut session = self.sessions.load(project, session_id)?;
        ensure_not_terminal(&session)?;
        let bundle = self.hydrate(&mut session).await?;

        let user_entry = TranscriptEntry::new(TranscriptRole::User, message);
        let prior = session.transcript.clone();

        match self
            .engine
            .execute(bundle, prior, user_entry.clone())
            .await
        {
            Ok(response) => {
                let assistant = TranscriptEntry::new(TranscriptRole::Assistant, response.content);
                session.transcript.push(user_entry);
                session.transcript.push(assistant.clone());
                session.message_count += 1;
                session.updated_at = Utc::now();
                self.sessions.save(&session)?;
                Ok(assistant)
            }
            Err(err) => {
                warn!(%err, "engine failed, failing session");
                session.transcript.push(user_entry);
                session
                    .transcript
                    .push(TranscriptEntry::text(TranscriptRole::System, &err.to_string()));
                transition(&mut session, SessionStatus::Failed);
                self.sessions.save(&session)?;
                Err(AppError::Engine(err.to_string()))
            }
        }
    }

    /// Send a message, receiving the response as incremental chunks.
    ///
    /// The returned receiver yields chunks until the exchange completes,
    /// fails, or `cancel` fires. Cancellation stops forwarding, drops the
    /// engine stream (signalling it to abort), and persists the session in
    /// the `cancelled` state with whatever transcript was produced. The
    /// sequence is finite and not reusable; a new send starts a new one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound`, `AppError::Conflict` for terminal
    /// sessions, or `AppError::CacheBuild` when rehydration fails. Engine
    /// failures arrive as `Err` items on the channel.
    pub async fn stream_message(
        &self,
        project: &str,
        session_id: &str,
        message: Value,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<EngineChunk>>> {
        let lock = self.send_lock(session_id)?;
        let serial = Arc::clone(&lock).lock_owned().await;

        let mut session = self.sessions.load(project, session_id)?;
        ensure_not_terminal(&session)?;
        let bundle = self.hydrate(&mut session).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let engine = Arc::clone(&self.engine);
        let sessions = self.sessions.clone();
        let user_entry = TranscriptEntry::new(TranscriptRole::User, message);

        tokio::spawn(run_stream(
            engine, sessions, session, bundle, user_entry, cancel, tx, serial,
        ));

        Ok(rx)
    }

    /// Delete a session record. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an invalid project identifier or
    /// `AppError::Io` on removal failure.
    pub async fn delete_session(&self, project: &str, session_id: &str) -> Result<bool> {
        let removed = self.sessions.delete(project, session_id)?;
        if removed {
            info!(project, session_id, "session deleted");
        }
        Ok(removed)
    }

    /// Delete a config, guarding referential integrity.
    ///
    /// Fails while any active session on disk still references the config,
    /// including sessions created by earlier processes; deletion must be
    /// explicit, never silent. Cached bundles for the config are
    /// invalidated eagerly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` when live sessions reference the
    /// config, `AppError::NotFound` for an unknown id.
    pub async fn delete_config(&self, config_id: &str) -> Result<bool> {
        let live = self
            .sessions
            .list_all()?
            .into_iter()
            .filter(|s| s.config_id == config_id && !s.status.is_terminal())
            .count();
        if live > 0 {
            return Err(AppError::Conflict(format!(
                "config {config_id} is referenced by {live} live session(s)"
            )));
        }

        let removed = self.configs.delete(config_id)?;
        self.cache.invalidate(config_id).await;
        Ok(removed)
    }

    /// Update a config and eagerly evict its cached bundles.
    ///
    /// Content edits already miss the cache naturally (the fingerprint is
    /// content-addressed); eager invalidation just bounds memory.
    ///
    /// # Errors
    ///
    /// Propagates `ConfigStore::update` errors unchanged.
    pub async fn update_config(
        &self,
        config_id: &str,
        fields: crate::models::config::ConfigUpdate,
    ) -> Result<Config> {
        let updated = self.configs.update(config_id, fields)?;
        self.cache.invalidate(config_id).await;
        Ok(updated)
    }

    /// Create a child session for agent delegation, built from merged
    /// content that may differ from the stored config text.
    ///
    /// The child shares the parent's trace id and project namespace and
    /// carries a fresh span id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheBuild` when bundle preparation fails.
    pub async fn create_child_session(
        &self,
        parent: &Session,
        agent: &str,
        config_id: &str,
        content: &str,
    ) -> Result<Session> {
        let span = info_span!("create_child_session", agent, config_id);
        let _guard = span.enter();

        let fp = fingerprint(config_id, content);
        let builder = Arc::clone(&self.builder);
        let build_id = config_id.to_owned();
        let build_fp = fp.clone();
        let build_content = content.to_owned();
        self.cache
            .get_or_build(config_id, &fp, move || async move {
                builder.build(&build_id, &build_fp, &build_content).await
            })
            .await?;

        let session = Session::child_of(parent, config_id.to_owned(), fp, agent.to_owned());
        self.sessions.save(&session)?;

        info!(
            session_id = session.session_id,
            trace_id = session.trace_id,
            "child session created"
        );
        Ok(session)
    }

    async fn prepare(&self, config: &Config) -> Result<(String, Arc<PreparedBundle>)> {
        let fp = fingerprint(&config.config_id, &config.content);
        let builder = Arc::clone(&self.builder);
        let build_id = config.config_id.clone();
        let build_fp = fp.clone();
        let build_content = config.content.clone();
        let bundle = self
            .cache
            .get_or_build(&config.config_id, &fp, move || async move {
                builder.build(&build_id, &build_fp, &build_content).await
            })
            .await?;
        Ok((fp, bundle))
    }

    /// Rehydrate the prepared bundle a session pins, rebuilding on cache
    /// miss from the config's current content.
    async fn hydrate(&self, session: &mut Session) -> Result<Arc<PreparedBundle>> {
        if let Some(bundle) = self.cache.get(&session.fingerprint).await {
            return Ok(bundle);
        }
        let config = self.configs.get(&session.config_id)?;
        let (fp, bundle) = self.prepare(&config).await?;
        session.fingerprint = fp;
        Ok(bundle)
    }

    fn send_lock(&self, session_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .send_locks
            .lock()
            .map_err(|_| AppError::Io("send lock registry poisoned".into()))?;
        Ok(Arc::clone(
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }

    fn register_project(&self, project: &str) -> Result<()> {
        let mut projects = self
            .projects
            .lock()
            .map_err(|_| AppError::Io("project registry lock poisoned".into()))?;
        projects.insert(project.to_owned());
        Ok(())
    }
}

fn ensure_not_terminal(session: &Session) -> Result<()> {
    if session.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "session {} is terminal and accepts no further activity",
            session.session_id
        )));
    }
    Ok(())
}

fn transition(session: &mut Session, next: SessionStatus) {
    if session.can_transition_to(next) {
        session.status = next;
    }
    session.updated_at = Utc::now();
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    engine: Arc<dyn ExecutionEngine>,
    sessions: SessionStore,
    mut session: Session,
    bundle: Arc<PreparedBundle>,
    user_entry: TranscriptEntry,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<EngineChunk>>,
    _serial: OwnedMutexGuard<()>,
) {
    let prior = session.transcript.clone();
    let mut stream = match engine
        .execute_streaming(bundle, prior, user_entry.clone())
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            session.transcript.push(user_entry);
            session
                .transcript
                .push(TranscriptEntry::text(TranscriptRole::System, &err.to_string()));
            transition(&mut session, SessionStatus::Failed);
            persist_best_effort(&sessions, &session);
            let _ = tx.send(Err(AppError::Engine(err.to_string()))).await;
            return;
        }
    };

    let mut accumulated = String::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Dropping the stream signals the engine to abort.
                drop(stream);
                finish_cancelled(&sessions, &mut session, user_entry, accumulated);
                return;
            }
            item = stream.next() => match item {
                Some(Ok(chunk)) => {
                    accumulated.push_str(&chunk.delta);
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Receiver dropped: treat as cancellation.
                        drop(stream);
                        finish_cancelled(&sessions, &mut session, user_entry, accumulated);
                        return;
                    }
                }
                Some(Err(err)) => {
                    session.transcript.push(user_entry);
                    if !accumulated.is_empty() {
                        session
                            .transcript
                            .push(TranscriptEntry::text(TranscriptRole::Assistant, &accumulated));
                    }
                    session
                        .transcript
                        .push(TranscriptEntry::text(TranscriptRole::System, &err.to_string()));
                    transition(&mut session, SessionStatus::Failed);
                    persist_best_effort(&sessions, &session);
                    let _ = tx.send(Err(AppError::Engine(err.to_string()))).await;
                    return;
                }
                None => {
                    session.transcript.push(user_entry);
                    session
                        .transcript
                        .push(TranscriptEntry::text(TranscriptRole::Assistant, &accumulated));
                    session.message_count += 1;
                    session.updated_at = Utc::now();
                    persist_best_effort(&sessions, &session);
                    return;
                }
            }
        }
    }
}

fn finish_cancelled(
    sessions: &SessionStore,
    session: &mut Session,
    user_entry: TranscriptEntry,
    accumulated: String,
) {
    session.transcript.push(user_entry);
    if !accumulated.is_empty() {
        session
            .transcript
            .push(TranscriptEntry::text(TranscriptRole::Assistant, &accumulated));
    }
    transition(session, SessionStatus::Cancelled);
    persist_best_effort(sessions, session);
    info!(session_id = session.session_id, "stream cancelled");
}

fn persist_best_effort(sessions: &SessionStore, session: &Session) {
    if let Err(err) = sessions.save(session) {
        warn!(session_id = session.session_id, %err, "failed to persist session");
    }
}
