use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_foundry::models::config::ConfigUpdate;
use agent_foundry::models::session::{SessionStatus, TranscriptRole};
use agent_foundry::AppError;

use super::support::{harness, harness_with_engine, sample_bundle_yaml, EndlessEngine, MockEngine};

fn create_config(h: &super::support::Harness) -> String {
    h.manager
        .config_store()
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create config")
        .config_id
}

#[tokio::test]
async fn concurrent_session_creation_builds_the_bundle_once() {
    let h = harness();
    let config_id = create_config(&h);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&h.manager);
        let config_id = config_id.clone();
        handles.push(tokio::spawn(async move {
            manager.create_session("demo", &config_id).await
        }));
    }
    for handle in handles {
        let session = handle.await.expect("join").expect("create session");
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.transcript.is_empty());
    }

    assert_eq!(h.builds.load(Ordering::SeqCst), 1, "one build for one content");
}

#[tokio::test]
async fn create_session_with_unknown_config_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.manager.create_session("demo", "missing").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn send_message_appends_exchange_and_bumps_count() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let response = h
        .manager
        .send_message("demo", &session.session_id, json!("hi"))
        .await
        .expect("send");
    assert_eq!(response.content, json!("echo: hi"));

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.transcript.len(), 2);
    assert_eq!(stored.transcript[0].role, TranscriptRole::User);
    assert_eq!(stored.transcript[0].content, json!("hi"));
    assert_eq!(stored.transcript[1].role, TranscriptRole::Assistant);
    assert_eq!(stored.message_count, 1);
    assert_eq!(stored.status, SessionStatus::Active);
}

#[tokio::test]
async fn content_change_triggers_a_fresh_build() {
    let h = harness();
    let config_id = create_config(&h);
    let first = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("first session");
    assert_eq!(h.builds.load(Ordering::SeqCst), 1);

    h.manager
        .update_config(
            &config_id,
            ConfigUpdate {
                content: Some("bundle:\n  name: dev\nsession:\n  max_turns: 3\n".to_owned()),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("update");

    let second = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("second session");
    assert_eq!(h.builds.load(Ordering::SeqCst), 2, "new content misses the cache");
    assert_ne!(second.fingerprint, first.fingerprint);
}

#[tokio::test]
async fn engine_failure_fails_the_session_and_records_it() {
    let h = harness_with_engine(Arc::new(MockEngine {
        fail_with: Some("model overloaded".into()),
        ..MockEngine::default()
    }));
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let err = h
        .manager
        .send_message("demo", &session.session_id, json!("hi"))
        .await
        .expect_err("engine fails");
    assert!(matches!(err, AppError::Engine(_)));

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.status, SessionStatus::Failed);
    assert_eq!(stored.message_count, 0);
    assert_eq!(stored.transcript.len(), 2);
    assert_eq!(stored.transcript[1].role, TranscriptRole::System);
    assert!(stored.transcript[1]
        .content
        .as_str()
        .is_some_and(|s| s.contains("model overloaded")));
}

#[tokio::test]
async fn send_to_terminal_session_is_a_conflict() {
    let h = harness_with_engine(Arc::new(MockEngine {
        fail_with: Some("boom".into()),
        ..MockEngine::default()
    }));
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");
    let _ = h
        .manager
        .send_message("demo", &session.session_id, json!("hi"))
        .await;

    let err = h
        .manager
        .send_message("demo", &session.session_id, json!("again"))
        .await
        .expect_err("terminal session");
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn streaming_completion_accumulates_the_response() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let mut rx = h
        .manager
        .stream_message(
            "demo",
            &session.session_id,
            json!("stream please"),
            CancellationToken::new(),
        )
        .await
        .expect("stream");

    let mut seen = String::new();
    while let Some(item) = rx.recv().await {
        seen.push_str(&item.expect("chunk").delta);
    }
    assert_eq!(seen, "hello");

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.status, SessionStatus::Active);
    assert_eq!(stored.message_count, 1);
    assert_eq!(stored.transcript.len(), 2);
    assert_eq!(stored.transcript[1].content, json!("hello"));
}

#[tokio::test]
async fn streaming_cancellation_persists_partial_transcript() {
    let h = harness_with_engine(Arc::new(EndlessEngine));
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let cancel = CancellationToken::new();
    let mut rx = h
        .manager
        .stream_message("demo", &session.session_id, json!("go"), cancel.clone())
        .await
        .expect("stream");

    // Let a few chunks through before cancelling.
    let mut received = 0;
    while received < 3 {
        let item = rx.recv().await.expect("chunk before cancel");
        item.expect("chunk");
        received += 1;
    }
    cancel.cancel();
    while rx.recv().await.is_some() {}

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.status, SessionStatus::Cancelled);
    assert_eq!(stored.message_count, 0, "cancelled turn does not count");
    assert_eq!(stored.transcript[0].content, json!("go"));
    let partial = stored.transcript[1].content.as_str().unwrap_or_default();
    assert!(partial.starts_with("c0 "), "partial output kept: {partial:?}");
}

#[tokio::test]
async fn streaming_engine_failure_fails_the_session() {
    let h = harness_with_engine(Arc::new(MockEngine {
        fail_with: Some("stream refused".into()),
        ..MockEngine::default()
    }));
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let mut rx = h
        .manager
        .stream_message(
            "demo",
            &session.session_id,
            json!("hi"),
            CancellationToken::new(),
        )
        .await
        .expect("stream starts");
    let first = rx.recv().await.expect("error item");
    assert!(matches!(first, Err(AppError::Engine(_))));
    while rx.recv().await.is_some() {}

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.status, SessionStatus::Failed);
}

#[tokio::test]
async fn resume_follows_current_config_content() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");
    let original_fp = session.fingerprint.clone();

    h.manager
        .update_config(
            &config_id,
            ConfigUpdate {
                content: Some("bundle:\n  name: dev\nsession:\n  max_turns: 7\n".to_owned()),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("update");

    let resumed = h
        .manager
        .resume_session("demo", &session.session_id)
        .await
        .expect("resume");
    assert_ne!(resumed.fingerprint, original_fp, "resume tracks the live config");
    assert_eq!(h.builds.load(Ordering::SeqCst), 2);

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.fingerprint, resumed.fingerprint, "new pin persisted");
}

#[tokio::test]
async fn resume_unknown_session_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.manager.resume_session("demo", "missing").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_config_is_blocked_by_live_sessions() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let err = h
        .manager
        .delete_config(&config_id)
        .await
        .expect_err("live session blocks deletion");
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(h.manager.config_store().get(&config_id).is_ok());

    assert!(h
        .manager
        .delete_session("demo", &session.session_id)
        .await
        .expect("delete session"));
    assert!(h.manager.delete_config(&config_id).await.expect("delete config"));
    assert!(matches!(
        h.manager.config_store().get(&config_id),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_config_guard_survives_restart() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    // A freshly started process has no in-memory state; the guard must
    // find the live session on disk.
    let settings = agent_foundry::Settings::with_data_dir(h._temp.path()).expect("settings");
    let restarted = super::support::manager_over(&settings);

    let err = restarted
        .delete_config(&config_id)
        .await
        .expect_err("live on-disk session blocks deletion");
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(restarted.config_store().get(&config_id).is_ok());

    assert!(restarted
        .delete_session("demo", &session.session_id)
        .await
        .expect("delete session"));
    assert!(restarted
        .delete_config(&config_id)
        .await
        .expect("delete config after session removal"));
}

#[tokio::test]
async fn concurrent_sends_to_one_session_are_serialized() {
    let h = harness();
    let config_id = create_config(&h);
    let session = h
        .manager
        .create_session("demo", &config_id)
        .await
        .expect("create session");

    let mut handles = Vec::new();
    for n in 0..4 {
        let manager = Arc::clone(&h.manager);
        let session_id = session.session_id.clone();
        handles.push(tokio::spawn(async move {
            manager
                .send_message("demo", &session_id, json!(format!("m{n}")))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("send");
    }

    let stored = h
        .manager
        .session_store()
        .load("demo", &session.session_id)
        .expect("load");
    assert_eq!(stored.message_count, 4, "no exchange lost to interleaving");
    assert_eq!(stored.transcript.len(), 8);
    // Entries alternate user/assistant; serialization kept pairs adjacent.
    for pair in stored.transcript.chunks(2) {
        assert_eq!(pair[0].role, TranscriptRole::User);
        assert_eq!(pair[1].role, TranscriptRole::Assistant);
    }
}

#[tokio::test]
async fn bundle_build_failure_leaves_no_session_behind() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = agent_foundry::Settings::with_data_dir(temp.path()).expect("settings");
    let configs = agent_foundry::persistence::ConfigStore::open(&settings).expect("configs");
    let sessions = agent_foundry::persistence::SessionStore::open(&settings).expect("sessions");
    let manager = agent_foundry::orchestrator::SessionManager::new(
        configs,
        sessions,
        Arc::new(agent_foundry::cache::BundleCache::new(8)),
        Arc::new(super::support::FailingBuilder),
        Arc::new(MockEngine::default()),
    );
    let config_id = manager
        .config_store()
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create config")
        .config_id;

    let err = manager
        .create_session("demo", &config_id)
        .await
        .expect_err("build fails");
    assert!(matches!(err, AppError::CacheBuild(_)));
    assert!(manager.session_store().list("demo").expect("list").is_empty());
}
