use std::collections::BTreeMap;

use agent_foundry::bundle::ModuleEntry;
use agent_foundry::models::config::ConfigUpdate;
use agent_foundry::persistence::ConfigStore;
use agent_foundry::{AppError, Settings};
use serial_test::serial;

use super::support::sample_bundle_yaml;

fn store() -> (ConfigStore, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = Settings::with_data_dir(temp.path()).expect("settings");
    (ConfigStore::open(&settings).expect("store"), temp)
}

#[test]
fn create_then_get_round_trips_content_byte_identical() {
    let (store, _temp) = store();
    // Deliberately odd formatting: trailing spaces, comments, blank lines.
    let content = "bundle:\n  name: dev   # identity\n\nsession: {}\n";
    let created = store
        .create("dev", content, None, BTreeMap::new())
        .expect("create");
    let fetched = store.get(&created.config_id).expect("get");
    assert_eq!(fetched.content, content);
    assert_eq!(fetched, created);
}

#[test]
fn create_rejects_invalid_content() {
    let (store, _temp) = store();
    let err = store
        .create("bad", "bundle:\n  name: dev\n", None, BTreeMap::new())
        .expect_err("missing session section");
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn get_unknown_id_is_not_found() {
    let (store, _temp) = store();
    assert!(matches!(
        store.get("missing"),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn update_replaces_content_and_bumps_updated_at() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");

    let replacement = "bundle:\n  name: dev\nsession:\n  max_turns: 3\n";
    let updated = store
        .update(
            &created.config_id,
            ConfigUpdate {
                content: Some(replacement.to_owned()),
                ..ConfigUpdate::default()
            },
        )
        .expect("update");

    assert_eq!(updated.content, replacement);
    assert!(updated.updated_at >= created.updated_at);
    assert_eq!(updated.created_at, created.created_at);
}

#[test]
fn failed_update_leaves_stored_record_unchanged() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");

    let err = store
        .update(
            &created.config_id,
            ConfigUpdate {
                content: Some("tools:\n  - module: a\n  - module: a\n".to_owned()),
                ..ConfigUpdate::default()
            },
        )
        .expect_err("invalid replacement");
    assert!(matches!(err, AppError::Validation(_)));

    let current = store.get(&created.config_id).expect("get");
    assert_eq!(current.content, sample_bundle_yaml(), "no partial write");
}

#[test]
fn delete_removes_record() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");
    assert!(store.delete(&created.config_id).expect("delete"));
    assert!(matches!(
        store.get(&created.config_id),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(&created.config_id),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn list_pages_in_creation_order() {
    let (store, _temp) = store();
    let mut ids = Vec::new();
    for index in 0..5 {
        let created = store
            .create(
                &format!("cfg-{index}"),
                sample_bundle_yaml(),
                None,
                BTreeMap::new(),
            )
            .expect("create");
        ids.push(created.config_id);
    }

    let (page, total) = store.list(2, 1).expect("list");
    assert_eq!(total, 5);
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].config_id, ids[1]);
    assert_eq!(page[1].config_id, ids[2]);
}

#[test]
fn tags_and_description_persist() {
    let (store, _temp) = store();
    let mut tags = BTreeMap::new();
    tags.insert("team".to_owned(), "research".to_owned());
    let created = store
        .create(
            "dev",
            sample_bundle_yaml(),
            Some("primary dev bundle".to_owned()),
            tags.clone(),
        )
        .expect("create");
    let fetched = store.get(&created.config_id).expect("get");
    assert_eq!(fetched.tags, tags);
    assert_eq!(fetched.description.as_deref(), Some("primary dev bundle"));
}

#[test]
fn add_tool_mutator_revalidates_and_persists() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");

    let updated = store
        .add_tool(&created.config_id, ModuleEntry::named("crawler"))
        .expect("add tool");
    assert!(updated.content.contains("crawler"));

    let err = store
        .add_tool(&created.config_id, ModuleEntry::named("shell"))
        .expect_err("duplicate tool");
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn add_provider_mutator_persists() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");
    let updated = store
        .add_provider(&created.config_id, ModuleEntry::named("openai"))
        .expect("add provider");
    assert!(updated.content.contains("openai"));
}

#[test]
fn merge_include_mutator_dedupes() {
    let (store, _temp) = store();
    let created = store
        .create("dev", sample_bundle_yaml(), None, BTreeMap::new())
        .expect("create");

    let first = store
        .merge_include(&created.config_id, "extras")
        .expect("merge include");
    let second = store
        .merge_include(&created.config_id, "extras")
        .expect("idempotent merge");
    assert_eq!(
        first.content.matches("extras").count(),
        second.content.matches("extras").count()
    );
}

#[test]
#[serial]
fn secrets_section_requires_secret_key_env() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "data_dir = '{}'\nsecret_key_env = 'FOUNDRY_TEST_STORE_KEY'\n",
        temp.path().display()
    );
    let settings = Settings::from_toml_str(&raw).expect("settings");
    let store = ConfigStore::open(&settings).expect("store");

    let secret_yaml = "bundle:\n  name: dev\nsession: {}\nsecrets:\n  api_key: enc:abc\n";

    std::env::remove_var("FOUNDRY_TEST_STORE_KEY");
    let err = store
        .create("dev", secret_yaml, None, BTreeMap::new())
        .expect_err("secrets gated");
    assert!(err.to_string().contains("FOUNDRY_TEST_STORE_KEY"));

    std::env::set_var("FOUNDRY_TEST_STORE_KEY", "key-material");
    store
        .create("dev", secret_yaml, None, BTreeMap::new())
        .expect("secrets allowed with key present");
    std::env::remove_var("FOUNDRY_TEST_STORE_KEY");
}
