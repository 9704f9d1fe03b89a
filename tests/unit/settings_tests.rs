use agent_foundry::Settings;
use serial_test::serial;

#[test]
fn parses_minimal_settings_with_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!("data_dir = '{}'\n", temp.path().display());
    let settings = Settings::from_toml_str(&raw).expect("parses");
    assert_eq!(settings.retention_days, 30);
    assert_eq!(settings.cache_capacity, 64);
    assert_eq!(settings.secret_key_env, "AGENT_FOUNDRY_SECRET_KEY");
}

#[test]
fn parses_full_settings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        r"
data_dir = '{}'
retention_days = 7
cache_capacity = 8
secret_key_env = 'MY_KEY'
",
        temp.path().display()
    );
    let settings = Settings::from_toml_str(&raw).expect("parses");
    assert_eq!(settings.retention_days, 7);
    assert_eq!(settings.cache_capacity, 8);
    assert_eq!(settings.secret_key_env, "MY_KEY");
}

#[test]
fn rejects_zero_retention() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "data_dir = '{}'\nretention_days = 0\n",
        temp.path().display()
    );
    assert!(Settings::from_toml_str(&raw).is_err());
}

#[test]
fn rejects_zero_cache_capacity() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "data_dir = '{}'\ncache_capacity = 0\n",
        temp.path().display()
    );
    assert!(Settings::from_toml_str(&raw).is_err());
}

#[test]
fn creates_missing_data_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let nested = temp.path().join("deep").join("store");
    let settings = Settings::with_data_dir(&nested).expect("settings");
    assert!(settings.data_dir.exists());
}

#[test]
#[serial]
fn secret_key_reads_configured_env_var() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = format!(
        "data_dir = '{}'\nsecret_key_env = 'FOUNDRY_TEST_SECRET'\n",
        temp.path().display()
    );
    let settings = Settings::from_toml_str(&raw).expect("parses");

    std::env::remove_var("FOUNDRY_TEST_SECRET");
    assert!(settings.secret_key().is_none());

    std::env::set_var("FOUNDRY_TEST_SECRET", "s3cret");
    assert_eq!(settings.secret_key().as_deref(), Some("s3cret"));
    std::env::remove_var("FOUNDRY_TEST_SECRET");
}
