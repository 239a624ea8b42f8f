use super::*;

use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_in_memory_url_untouched() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn blank_url_falls_back_to_default() {
    assert_eq!(normalize_database_url("   "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("portal_chat_relay_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn app_prefixed_env_overrides_plain_env() {
    let mut settings = Settings::default();
    apply_env_settings(&mut settings, |key| match key {
        "RELAY_BIND" => Some("0.0.0.0:9000".to_string()),
        "APP__BIND_ADDR" => Some("0.0.0.0:9100".to_string()),
        "RELAY_PUBLIC_URL" => Some("https://chat.example".to_string()),
        _ => None,
    });
    assert_eq!(settings.server_bind, "0.0.0.0:9100");
    assert_eq!(settings.public_url.as_deref(), Some("https://chat.example"));
    assert_eq!(settings.database_url, Settings::default().database_url);
}

#[test]
fn file_settings_apply_known_keys() {
    let mut settings = Settings::default();
    let raw = r#"
        bind_addr = "127.0.0.1:7000"
        database_url = "sqlite://./tmp/chat.db"
    "#;
    let file_cfg: HashMap<String, String> = toml::from_str(raw).expect("toml");
    apply_file_settings(&mut settings, &file_cfg);
    assert_eq!(settings.server_bind, "127.0.0.1:7000");
    assert_eq!(settings.database_url, "sqlite://./tmp/chat.db");
    assert!(settings.public_url.is_none());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("portal_chat_relay_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("relay.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
