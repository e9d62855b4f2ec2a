use chatbridge::config::{DEFAULT_MAX_TOKENS, KNOWN_SETTINGS};
use tempfile::TempDir;

fn test_runtime(database_dsn: String) -> chatbridge::app::RuntimeConfig {
    chatbridge::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn,
        upstream_timeout_secs: 30,
    }
}

#[tokio::test]
async fn sqlite_file_created_for_runtime_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("chatbridge.db");
    assert!(!db_path.exists());

    let runtime = test_runtime(format!("sqlite://{}", db_path.display()));
    let _state = chatbridge::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let runtime = test_runtime("sqlite::memory:".to_string());
    let state = chatbridge::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    let all = state.config.get_all().await.expect("settings");
    for setting in KNOWN_SETTINGS {
        assert!(all.contains_key(setting.key), "{} seeded", setting.key);
    }
}

#[tokio::test]
async fn stored_settings_survive_a_restart() {
    let temp_dir = TempDir::new().expect("temp dir");
    let dsn = format!("sqlite://{}", temp_dir.path().join("chatbridge.db").display());

    let state = chatbridge::app::load_state_with_runtime(test_runtime(dsn.clone()))
        .await
        .expect("first start");
    state
        .config
        .set(DEFAULT_MAX_TOKENS, "1234")
        .await
        .expect("set");
    drop(state);

    let state = chatbridge::app::load_state_with_runtime(test_runtime(dsn))
        .await
        .expect("second start");
    assert_eq!(state.config.get_int(DEFAULT_MAX_TOKENS, 0).await, 1234);
}
