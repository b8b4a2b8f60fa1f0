//! Coverage for config parsing and path resolution.

use std::path::PathBuf;

use threadline::config::{
    config_dir, database_path, load_config, Config, DatabaseConfig, LimitsConfig, RetryConfig,
};

#[test]
fn default_limits_and_retry_values() {
    assert_eq!(LimitsConfig::default().max_content_bytes, 65_536);
    let retry = RetryConfig::default();
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.backoff_ms, 50);
}

#[test]
fn default_database_values() {
    let db = DatabaseConfig::default();
    assert!(db.path.is_none());
    assert_eq!(db.max_connections, 8);
    assert_eq!(db.busy_timeout_ms, 5_000);
}

#[test]
fn config_dir_resolves() {
    let dir = config_dir();
    assert!(dir.is_ok());
    let path = match dir {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".threadline"));
}

#[test]
fn parse_full_config() {
    let toml_str = r#"
[database]
path = "/var/lib/threadline/main.db"
max_connections = 4
busy_timeout_ms = 250

[limits]
max_content_bytes = 1024

[retry]
max_attempts = 5
backoff_ms = 10

[logging]
level = "debug"
dir = "/var/log/threadline"
"#;
    let config = match toml::from_str::<Config>(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("full config should parse: {err}"),
    };
    assert_eq!(
        config.database.path,
        Some(PathBuf::from("/var/lib/threadline/main.db"))
    );
    assert_eq!(config.database.max_connections, 4);
    assert_eq!(config.database.busy_timeout_ms, 250);
    assert_eq!(config.limits.max_content_bytes, 1024);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.backoff_ms, 10);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/threadline")));
}

#[test]
fn load_config_reads_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[limits]\nmax_content_bytes = 10\n").expect("write config");

    let config = load_config(&path).expect("config should load");
    assert_eq!(config.limits.max_content_bytes, 10);
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn load_config_reports_missing_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let err = load_config(&tmp.path().join("absent.toml")).expect_err("should fail");
    assert!(err.to_string().contains("failed to read config"));
}

#[test]
fn load_config_reports_parse_errors() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[retry\nmax_attempts = ").expect("write config");
    let err = load_config(&path).expect_err("should fail");
    assert!(err.to_string().contains("failed to parse config"));
}

#[test]
fn database_path_prefers_configured_path() {
    // Only meaningful when the override variable is unset in the test env.
    if std::env::var_os(threadline::config::DB_PATH_ENV).is_some() {
        return;
    }
    let configured = DatabaseConfig {
        path: Some(PathBuf::from("/tmp/explicit.db")),
        ..DatabaseConfig::default()
    };
    let resolved = database_path(&configured).expect("path resolves");
    assert_eq!(resolved, PathBuf::from("/tmp/explicit.db"));

    let fallback = database_path(&DatabaseConfig::default()).expect("path resolves");
    assert!(fallback.ends_with(".threadline/threadline.db"));
}
