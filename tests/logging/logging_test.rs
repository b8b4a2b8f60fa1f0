//! Tests for `src/logging.rs`.

use threadline::logging::LoggingGuard;

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_file_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber can be installed per process; the directory
    // is created before that step either way.
    let _result = threadline::logging::init_file(&logs_dir, "info");
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn init_cli_tolerates_repeated_calls() {
    threadline::logging::init_cli("warn");
    threadline::logging::init_cli("debug");
}

#[test]
fn init_file_reports_uncreatable_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"").expect("should create file");
    let logs_dir = blocker.join("logs");

    let err = threadline::logging::init_file(&logs_dir, "info")
        .err()
        .expect("a file in the path should block directory creation");
    let message = format!("{err:#}");
    assert!(message.contains("failed to create logs directory"), "{message}");
    assert!(message.contains(&logs_dir.display().to_string()), "{message}");
}
