//! CLI smoke tests against a temporary database.

use assert_cmd::Command;
use tempfile::TempDir;

struct Env {
    home: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            home: tempfile::tempdir().expect("should create temp home"),
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("threadline").expect("binary should build");
        cmd.env("HOME", self.home.path())
            .env("THREADLINE_DB", self.home.path().join("cli.db"))
            .env("RUST_LOG", "error")
            .current_dir(self.home.path());
        cmd
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().args(args).output().expect("command should run");
        assert!(
            output.status.success(),
            "threadline {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
    }
}

#[test]
fn init_creates_database() {
    let env = Env::new();
    let out = env.json(&["init"]);
    assert!(out["database"].as_str().expect("path").ends_with("cli.db"));
    assert!(env.home.path().join("cli.db").exists());
}

#[test]
fn send_edit_and_history_round_trip() {
    let env = Env::new();
    env.json(&["add-user", "alice"]);
    env.json(&["add-user", "bob"]);

    let sent = env.json(&["--as", "alice", "send", "bob", "first draft"]);
    let id = sent["id"].as_i64().expect("message id");
    assert_eq!(sent["receiver"]["username"], "bob");

    let edited = env.json(&["--as", "alice", "edit", &id.to_string(), "final"]);
    assert_eq!(edited["revision_recorded"], true);

    let history = env.json(&["--as", "bob", "history", &id.to_string()]);
    assert_eq!(history[0]["old_content"], "first draft");

    let unread = env.json(&["--as", "bob", "unread", "--count"]);
    assert_eq!(unread["unread"], 1);

    let thread = env.json(&["--as", "bob", "thread", &id.to_string()]);
    assert_eq!(thread["content"], "final");
}

#[test]
fn forbidden_edit_reports_error_code() {
    let env = Env::new();
    env.json(&["add-user", "alice"]);
    env.json(&["add-user", "bob"]);
    let sent = env.json(&["--as", "alice", "send", "bob", "hello"]);
    let id = sent["id"].as_i64().expect("message id").to_string();

    let output = env
        .cmd()
        .args(["--as", "bob", "edit", &id, "nope"])
        .output()
        .expect("command should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("\"code\":\"forbidden\""), "stderr: {stderr}");
}

#[test]
fn delete_account_requires_confirmation() {
    let env = Env::new();
    env.json(&["add-user", "carol"]);
    env.cmd()
        .args(["--as", "carol", "delete-account"])
        .assert()
        .failure();

    let report = env.json(&["--as", "carol", "delete-account", "--yes"]);
    assert_eq!(report["messages"], 0);
}
