//! CLI integration tests for demiarch-agents
//!
//! Runs the binary end-to-end with an isolated config directory and database.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Command with config and database confined to the sandbox
    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("demiarch-agents").unwrap();
        cmd.current_dir(self.dir.path());
        cmd.env("DEMIARCH_CONFIG_DIR", self.dir.path().join("config"));
        cmd.env_remove("DEMIARCH_API_KEY");
        cmd.env_remove("OPENROUTER_API_KEY");
        cmd.env_remove("RUST_LOG");
        cmd.arg("--db").arg(self.dir.path().join("agents.db"));
        cmd
    }
}

#[test]
fn test_offline_run_succeeds() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["run", "Add password reset", "--offline", "--feature", "feat-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running feature 'feat-1'"))
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("task-3"));
}

#[test]
fn test_run_without_api_key_fails_with_hint() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["run", "Add password reset"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No API key found"));
}

#[test]
fn test_executions_list_and_show_after_run() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["run", "Export invoices", "--offline", "--feature", "feat-export", "-q"])
        .assert()
        .success();

    let output = sandbox
        .cmd()
        .args(["executions", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let roots: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let roots = roots.as_array().unwrap();
    assert_eq!(roots.len(), 1);
    let id = roots[0]["id"].as_str().unwrap().to_string();

    sandbox
        .cmd()
        .args(["executions", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator"))
        .stdout(predicate::str::contains("planner"))
        .stdout(predicate::str::contains("tester"));
}

#[test]
fn test_executions_show_unknown_id() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["executions", "show", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid execution ID"));
}

#[test]
fn test_locks_released_after_run() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["run", "Add audit log", "--offline", "-q"])
        .assert()
        .success();

    sandbox
        .cmd()
        .args(["locks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("released"));

    sandbox
        .cmd()
        .args(["locks", "--held"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No locks recorded."));
}

#[test]
fn test_context_add_then_query() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args([
            "context",
            "add",
            "Login uses OAuth with PKCE. Refresh tokens rotate on every use.",
            "--project",
            "shop",
            "-t",
            "feature",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Context item added"));

    sandbox
        .cmd()
        .args(["context", "query", "login tokens", "--project", "shop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 items"));
}

#[test]
fn test_context_add_rejects_unknown_source_type() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["context", "add", "hello", "-t", "tweet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown source type"));
}

#[test]
fn test_config_set_and_get() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["config", "set", "scheduler.max_workers", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set scheduler.max_workers = 2"));

    sandbox
        .cmd()
        .args(["config", "get", "scheduler.max_workers"])
        .assert()
        .success()
        .stdout(predicate::str::diff("2\n"));
}

#[test]
fn test_config_rejects_api_key() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["config", "set", "llm.api_key", "sk-secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("DEMIARCH_API_KEY"));
}

#[test]
fn test_config_path_uses_config_dir() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("agents.toml"));
}

#[test]
fn test_doctor_reports_schema() {
    let sandbox = Sandbox::new();

    sandbox
        .cmd()
        .args(["doctor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[OK] Database: Schema v2"));
}
