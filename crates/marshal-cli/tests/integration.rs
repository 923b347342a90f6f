use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn marshal(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("marshal").unwrap();
    cmd.current_dir(dir.path()).env("MARSHAL_ROOT", dir.path());
    cmd
}

fn init_workspace(dir: &TempDir) {
    marshal(dir).arg("init").assert().success();
}

fn submit_json(dir: &TempDir, args: &[&str]) -> serde_json::Value {
    let output = marshal(dir)
        .args(["submit", "--json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("submit --json must emit valid JSON")
}

// ---------------------------------------------------------------------------
// marshal init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_workspace_tree() {
    let dir = TempDir::new().unwrap();
    marshal(&dir).arg("init").assert().success();

    assert!(dir.path().join(".marshal").is_dir());
    assert!(dir.path().join(".marshal/config.yaml").exists());
    assert!(dir.path().join(".marshal/records.redb").exists());
    assert!(dir.path().join(".marshal/dlq.redb").exists());
    assert!(dir.path().join(".marshal/audit").is_dir());
    assert!(dir.path().join(".marshal/recovery").is_dir());
    assert!(dir.path().join(".marshal/spool").is_dir());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    marshal(&dir).arg("init").assert().success();
    marshal(&dir).arg("init").assert().success();
}

// ---------------------------------------------------------------------------
// marshal submit / list / show
// ---------------------------------------------------------------------------

#[test]
fn submit_requires_init() {
    let dir = TempDir::new().unwrap();
    marshal(&dir)
        .args(["submit", "--type", "send-email"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("marshal init"));
}

#[test]
fn submit_creates_pending_record_with_risk_score() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);

    let record = submit_json(
        &dir,
        &[
            "--type",
            "send-email",
            "--payload",
            r#"{"to": "board@example.com"}"#,
            "--external-recipient",
            "--irreversible",
        ],
    );
    assert_eq!(record["status"], "pending");
    assert_eq!(record["risk_score"], 70);
    assert_eq!(record["risk_level"], "high");

    marshal(&dir)
        .args(["list", "--status", "pending"])
        .assert()
        .success()
        .stdout(predicate::str::contains("send-email"));

    let id = record["id"].as_str().unwrap();
    marshal(&dir)
        .args(["show", id])
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("board@example.com"));
}

#[test]
fn submit_rejects_invalid_action_type_and_payload() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);

    marshal(&dir)
        .args(["submit", "--type", "Not Valid"])
        .assert()
        .failure();

    marshal(&dir)
        .args(["submit", "--type", "send-email", "--payload", "not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON"));
}

// ---------------------------------------------------------------------------
// marshal approve / reject
// ---------------------------------------------------------------------------

#[test]
fn approve_records_decision_on_pending_record() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    let record = submit_json(&dir, &["--type", "send-email"]);
    let id = record["id"].as_str().unwrap();

    marshal(&dir)
        .args(["approve", id, "--by", "alex"])
        .assert()
        .success()
        .stdout(predicate::str::contains("next sweep"));

    let output = marshal(&dir)
        .args(["show", id, "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let shown: serde_json::Value = serde_json::from_slice(&output).unwrap();
    // Decision recorded; the status flip belongs to the approval loop
    assert_eq!(shown["status"], "pending");
    assert_eq!(shown["decision"]["verdict"], "approve");
    assert_eq!(shown["decision"]["decided_by"], "alex");
}

#[test]
fn reject_with_reason() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    let record = submit_json(&dir, &["--type", "send-email"]);
    let id = record["id"].as_str().unwrap();

    marshal(&dir)
        .args(["reject", id, "--reason", "wrong recipient"])
        .assert()
        .success();

    let output = marshal(&dir)
        .args(["show", id, "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let shown: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(shown["decision"]["verdict"], "reject");
    assert_eq!(shown["decision"]["reason"], "wrong recipient");
}

#[test]
fn approve_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    marshal(&dir)
        .args(["approve", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid record id"));
}

// ---------------------------------------------------------------------------
// marshal audit
// ---------------------------------------------------------------------------

#[test]
fn audit_search_finds_submission_event() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    submit_json(&dir, &["--type", "send-email"]);

    marshal(&dir)
        .args(["audit", "search", "--type", "send-email"])
        .assert()
        .success()
        .stdout(predicate::str::contains("requested"));

    marshal(&dir)
        .args(["audit", "search", "--type", "no-such-type"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matching audit events"));
}

#[test]
fn audit_cleanup_reports_horizon() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    marshal(&dir)
        .args(["audit", "cleanup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("90 days"));
}

// ---------------------------------------------------------------------------
// marshal dlq / health / status
// ---------------------------------------------------------------------------

#[test]
fn dlq_list_empty() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    marshal(&dir)
        .args(["dlq", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("empty"));
}

#[test]
fn dlq_remove_missing_item_fails() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    marshal(&dir)
        .args(["dlq", "remove", "no-such-op"])
        .assert()
        .failure();
}

#[test]
fn health_is_critical_before_init_and_healthy_after() {
    let dir = TempDir::new().unwrap();
    marshal(&dir).arg("health").assert().code(2);

    init_workspace(&dir);
    marshal(&dir)
        .arg("health")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("healthy"));
}

#[test]
fn status_shows_counts() {
    let dir = TempDir::new().unwrap();
    init_workspace(&dir);
    submit_json(&dir, &["--type", "send-email"]);

    marshal(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("Dead letters: 0"));
}
