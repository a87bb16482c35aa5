#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn hw_output(db_path: &Path, role: Option<&str>, args: &[&str]) -> Output {
    let mut command = Command::new(PathBuf::from(env!("CARGO_BIN_EXE_hw")));
    command.arg("--db").arg(db_path);
    if let Some(role) = role {
        command.arg("--role").arg(role);
    }
    command.args(args);

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute hw command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "invalid JSON output: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn pretty(value: &Value) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(value) => value,
        Err(err) => panic!("failed to serialize payload: {err}"),
    }
}

fn seed(db_path: &Path) {
    let output = hw_output(
        db_path,
        None,
        &[
            "posting",
            "upsert",
            "--posting-id",
            "post-1",
            "--agency-id",
            "agency-1",
            "--title",
            "Warehouse picker",
            "--position-id",
            "pos-1",
            "--position-id",
            "pos-2",
        ],
    );
    assert!(output.status.success());
}

fn apply(db_path: &Path, candidate: &str, position: &str) -> String {
    let payload = parse_json(&hw_output(
        db_path,
        Some("candidate"),
        &[
            "application",
            "apply",
            "--candidate-id",
            candidate,
            "--posting-id",
            "post-1",
            "--position-id",
            position,
        ],
    ));
    match payload["application"]["application_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("apply payload missing application_id"),
    }
}

#[test]
fn snapshot_posting_json_v1() {
    let db_path = std::env::temp_dir().join(format!("hw-snapshot-posting-{}.sqlite3", Ulid::new()));
    seed(&db_path);

    let output = hw_output(&db_path, None, &["posting", "show", "--posting-id", "post-1"]);
    let expected = r#"{
  "contract_version": "posting.v1",
  "posting": {
    "posting_id": "post-1",
    "agency_id": "agency-1",
    "title": "Warehouse picker",
    "active": true,
    "position_ids": [
      "pos-1",
      "pos-2"
    ]
  }
}"#;
    assert_eq!(pretty(&parse_json(&output)), expected);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_analytics_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("hw-snapshot-analytics-{}.sqlite3", Ulid::new()));
    seed(&db_path);
    let first = apply(&db_path, "cand-1", "pos-1");
    let _ = apply(&db_path, "cand-1", "pos-2");

    let output = hw_output(
        &db_path,
        Some("recruiter"),
        &[
            "application",
            "update-status",
            "--application-id",
            &first,
            "--status",
            "shortlisted",
        ],
    );
    assert!(output.status.success());

    let output = hw_output(
        &db_path,
        None,
        &["application", "analytics", "--candidate-id", "cand-1"],
    );
    let expected = r#"{
  "contract_version": "analytics.v1",
  "candidate_id": "cand-1",
  "total": 2,
  "by_status": {
    "applied": 1,
    "shortlisted": 1,
    "interview_scheduled": 0,
    "interview_rescheduled": 0,
    "interview_passed": 0,
    "interview_failed": 0,
    "withdrawn": 0
  }
}"#;
    assert_eq!(pretty(&parse_json(&output)), expected);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_invalid_transition_stderr_v1() {
    let db_path =
        std::env::temp_dir().join(format!("hw-snapshot-transition-{}.sqlite3", Ulid::new()));
    seed(&db_path);
    let application_id = apply(&db_path, "cand-1", "pos-1");

    let output = hw_output(
        &db_path,
        Some("recruiter"),
        &[
            "application",
            "update-status",
            "--application-id",
            &application_id,
            "--status",
            "applied",
        ],
    );
    assert!(!output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "error[invalid_transition]: invalid transition: applied -> applied\n"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_bulk_reject_json_v1() {
    let db_path = std::env::temp_dir().join(format!("hw-snapshot-bulk-{}.sqlite3", Ulid::new()));
    seed(&db_path);
    let first = apply(&db_path, "cand-1", "pos-1");
    let second = apply(&db_path, "cand-2", "pos-1");
    let shortlisted = apply(&db_path, "cand-3", "pos-2");

    let output = hw_output(
        &db_path,
        Some("recruiter"),
        &[
            "application",
            "update-status",
            "--application-id",
            &shortlisted,
            "--status",
            "shortlisted",
        ],
    );
    assert!(output.status.success());

    let output = hw_output(
        &db_path,
        Some("agency_admin"),
        &[
            "application",
            "bulk-reject",
            "--posting-id",
            "post-1",
            "--reason",
            "posting filled",
        ],
    );
    let expected = format!(
        "{{\n  \"contract_version\": \"bulk_reject.v1\",\n  \"posting_id\": \"post-1\",\n  \"rejected\": 2,\n  \"rejected_ids\": [\n    \"{}\",\n    \"{}\"\n  ],\n  \"failures\": []\n}}",
        first, second
    );
    assert_eq!(pretty(&parse_json(&output)), expected);

    let list = parse_json(&hw_output(
        &db_path,
        None,
        &[
            "application",
            "list",
            "--posting-id",
            "post-1",
            "--status",
            "shortlisted",
        ],
    ));
    assert_eq!(list["contract_version"], "application_list.v1");
    assert_eq!(list["applications"][0]["application_id"], shortlisted.as_str());

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let rejected_rows: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM notification_outbox WHERE kind = 'rejected'",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to count outbox rows: {err}"),
    };
    assert_eq!(rejected_rows, 2);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_corrected_ledger_audit_v1() {
    let db_path =
        std::env::temp_dir().join(format!("hw-snapshot-correct-{}.sqlite3", Ulid::new()));
    seed(&db_path);
    let application_id = apply(&db_path, "cand-1", "pos-1");

    let output = hw_output(
        &db_path,
        Some("recruiter"),
        &[
            "application",
            "reject",
            "--application-id",
            &application_id,
            "--reason",
            "missing certificate",
        ],
    );
    assert!(output.status.success());

    let output = hw_output(
        &db_path,
        Some("agency_admin"),
        &[
            "application",
            "correct",
            "--application-id",
            &application_id,
            "--status",
            "shortlisted",
            "--reason",
            "certificate arrived late",
        ],
    );
    let corrected = parse_json(&output);
    assert_eq!(corrected["application"]["status"], "shortlisted");
    assert_eq!(corrected["application"]["history"][2]["corrected"], true);

    let output = hw_output(
        &db_path,
        None,
        &["ledger", "audit", "--application-id", &application_id],
    );
    let expected = format!(
        "{{\n  \"contract_version\": \"ledger_audit.v1\",\n  \"application_id\": \"{}\",\n  \"status\": \"shortlisted\",\n  \"entries\": 3,\n  \"corrected_entries\": 1,\n  \"consistent\": true,\n  \"violations\": []\n}}",
        application_id
    );
    assert_eq!(pretty(&parse_json(&output)), expected);

    let _ = std::fs::remove_file(&db_path);
}
