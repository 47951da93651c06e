#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::{params, Connection};
use serde_json::Value;
use ulid::Ulid;

fn migrator_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_migrator") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/migrator");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "migrator-cli", "--bin", "migrator"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build migrator binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

struct Fixture {
    base: PathBuf,
    target: PathBuf,
    bus: PathBuf,
}

impl Fixture {
    fn new(base_rows: &[(i64, &str)], target_rows: &[(i64, &str)]) -> Self {
        let run = Ulid::new();
        let dir = std::env::temp_dir();
        let fixture = Self {
            base: dir.join(format!("migrator-contract-base-{run}.sqlite3")),
            target: dir.join(format!("migrator-contract-target-{run}.sqlite3")),
            bus: dir.join(format!("migrator-contract-bus-{run}.sqlite3")),
        };
        seed(&fixture.base, base_rows);
        seed(&fixture.target, target_rows);
        fixture
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut command = Command::new(migrator_binary_path());
        command
            .arg("--base")
            .arg(&self.base)
            .arg("--target")
            .arg(&self.target)
            .arg("--bus")
            .arg(&self.bus)
            .arg("--table")
            .arg("interactives");
        for arg in args {
            command.arg(arg);
        }

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run migrator command {args:?}: {err}"),
        }
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "command {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        stdout_json(&output)
    }

    fn cleanup(&self) {
        for path in [&self.base, &self.target, &self.bus] {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn seed(path: &Path, rows: &[(i64, &str)]) {
    let conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open fixture db: {err}"),
    };
    if let Err(err) = conn.execute_batch(
        "CREATE TABLE interactives (id INTEGER PRIMARY KEY, biz TEXT NOT NULL, utime INTEGER NOT NULL);",
    ) {
        panic!("failed to create fixture table: {err}");
    }
    for (id, biz) in rows {
        if let Err(err) = conn.execute(
            "INSERT INTO interactives(id, biz, utime) VALUES (?1, ?2, ?3)",
            params![id, biz, id * 10],
        ) {
            panic!("failed to seed fixture row: {err}");
        }
    }
}

fn ids(path: &Path) -> Vec<i64> {
    let conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let mut stmt = match conn.prepare("SELECT id FROM interactives ORDER BY id") {
        Ok(stmt) => stmt,
        Err(err) => panic!("failed to prepare id query: {err}"),
    };
    let rows = match stmt.query_map([], |row| row.get::<_, i64>(0)) {
        Ok(rows) => rows,
        Err(err) => panic!("failed to query ids: {err}"),
    };
    rows.map(|row| match row {
        Ok(id) => id,
        Err(err) => panic!("failed to read id: {err}"),
    })
    .collect()
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(migrator_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["validate", "fix", "events", "columns", "exec", "policy"] {
        assert!(stdout.contains(required), "help output missing {required}: {stdout}");
    }
}

#[test]
fn validate_reports_divergences_and_drain_repairs_them() {
    let fixture = Fixture::new(&[(1, "a"), (2, "b")], &[(1, "a"), (3, "c")]);

    let report = fixture.run_json(&["validate"]);
    assert_eq!(
        report.pointer("/base_to_target/status").and_then(Value::as_str),
        Some("completed")
    );
    assert_eq!(
        report.pointer("/target_to_base/status").and_then(Value::as_str),
        Some("completed")
    );
    assert_eq!(report.pointer("/progress/events_emitted").and_then(Value::as_u64), Some(2));

    let events = fixture.run_json(&["events", "list"]);
    let mut reported: Vec<(i64, String)> = events
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.pointer("/event/record_id").and_then(Value::as_i64)?;
                    let kind = item.pointer("/event/kind").and_then(Value::as_str)?;
                    Some((id, kind.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    reported.sort();
    assert_eq!(
        reported,
        vec![(2, "target_missing".to_string()), (3, "base_missing".to_string())]
    );

    let drained = fixture.run_json(&["fix", "drain"]);
    assert_eq!(drained.get("upserted").and_then(Value::as_u64), Some(1));
    assert_eq!(drained.get("deleted").and_then(Value::as_u64), Some(1));
    assert_eq!(ids(&fixture.target), vec![1, 2]);

    let lag = fixture.run_json(&["events", "lag"]);
    assert_eq!(lag.get("lag_events").and_then(Value::as_i64), Some(0));
    assert_eq!(lag.get("topic").and_then(Value::as_str), Some("migrator_interactives"));

    fixture.cleanup();
}

#[test]
fn incremental_validate_skips_records_older_than_watermark() {
    let fixture = Fixture::new(&[(1, "a"), (2, "b"), (3, "c")], &[]);

    let report = fixture.run_json(&["validate", "--incremental", "--watermark", "20"]);
    assert_eq!(report.pointer("/progress/base_scanned").and_then(Value::as_u64), Some(2));
    assert_eq!(report.pointer("/progress/watermark").and_then(Value::as_i64), Some(30));

    fixture.cleanup();
}

#[test]
fn columns_and_exec_contracts() {
    let fixture = Fixture::new(&[], &[]);

    let columns = fixture.run_json(&["columns"]);
    assert_eq!(
        columns.get("columns"),
        Some(&serde_json::json!(["id", "biz", "utime"]))
    );

    let exec = fixture.run_json(&[
        "exec",
        "--policy",
        "target_first",
        "--statement",
        "INSERT INTO interactives(id, biz, utime) VALUES (?1, ?2, ?3)",
        "--param",
        "7",
        "--param",
        "z",
        "--param",
        "70",
    ]);
    assert_eq!(exec.get("policy").and_then(Value::as_str), Some("target_first"));
    assert_eq!(exec.get("rows_affected").and_then(Value::as_u64), Some(1));
    assert_eq!(exec.pointer("/telemetry/secondary_writes").and_then(Value::as_u64), Some(1));
    assert_eq!(ids(&fixture.base), vec![7]);
    assert_eq!(ids(&fixture.target), vec![7]);

    let rejected = fixture.run(&["exec", "--policy", "everywhere", "--statement", "SELECT 1"]);
    assert!(!rejected.status.success());
    assert!(String::from_utf8_lossy(&rejected.stderr).contains("unknown write policy name"));

    fixture.cleanup();
}
