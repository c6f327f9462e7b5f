#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn whm_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_whm") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/whm");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "warehouse-cli", "--bin", "whm"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build whm binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("whm-contracts-{}.sqlite3", Ulid::new()))
}

fn whm_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(whm_binary_path());
    command
        .current_dir(std::env::temp_dir())
        .env_remove("WAREHOUSE_LOG")
        .arg("--db")
        .arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run whm command {:?}: {err}", args),
    }
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

// The envelope is the last stderr line; log lines may precede it.
fn stderr_json(output: &Output) -> Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("");
    match serde_json::from_str::<Value>(last_line) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stderr as JSON: {err}\nstderr={}",
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn whm_json(db_path: &Path, args: &[&str]) -> Value {
    let output = whm_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn schema_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/v1/schemas")
        .join(format!("{name}.schema.json"))
}

fn assert_schema(name: &str, value: &Value) {
    let path = schema_path(name);
    let body = match fs::read_to_string(&path) {
        Ok(body) => body,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    let schema: Value = match serde_json::from_str(&body) {
        Ok(schema) => schema,
        Err(err) => panic!("failed to parse {}: {err}", path.display()),
    };
    let compiled = match jsonschema::validator_for(&schema) {
        Ok(compiled) => compiled,
        Err(err) => panic!("failed to compile {}: {err}", path.display()),
    };
    let messages: Vec<String> = compiled.iter_errors(value).map(|err| err.to_string()).collect();
    if !messages.is_empty() {
        panic!(
            "{} rejected output:\n{}\nvalue={}",
            name,
            messages.join("\n"),
            value
        );
    };
}

fn str_at(value: &Value, pointer: &str) -> String {
    match value.pointer(pointer).and_then(Value::as_str) {
        Some(found) => found.to_string(),
        None => panic!("missing string at {pointer} in {value}"),
    }
}

fn write_graph() -> PathBuf {
    let path = std::env::temp_dir().join(format!("whm-graph-{}.json", Ulid::new()));
    let graph = json!({
        "nodes": [
            {"id": "start", "position": {"x": 0, "y": 0},
             "data": {"label": {"en": "Receive", "hu": "Átvétel"}, "nodeType": "start"}},
            {"id": "grill", "position": {"x": 150, "y": 0},
             "data": {"label": {"en": "Grill"}, "nodeType": "process"}},
            {"id": "end", "position": {"x": 300, "y": 0},
             "data": {"label": {"en": "Ship"}, "nodeType": "end"}}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "grill"},
            {"id": "e2", "source": "grill", "target": "end"}
        ],
        "viewport": {"x": 0, "y": 0, "zoom": 1}
    });
    if let Err(err) = fs::write(&path, graph.to_string()) {
        panic!("failed to write graph file: {err}");
    }
    path
}

fn published_flow_version(db: &Path) -> String {
    let created = whm_json(
        db,
        &[
            "--role", "admin", "flow", "create", "--name", "en=Doner line", "--name",
            "hu=Döner sor",
        ],
    );
    let draft_id = str_at(&created, "/draft/id");
    let graph = write_graph();
    let graph_arg = graph.to_string_lossy().to_string();
    whm_json(
        db,
        &["--role", "admin", "flow", "update", &draft_id, "--graph-file", &graph_arg],
    );
    let outcome = whm_json(db, &["--role", "admin", "flow", "publish", &draft_id]);
    let _ = fs::remove_file(&graph);
    assert_schema("publish-outcome", &outcome);
    assert_eq!(outcome["new_draft"]["version_num"], json!(2));
    str_at(&outcome, "/published_version/id")
}

#[test]
fn db_and_config_commands_follow_contracts() {
    let db = temp_db();
    let status = whm_json(&db, &["db", "migrate"]);
    assert_schema("schema-status", &status);
    assert_eq!(status["up_to_date"], json!(true));

    let settings = whm_json(&db, &["config", "check"]);
    assert_schema("settings", &settings);
    assert_eq!(settings["secret_key"], json!("***"));
    assert_eq!(
        settings["database_path"],
        json!(db.to_string_lossy().to_string())
    );
    let _ = fs::remove_file(&db);
}

#[test]
fn production_flow_contract_end_to_end() {
    let db = temp_db();
    let version_id = published_flow_version(&db);

    let key = "9f1c2d3e-4b5a-4c6d-8e7f-0a1b2c3d4e5f";
    let created = whm_json(
        &db,
        &["run", "create", "--flow-version-id", &version_id, "--idempotency-key", key],
    );
    assert_schema("idempotent-run", &created);
    assert_eq!(created["replayed"], json!(false));
    let run_id = str_at(&created, "/value/id");

    let replayed = whm_json(
        &db,
        &["run", "create", "--flow-version-id", &version_id, "--idempotency-key", key],
    );
    assert_eq!(replayed["replayed"], json!(true));
    assert_eq!(replayed["value"]["run_code"], created["value"]["run_code"]);

    let started = whm_json(&db, &["run", "start", &run_id]);
    assert_schema("production-run", &started);
    assert_eq!(started["status"], json!("RUNNING"));

    let lot = whm_json(
        &db,
        &["lot", "create", "--code", "LOT-MIX-E2E", "--lot-type", "MIX", "--run-id", &run_id,
          "--step", "0", "--weight-kg", "40", "--temperature-c", "-1.5"],
    );
    assert_schema("lot", &lot);
    let lot_id = str_at(&lot, "/id");

    let buffer = whm_json(
        &db,
        &["buffer", "create", "--code", "MIX-E2E", "--buffer-type", "MIX", "--allow", "MIX",
          "--capacity-kg", "1000", "--temp-min-c", "-5", "--temp-max-c", "4"],
    );
    let buffer_id = str_at(&buffer, "/id");

    let received = whm_json(
        &db,
        &["inventory", "receive", "--lot-id", &lot_id, "--to-buffer-id", &buffer_id,
          "--run-id", &run_id, "--quantity-kg", "30.250",
          "--idempotency-key", "3b0f6a52-8c1d-4e2f-9a7b-5c6d7e8f9012"],
    );
    assert_schema("stock-move", &received);
    assert_eq!(received["value"]["quantity_kg"], json!("30.250"));

    let unkeyed = whm_output(
        &db,
        &["inventory", "receive", "--lot-id", &lot_id, "--to-buffer-id", &buffer_id,
          "--run-id", &run_id, "--quantity-kg", "30.250"],
    );
    assert_eq!(unkeyed.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&unkeyed.stderr).contains("--idempotency-key"));
    let moves = whm_json(&db, &["inventory", "moves", "--lot-id", &lot_id]);
    assert_eq!(moves.as_array().map(Vec::len), Some(1));

    let over_draw = whm_output(
        &db,
        &["inventory", "ship", "--lot-id", &lot_id, "--from-buffer-id", &buffer_id,
          "--quantity-kg", "31", "--idempotency-key", "6d2e4f70-1a3b-4c5d-8e9f-a0b1c2d3e4f5"],
    );
    assert_eq!(over_draw.status.code(), Some(2));
    assert_schema("error-envelope", &stderr_json(&over_draw));

    let reading = whm_json(
        &db,
        &["temperature", "log", "--value-c", "5.5", "--measurement", "SURFACE",
          "--lot-id", &lot_id],
    );
    assert_schema("temperature-log", &reading);
    assert_eq!(reading["is_violation"], json!(true));

    let held = whm_json(&db, &["lot", "get", &lot_id]);
    assert_eq!(held["status"], json!("HOLD"));

    let blocked = whm_output(&db, &["run", "advance", &run_id]);
    assert_eq!(blocked.status.code(), Some(2));
    let envelope = stderr_json(&blocked);
    assert_schema("error-envelope", &envelope);
    assert_eq!(envelope["error"]["code"], json!("precondition_failed"));

    let trail = whm_json(
        &db,
        &["audit", "trail", "--entity-type", "lot", "--entity-id", &lot_id],
    );
    assert_schema("audit-trail", &trail);
    let events: Vec<&str> = match trail.as_array() {
        Some(items) => items
            .iter()
            .filter_map(|event| event["event_type"].as_str())
            .collect(),
        None => panic!("trail must be an array: {trail}"),
    };
    assert_eq!(events, vec!["LOT_CREATED", "TEMP_VIOLATION_HOLD"]);
    let _ = fs::remove_file(&db);
}

#[test]
fn genealogy_contract_end_to_end() {
    let db = temp_db();
    let raw = whm_json(&db, &["lot", "create", "--code", "RAW-G1", "--lot-type", "RAW"]);
    let skewer = whm_json(&db, &["lot", "create", "--code", "SKW-G1", "--lot-type", "SKW"]);
    let frozen = whm_json(&db, &["lot", "create", "--code", "FRZ-G1", "--lot-type", "FRZ"]);
    let raw_id = str_at(&raw, "/id");
    let skewer_id = str_at(&skewer, "/id");
    let frozen_id = str_at(&frozen, "/id");

    whm_json(
        &db,
        &["genealogy", "link", "--parent-lot-id", &raw_id, "--child-lot-id", &skewer_id,
          "--quantity-kg", "12.5"],
    );
    whm_json(
        &db,
        &["genealogy", "link", "--parent-lot-id", &skewer_id, "--child-lot-id", &frozen_id],
    );

    let cycle = whm_output(
        &db,
        &["genealogy", "link", "--parent-lot-id", &frozen_id, "--child-lot-id", &raw_id],
    );
    assert_eq!(cycle.status.code(), Some(4));
    assert_eq!(stderr_json(&cycle)["error"]["code"], json!("conflict"));

    let ancestors = whm_json(&db, &["genealogy", "parents", &frozen_id, "--depth", "2"]);
    assert_schema("lineage", &ancestors);
    assert_eq!(ancestors["nodes"].as_array().map(Vec::len), Some(2));

    let trace = whm_json(&db, &["genealogy", "trace", "SKW-G1"]);
    assert_schema("deep-trace", &trace);
    assert_eq!(trace["ancestor_count"], json!(1));
    assert_eq!(trace["descendant_count"], json!(1));
    assert_eq!(trace["cached"], json!(false));

    let cached = whm_json(&db, &["genealogy", "trace", "SKW-G1"]);
    assert_eq!(cached["cached"], json!(true));
    let refreshed = whm_json(&db, &["genealogy", "trace", "SKW-G1", "--refresh"]);
    assert_eq!(refreshed["cached"], json!(false));
    let _ = fs::remove_file(&db);
}

#[test]
fn failures_map_to_stable_exit_codes() {
    let db = temp_db();

    let invalid = whm_output(&db, &["run", "get", "not-a-ulid"]);
    assert_eq!(invalid.status.code(), Some(2));
    assert_schema("error-envelope", &stderr_json(&invalid));
    assert!(invalid.stdout.is_empty());

    let unkeyed = whm_output(
        &db,
        &["run", "create", "--flow-version-id", &Ulid::new().to_string()],
    );
    assert_eq!(unkeyed.status.code(), Some(2));
    assert!(unkeyed.stdout.is_empty());

    let missing = whm_output(&db, &["run", "get", &Ulid::new().to_string()]);
    assert_eq!(missing.status.code(), Some(3));
    assert_eq!(stderr_json(&missing)["error"]["code"], json!("not_found"));

    let forbidden = whm_output(
        &db,
        &["--role", "viewer", "lot", "create", "--code", "LOT-V", "--lot-type", "RAW"],
    );
    assert_eq!(forbidden.status.code(), Some(5));
    assert_eq!(stderr_json(&forbidden)["error"]["code"], json!("forbidden"));

    whm_json(&db, &["lot", "create", "--code", "LOT-DUP", "--lot-type", "RAW"]);
    let duplicate = whm_output(&db, &["lot", "create", "--code", "LOT-DUP", "--lot-type", "RAW"]);
    assert_eq!(duplicate.status.code(), Some(4));

    let missing_config = whm_output(
        &db,
        &["--config", "/nonexistent/warehouse.toml", "config", "check"],
    );
    assert_eq!(missing_config.status.code(), Some(6));
    assert_eq!(
        stderr_json(&missing_config)["error"]["code"],
        json!("configuration_error")
    );
    let _ = fs::remove_file(&db);
}
