#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

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

fn help_output(args: &[&str]) -> Output {
    match Command::new(whm_binary_path()).args(args).output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command {:?}: {err}", args),
    }
}

fn assert_lists(args: &[&str], required: &[&str]) {
    let output = help_output(args);
    assert!(output.status.success(), "help {:?} failed", args);
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in required {
        assert!(
            stdout.contains(name),
            "expected help {:?} to list {name}; output={stdout}",
            args
        );
    }
}

#[test]
fn top_level_help_lists_command_groups() {
    assert_lists(
        &["--help"],
        &[
            "db",
            "config",
            "run",
            "lot",
            "buffer",
            "inventory",
            "qc",
            "temperature",
            "genealogy",
            "flow",
            "audit",
            "--db",
            "--role",
            "--log-format",
        ],
    );
}

#[test]
fn run_help_lists_every_transition() {
    assert_lists(
        &["run", "--help"],
        &["create", "start", "advance", "hold", "resume", "complete", "abort", "steps"],
    );
}

#[test]
fn flow_and_genealogy_help_list_lifecycle_commands() {
    assert_lists(
        &["flow", "--help"],
        &["create", "update", "submit", "publish", "fork", "deprecate", "versions", "draft"],
    );
    assert_lists(
        &["genealogy", "--help"],
        &["link", "parents", "children", "tree", "trace"],
    );
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    let output = help_output(&["teleport"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
