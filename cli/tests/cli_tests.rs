//! CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write as _;

fn definition_file(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    write!(file, "{content}").unwrap();
    file
}

const SMALL_DEFINITION: &str = r#"{
    "benchmark_id": "cli-smoke",
    "num_executor_nodes": 2,
    "settings": {"iterations": 1, "warmup": false},
    "competitions": [
        {"name": "c1", "requests": [{"body": {"query": "*"}}]}
    ]
}"#;

#[test]
fn no_arguments_shows_help_and_fails() {
    Command::cargo_bin("search-bench")
        .unwrap()
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn validate_accepts_good_definition() {
    let file = definition_file(SMALL_DEFINITION, ".json");
    Command::cargo_bin("search-bench")
        .unwrap()
        .args(["validate", "--definition"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("cli-smoke"));
}

#[test]
fn validate_rejects_malformed_definition() {
    let file = definition_file("{not json", ".json");
    Command::cargo_bin("search-bench")
        .unwrap()
        .args(["validate", "--definition"])
        .arg(file.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("malformed"));
}

#[test]
fn validate_rejects_invalid_definition() {
    let invalid = r#"{"benchmark_id": "x", "num_executor_nodes": 0, "competitions": []}"#;
    let file = definition_file(invalid, ".json");
    Command::cargo_bin("search-bench")
        .unwrap()
        .args(["validate", "--definition"])
        .arg(file.path())
        .assert()
        .failure()
        .code(2);
}

#[test]
fn run_completes_small_benchmark() {
    let file = definition_file(SMALL_DEFINITION, ".json");
    Command::cargo_bin("search-bench")
        .unwrap()
        .args(["run", "--nodes", "2", "--latency-ms", "0", "--definition"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"));
}

#[test]
fn run_fails_with_insufficient_executors() {
    let needs_five = SMALL_DEFINITION.replace("\"num_executor_nodes\": 2", "\"num_executor_nodes\": 5");
    let file = definition_file(&needs_five, ".json");
    Command::cargo_bin("search-bench")
        .unwrap()
        .args(["run", "--nodes", "1", "--definition"])
        .arg(file.path())
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("insufficient executor nodes"));
}
