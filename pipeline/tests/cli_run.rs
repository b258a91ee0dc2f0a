//! CLI tests for `insight-pipeline run`, `check` and `init-config`.
//!
//! Spawns the binary in a scratch directory (which doubles as the data root)
//! and verifies stdout JSON and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

use insight_pipeline::exit_codes;
use insight_pipeline::io::config::{DEFAULT_CONFIG_FILE, PipelineConfig, load_config};
use insight_pipeline::test_support::SALES_CSV;

fn pipeline(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_insight-pipeline"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("insight-pipeline")
}

fn scratch(code: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("sales.csv"), SALES_CSV).expect("write csv");
    fs::write(temp.path().join("query.rhai"), code).expect("write code");
    temp
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

#[test]
fn run_success_prints_outcome_and_exits_ok() {
    let temp = scratch("result_value = df.sum(\"units\");");
    let output = pipeline(
        temp.path(),
        &[
            "run",
            "--code",
            "query.rhai",
            "--data",
            "sales.csv",
            "--backend",
            "embedded",
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output), json!({"status": "success", "value": 20}));
}

#[test]
fn run_error_outcome_exits_failed() {
    let temp = scratch("let zero = 0;\nresult_value = 1 / zero;");
    let output = pipeline(
        temp.path(),
        &[
            "run",
            "--code",
            "query.rhai",
            "--data",
            "sales.csv",
            "--backend",
            "embedded",
            "--max-iterations",
            "2",
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "error");
    assert_eq!(outcome["error_type"], "RuntimeFault");
}

#[test]
fn run_with_escaping_data_path_reports_missing_data_path() {
    let temp = scratch("result_value = 1;");
    let output = pipeline(
        temp.path(),
        &[
            "run",
            "--code",
            "query.rhai",
            "--data",
            "../sales.csv",
            "--backend",
            "embedded",
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert_eq!(stdout_json(&output)["error_type"], "MissingDataPath");
}

#[test]
fn run_with_unreadable_code_file_is_invalid() {
    let temp = scratch("");
    let output = pipeline(
        temp.path(),
        &["run", "--code", "missing.rhai", "--backend", "embedded"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(output.stdout.is_empty());
}

#[test]
fn check_reports_every_problem_and_exits_rejected() {
    let temp = scratch("import subprocess\nsubprocess.run(['rm', '-rf', '/'])\n");
    let output = pipeline(temp.path(), &["check", "--code", "query.rhai"]);

    assert_eq!(output.status.code(), Some(exit_codes::REJECTED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("subprocess"));
    assert!(stdout.contains("result_value"));
}

#[test]
fn check_approves_clean_code() {
    let temp = scratch("result_value = df.len();");
    let output = pipeline(temp.path(), &["check", "--code", "query.rhai"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "approved");
}

#[test]
fn init_config_writes_defaults_once() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = pipeline(temp.path(), &["init-config"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let config = load_config(&temp.path().join(DEFAULT_CONFIG_FILE)).expect("load");
    assert_eq!(config, PipelineConfig::default());

    let second = pipeline(temp.path(), &["init-config"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));

    let forced = pipeline(temp.path(), &["init-config", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn config_file_settings_apply_to_run() {
    let temp = scratch("let zero = 0;\nresult_value = 1 / zero;");
    fs::write(
        temp.path().join("strict.toml"),
        "max_iterations = 1\nbackend = \"embedded\"\n",
    )
    .expect("write config");
    let output = pipeline(
        temp.path(),
        &[
            "--config",
            "strict.toml",
            "run",
            "--code",
            "query.rhai",
            "--data",
            "sales.csv",
        ],
    );

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["error_type"], "RuntimeFault");
    assert!(
        outcome["error_message"]
            .as_str()
            .is_some_and(|message| message.starts_with("ZeroDivisionError"))
    );
}
