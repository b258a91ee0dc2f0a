//! End-to-end scenarios on the embedded backend.
//!
//! These drive the real controller, gates and script engine against CSV files
//! in a scratch data root. The Python backend has its own ignored suite.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use insight_pipeline::cancel::CancelToken;
use insight_pipeline::controller::{RetryController, RunSummary};
use insight_pipeline::core::outcome::ErrorKind;
use insight_pipeline::core::types::{CodeSubmission, DataContext};
use insight_pipeline::io::config::{PipelineConfig, SandboxBackend};
use insight_pipeline::io::regenerator::Resubmit;
use insight_pipeline::sandbox::embedded::EmbeddedSandbox;
use insight_pipeline::test_support::{CountingSandbox, DataDir};
use insight_pipeline::{run_pipeline, run_pipeline_with_token};

fn embedded_config(data: &DataDir) -> PipelineConfig {
    PipelineConfig {
        backend: SandboxBackend::Embedded,
        data_root: Some(data.root().to_path_buf()),
        ..PipelineConfig::default()
    }
}

fn run_counted(config: &PipelineConfig, code: &str, context: DataContext) -> (RunSummary, u32) {
    let sandbox = CountingSandbox::new(EmbeddedSandbox::new());
    let summary = RetryController::new(config, &sandbox, Resubmit)
        .expect("controller")
        .run(CodeSubmission::new(code), context, &CancelToken::new(), |_| {})
        .expect("run");
    (summary, sandbox.calls())
}

#[test]
fn scalar_result_serializes_to_success_wire_shape() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new("result_value = 2 + 2"),
        data.context(),
        &embedded_config(&data),
    )
    .expect("pipeline");

    let wire = serde_json::to_value(&outcome).expect("serialize");
    assert_eq!(wire, json!({"status": "success", "value": 4}));
}

#[test]
fn table_result_keeps_column_order() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new(r#"result_df = df.group_sum("region", "units");"#),
        data.context(),
        &embedded_config(&data),
    )
    .expect("pipeline");

    let wire = serde_json::to_string(&outcome).expect("serialize");
    assert_eq!(
        wire,
        r#"{"status":"success","table":[{"region":"North","units":16},{"region":"South","units":4}]}"#
    );
}

#[test]
fn disallowed_pattern_never_reaches_the_sandbox() {
    let data = DataDir::with_sales_csv();
    let (summary, calls) = run_counted(
        &embedded_config(&data),
        "import shutil\nshutil.rmtree('/data')\nresult_value = 1",
        data.context(),
    );

    assert_eq!(calls, 0);
    assert_eq!(summary.executions, 0);
    let wire = summary.outcome.to_wire();
    assert_eq!(wire.error_type.as_deref(), Some("SafetyViolation"));
    assert!(
        wire.error_message
            .as_deref()
            .is_some_and(|message| message.contains("shutil.rmtree"))
    );
}

#[test]
fn division_by_zero_runs_exactly_max_iterations() {
    let data = DataDir::with_sales_csv();
    let (summary, calls) = run_counted(
        &embedded_config(&data),
        "let zero = 0;\nresult_value = 1 / zero;",
        data.context(),
    );

    assert_eq!(calls, 3);
    assert_eq!(summary.iterations, 3);
    let failure = summary.outcome.failure().expect("failure");
    assert_eq!(failure.kind, ErrorKind::BudgetExhausted);
    assert_eq!(failure.reported().kind, ErrorKind::RuntimeFault);
    assert_eq!(failure.reported().exception.as_deref(), Some("ZeroDivisionError"));
    assert_eq!(
        summary.outcome.to_wire().error_type.as_deref(),
        Some("RuntimeFault")
    );
}

#[test]
fn traversal_paths_are_rejected_without_execution() {
    let data = DataDir::with_sales_csv();
    let config = embedded_config(&data);
    let escapes = [
        "../sales.csv".to_string(),
        "..\\sales.csv".to_string(),
        "nested/../../sales.csv".to_string(),
        "NESTED\\..\\..\\sales.csv".to_string(),
        "%2E%2E/sales.csv".to_string(),
        "/etc/passwd".to_string(),
        "C:\\Windows\\win.ini".to_string(),
        "\\\\server\\share\\sales.csv".to_string(),
    ];
    for raw in escapes {
        let (summary, calls) = run_counted(
            &config,
            "result_value = df.len();",
            DataContext::with_path(raw.as_str()),
        );
        assert_eq!(calls, 0, "{raw}");
        assert_eq!(summary.iterations, 1, "{raw}");
        assert_eq!(
            summary.outcome.failure().map(|f| f.kind),
            Some(ErrorKind::MissingDataPath),
            "{raw}"
        );
    }
}

#[test]
fn marker_line_supplies_the_data_path() {
    let data = DataDir::with_sales_csv();
    let (summary, calls) = run_counted(
        &embedded_config(&data),
        "// FILE_PATH: sales.csv\nresult_value = df.len();",
        DataContext::default(),
    );
    assert_eq!(calls, 1);
    assert_eq!(summary.outcome.to_wire().value, Some(json!(3)));
}

#[test]
fn identical_requests_produce_identical_outcomes() {
    let data = DataDir::with_sales_csv();
    let config = embedded_config(&data);
    let code = r#"print(df.head(1)); result_value = df.mean("price");"#;

    let first = run_pipeline(CodeSubmission::new(code), data.context(), &config).expect("first");
    let second = run_pipeline(CodeSubmission::new(code), data.context(), &config).expect("second");
    assert!(first.is_success());
    assert_eq!(first, second);
}

#[test]
fn missing_cells_round_trip_as_null() {
    let data = DataDir::new();
    data.write("sparse.csv", "city,temp\nOslo,3.5\nLima,\nCairo,30.25\n");
    let outcome = run_pipeline(
        CodeSubmission::new(r#"result_value = df.column("temp");"#),
        DataContext::with_path(data.root().join("sparse.csv")),
        &embedded_config(&data),
    )
    .expect("pipeline");

    assert_eq!(outcome.to_wire().value, Some(json!([3.5, null, 30.25])));
}

#[test]
fn runaway_code_times_out_within_the_budget() {
    let data = DataDir::with_sales_csv();
    let config = PipelineConfig {
        max_iterations: 1,
        timeout_secs: 1,
        ..embedded_config(&data)
    };
    let started = Instant::now();
    let outcome = run_pipeline(
        CodeSubmission::new("let x = 0;\nloop { x += 1; }\nresult_value = x;"),
        data.context(),
        &config,
    )
    .expect("pipeline");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.to_wire().error_type.as_deref(), Some("Timeout"));
}

#[test]
fn caller_cancellation_interrupts_a_running_request() {
    let data = DataDir::with_sales_csv();
    let config = embedded_config(&data);
    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };

    let started = Instant::now();
    let outcome = run_pipeline_with_token(
        CodeSubmission::new("let x = 0;\nloop { x += 1; }\nresult_value = x;"),
        data.context(),
        &config,
        &token,
    )
    .expect("pipeline");
    canceller.join().expect("join canceller");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.to_wire().error_type.as_deref(), Some("Cancelled"));
}

#[test]
fn charts_and_output_reach_the_wire() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new(
            r#"let totals = df.group_sum("region", "units");
print(totals);
bar_chart("Units by region", totals.column("region"), totals.column("units"));
result_df = totals;"#,
        ),
        data.context(),
        &embedded_config(&data),
    )
    .expect("pipeline");

    let wire = outcome.to_wire();
    let charts = wire.charts.expect("charts");
    assert_eq!(charts.len(), 1);
    assert_eq!(charts[0].filename, "chart_1.svg");
    assert_eq!(charts[0].mime_type, "image/svg+xml");
    assert!(!charts[0].data_base64.is_empty());
    assert!(wire.stdout.is_some_and(|stdout| stdout.contains("North")));
}
