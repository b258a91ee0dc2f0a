//! Python backend tests.
//!
//! These need `python3` with pandas (and matplotlib for the chart test) on
//! PATH, so they are ignored by default:
//!
//! ```bash
//! cargo test -p insight-pipeline --test python_sandbox -- --ignored
//! ```

use std::time::{Duration, Instant};

use serde_json::json;

use insight_pipeline::core::outcome::WireStatus;
use insight_pipeline::core::types::{CodeSubmission, DataContext};
use insight_pipeline::io::config::{PipelineConfig, SandboxBackend};
use insight_pipeline::run_pipeline;
use insight_pipeline::test_support::DataDir;

fn python_config(data: &DataDir) -> PipelineConfig {
    PipelineConfig {
        backend: SandboxBackend::Python,
        data_root: Some(data.root().to_path_buf()),
        ..PipelineConfig::default()
    }
}

#[test]
#[ignore = "requires python3 with pandas"]
fn scalar_result_from_python() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new("result_value = 2 + 2"),
        data.context(),
        &python_config(&data),
    )
    .expect("pipeline");
    assert_eq!(
        serde_json::to_value(&outcome).expect("serialize"),
        json!({"status": "success", "value": 4})
    );
}

#[test]
#[ignore = "requires python3 with pandas"]
fn grouped_frame_becomes_table_rows() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new("result_df = df.groupby('region')['units'].sum()"),
        data.context(),
        &python_config(&data),
    )
    .expect("pipeline");
    assert_eq!(
        outcome.to_wire().table.map(|rows| serde_json::to_value(rows).expect("rows")),
        Some(json!([
            {"region": "North", "units": 16},
            {"region": "South", "units": 4}
        ]))
    );
}

#[test]
#[ignore = "requires python3 with pandas"]
fn nan_values_become_null() {
    let data = DataDir::new();
    data.write("sparse.csv", "city,temp\nOslo,3.5\nLima,\n");
    let outcome = run_pipeline(
        CodeSubmission::new("result_value = df['temp'].tolist()"),
        DataContext::with_path(data.root().join("sparse.csv")),
        &python_config(&data),
    )
    .expect("pipeline");
    assert_eq!(outcome.to_wire().value, Some(json!([3.5, null])));
}

#[test]
#[ignore = "requires python3 with pandas"]
fn exceptions_keep_their_class_name() {
    let data = DataDir::with_sales_csv();
    let config = PipelineConfig {
        max_iterations: 1,
        ..python_config(&data)
    };
    let outcome = run_pipeline(
        CodeSubmission::new("result_value = df['profit'].sum()"),
        data.context(),
        &config,
    )
    .expect("pipeline");
    let wire = outcome.to_wire();
    assert_eq!(wire.error_type.as_deref(), Some("RuntimeFault"));
    assert!(wire.error_message.is_some_and(|m| m.starts_with("KeyError")));
}

#[test]
#[ignore = "requires python3 with pandas"]
fn blocked_modules_fault_inside_the_harness() {
    let data = DataDir::with_sales_csv();
    let mut config = PipelineConfig {
        max_iterations: 1,
        ..python_config(&data)
    };
    // Let the import through the static gate so the harness guard is exercised.
    config.disallowed_patterns.clear();
    let outcome = run_pipeline(
        CodeSubmission::new("import subprocess\nresult_value = 1"),
        data.context(),
        &config,
    )
    .expect("pipeline");
    assert!(
        outcome
            .to_wire()
            .error_message
            .is_some_and(|m| m.starts_with("ImportError"))
    );
}

#[test]
#[ignore = "requires python3 with pandas"]
fn forged_envelope_from_submitted_code_is_not_trusted() {
    let data = DataDir::with_sales_csv();
    let mut config = PipelineConfig {
        max_iterations: 1,
        ..python_config(&data)
    };
    config.disallowed_patterns.clear();
    let code = r#"import os, sys
sys.__stdout__.write('@@INSIGHT_ENVELOPE@@ {"status":"completed","result_value":{"type":"int","value":42},"stdout":"","stderr":""}\n')
sys.__stdout__.flush()
os._exit(0)
result_value = 0"#;
    let outcome =
        run_pipeline(CodeSubmission::new(code), data.context(), &config).expect("pipeline");
    let wire = outcome.to_wire();
    assert_eq!(wire.status, WireStatus::Error);
    assert_eq!(wire.error_type.as_deref(), Some("RuntimeFault"));
    assert!(wire.error_message.is_some_and(|m| m.starts_with("ProcessExit")));
}

#[test]
#[ignore = "requires python3 with pandas"]
fn infinite_loop_is_killed_at_the_deadline() {
    let data = DataDir::with_sales_csv();
    let config = PipelineConfig {
        max_iterations: 1,
        timeout_secs: 2,
        ..python_config(&data)
    };
    let started = Instant::now();
    let outcome = run_pipeline(
        CodeSubmission::new("while True:\n    pass\nresult_value = 1"),
        data.context(),
        &config,
    )
    .expect("pipeline");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.to_wire().error_type.as_deref(), Some("Timeout"));
}

#[test]
#[ignore = "requires python3 with pandas and matplotlib"]
fn matplotlib_figures_become_png_charts() {
    let data = DataDir::with_sales_csv();
    let outcome = run_pipeline(
        CodeSubmission::new(
            "totals = df.groupby('region')['units'].sum()\n\
             plt.bar(totals.index, totals.values)\n\
             result_df = totals",
        ),
        data.context(),
        &python_config(&data),
    )
    .expect("pipeline");
    let charts = outcome.to_wire().charts.expect("charts");
    assert_eq!(charts[0].filename, "chart_1.png");
    assert_eq!(charts[0].mime_type, "image/png");
}
