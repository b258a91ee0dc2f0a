//! In-process backend running submissions in a restricted Rhai engine.
//!
//! The engine has no filesystem, network or module access. The data file is
//! read by the host and exposed as a read-only [`DataFrame`] constant; charts
//! go to an in-memory SVG surface. Deadlines and cancellation are enforced
//! from the engine's progress callback, so a runaway loop is terminated
//! without touching threads or signals.

use std::cell::RefCell;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::rc::Rc;

use anyhow::{Context, Result};
use rhai::{Array, Dynamic, Engine, EvalAltResult, INT, Map, Scope};
use tracing::{debug, instrument, warn};

use crate::cancel::{CancelScope, StopReason};
use crate::core::normalize::RuntimeValue;
use crate::core::types::{RESULT_DF, RESULT_VALUE};
use crate::sandbox::capture::BoundedBuffer;
use crate::sandbox::chart::{ChartKind, ChartSink};
use crate::sandbox::frame::{Cell, DataFrame, FrameError};
use crate::sandbox::{Bindings, CapturedOutput, Sandbox, SandboxRequest, SandboxRun};

/// Operations between deadline checks.
const PROGRESS_STRIDE: u64 = 128;

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Placeholder bound to the result names until the code assigns them.
#[derive(Debug, Clone, Copy)]
struct Unbound;

/// Everything the engine callbacks write during one run.
struct RunCapture {
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
    charts: ChartSink,
}

impl RunCapture {
    fn new(limit: usize) -> Self {
        Self {
            stdout: BoundedBuffer::new(limit),
            stderr: BoundedBuffer::new(limit),
            charts: ChartSink::default(),
        }
    }

    fn output(&mut self) -> CapturedOutput {
        let stdout = std::mem::replace(&mut self.stdout, BoundedBuffer::new(0));
        let stderr = std::mem::replace(&mut self.stderr, BoundedBuffer::new(0));
        CapturedOutput {
            stdout: stdout.finish("stdout"),
            stderr: stderr.finish("stderr"),
        }
    }
}

/// Embedded script backend.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSandbox;

impl EmbeddedSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for EmbeddedSandbox {
    #[instrument(skip_all, fields(backend = "embedded", data_path = %request.data_path.display()))]
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun> {
        if let Some(reason) = scope.check() {
            return Ok(stopped(reason, CapturedOutput::default()));
        }

        let text = match fs::read_to_string(&request.data_path) {
            Ok(text) => text,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Ok(SandboxRun::MissingDataPath {
                    message: format!("data file not found: {}", request.data_path.display()),
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read data file {}", request.data_path.display()));
            }
        };
        let frame = match DataFrame::from_csv(&text) {
            Ok(frame) => frame,
            Err(err) => {
                return Ok(SandboxRun::MissingDataPath {
                    message: format!(
                        "could not read {} as a table: {err}",
                        request.data_path.display()
                    ),
                });
            }
        };
        debug!(rows = frame.len(), columns = frame.columns().len(), "data handle loaded");

        let capture = Rc::new(RefCell::new(RunCapture::new(request.output_limit_bytes)));
        let engine = build_engine(&capture, scope);

        let ast = match engine.compile(&request.code) {
            Ok(ast) => ast,
            Err(err) => {
                return Ok(SandboxRun::Faulted {
                    exception: "SyntaxError".to_string(),
                    message: err.to_string(),
                    output: CapturedOutput::default(),
                });
            }
        };

        let mut vars = Scope::new();
        vars.push_constant(request.data_handle.clone(), frame);
        vars.push(RESULT_VALUE, Unbound);
        vars.push(RESULT_DF, Unbound);

        let result = engine.run_ast_with_scope(&mut vars, &ast);
        drop(engine);
        let mut capture = capture.borrow_mut();
        let output = capture.output();

        if let Err(err) = result {
            return Ok(classify_error(*err, output));
        }

        let bindings = Bindings {
            value: bound(&vars, RESULT_VALUE),
            table: bound(&vars, RESULT_DF),
        };
        let charts = std::mem::take(&mut capture.charts).into_charts();
        debug!(
            has_value = bindings.value.is_some(),
            has_table = bindings.table.is_some(),
            charts = charts.len(),
            "embedded run completed"
        );
        Ok(SandboxRun::Completed {
            bindings,
            output,
            charts,
        })
    }
}

fn stopped(reason: StopReason, output: CapturedOutput) -> SandboxRun {
    match reason {
        StopReason::Cancelled => SandboxRun::Cancelled,
        StopReason::TimedOut => SandboxRun::TimedOut { output },
    }
}

fn bound(vars: &Scope<'_>, name: &str) -> Option<RuntimeValue> {
    let value = vars.get_value::<Dynamic>(name)?;
    if value.is::<Unbound>() {
        None
    } else {
        Some(dynamic_to_runtime(&value))
    }
}

fn build_engine(capture: &Rc<RefCell<RunCapture>>, scope: &CancelScope) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 32);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(10 * 1_048_576);
    engine.set_max_array_size(1_000_000);
    engine.set_max_map_size(100_000);
    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

    let progress_scope = scope.clone();
    engine.on_progress(move |operations| {
        if operations % PROGRESS_STRIDE != 0 {
            return None;
        }
        progress_scope
            .check()
            .map(|reason| Dynamic::from(reason.as_str().to_string()))
    });

    let sink = Rc::clone(capture);
    engine.on_print(move |text| sink.borrow_mut().stdout.push_line(text));
    let sink = Rc::clone(capture);
    engine.on_debug(move |text, _source, _pos| sink.borrow_mut().stderr.push_line(text));

    register_frame_api(&mut engine);
    register_chart_api(&mut engine, capture);
    engine
}

fn frame_err(err: FrameError) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn register_frame_api(engine: &mut Engine) {
    engine.register_type_with_name::<DataFrame>("DataFrame");
    engine.register_type_with_name::<Unbound>("Unbound");

    engine.register_fn("to_string", |frame: DataFrame| frame.to_string());
    engine.register_fn("to_debug", |frame: DataFrame| frame.to_string());
    engine.register_fn("columns", |frame: DataFrame| -> Array {
        frame.columns().iter().cloned().map(Dynamic::from).collect()
    });
    engine.register_fn("len", |frame: DataFrame| to_int(frame.len()));
    engine.register_fn("ncols", |frame: DataFrame| to_int(frame.columns().len()));
    engine.register_fn("column", |frame: DataFrame, name: &str| -> FnResult<Array> {
        let cells = frame.column(name).map_err(frame_err)?;
        Ok(cells.iter().map(cell_to_dynamic).collect())
    });
    engine.register_fn("row", |frame: DataFrame, index: INT| -> FnResult<Map> {
        let row = frame.row(index).map_err(frame_err)?;
        Ok(row_to_map(row))
    });
    engine.register_fn("records", |frame: DataFrame| -> Array {
        let columns = frame.columns();
        frame
            .rows()
            .iter()
            .map(|row| {
                let pairs = columns.iter().cloned().zip(row.iter().cloned()).collect();
                Dynamic::from_map(row_to_map(pairs))
            })
            .collect()
    });
    engine.register_fn("head", |frame: DataFrame, n: INT| frame.head(n));
    engine.register_fn("select", |frame: DataFrame, names: Array| -> FnResult<DataFrame> {
        let names = names
            .into_iter()
            .map(|name| {
                name.into_string()
                    .map_err(|actual| frame_err(type_error("column names must be strings", actual)))
            })
            .collect::<FnResult<Vec<_>>>()?;
        frame.select(&names).map_err(frame_err)
    });
    engine.register_fn(
        "filter_eq",
        |frame: DataFrame, column: &str, value: Dynamic| -> FnResult<DataFrame> {
            let cell = dynamic_to_cell(&value).map_err(frame_err)?;
            frame.filter_eq(column, &cell).map_err(frame_err)
        },
    );
    engine.register_fn("sum", |frame: DataFrame, column: &str| -> FnResult<Dynamic> {
        frame.sum(column).map(|cell| cell_to_dynamic(&cell)).map_err(frame_err)
    });
    engine.register_fn("mean", |frame: DataFrame, column: &str| -> FnResult<Dynamic> {
        frame.mean(column).map(|cell| cell_to_dynamic(&cell)).map_err(frame_err)
    });
    engine.register_fn("min", |frame: DataFrame, column: &str| -> FnResult<Dynamic> {
        frame.min(column).map(|cell| cell_to_dynamic(&cell)).map_err(frame_err)
    });
    engine.register_fn("max", |frame: DataFrame, column: &str| -> FnResult<Dynamic> {
        frame.max(column).map(|cell| cell_to_dynamic(&cell)).map_err(frame_err)
    });
    engine.register_fn("count", |frame: DataFrame, column: &str| -> FnResult<INT> {
        frame.count(column).map_err(frame_err)
    });
    engine.register_fn("unique", |frame: DataFrame, column: &str| -> FnResult<Array> {
        let cells = frame.unique(column).map_err(frame_err)?;
        Ok(cells.iter().map(cell_to_dynamic).collect())
    });
    engine.register_fn(
        "group_sum",
        |frame: DataFrame, key: &str, value: &str| -> FnResult<DataFrame> {
            frame.group_sum(key, value).map_err(frame_err)
        },
    );
    engine.register_fn("sort_by", |frame: DataFrame, column: &str| -> FnResult<DataFrame> {
        frame.sort_by(column, true).map_err(frame_err)
    });
    engine.register_fn(
        "sort_by",
        |frame: DataFrame, column: &str, ascending: bool| -> FnResult<DataFrame> {
            frame.sort_by(column, ascending).map_err(frame_err)
        },
    );
    engine.register_fn("table", |records: Array| -> FnResult<DataFrame> {
        table_from_records(records).map_err(frame_err)
    });
}

fn register_chart_api(engine: &mut Engine, capture: &Rc<RefCell<RunCapture>>) {
    for (name, kind) in [("bar_chart", ChartKind::Bar), ("line_chart", ChartKind::Line)] {
        let sink = Rc::clone(capture);
        engine.register_fn(
            name,
            move |title: &str, labels: Array, values: Array| -> FnResult<()> {
                let labels: Vec<String> = labels.iter().map(ToString::to_string).collect();
                let values = values
                    .iter()
                    .map(|value| {
                        value
                            .as_float()
                            .or_else(|_| value.as_int().map(|v| v as f64))
                            .map_err(|actual| type_error("chart values must be numbers", actual))
                    })
                    .collect::<Result<Vec<f64>, FrameError>>()
                    .map_err(frame_err)?;
                sink.borrow_mut()
                    .charts
                    .draw(kind, title, &labels, &values)
                    .map_err(frame_err)
            },
        );
    }
}

fn type_error(what: &str, actual: &str) -> FrameError {
    FrameError {
        exception: "TypeError",
        message: format!("{what}, got {actual}"),
    }
}

fn to_int(n: usize) -> INT {
    INT::try_from(n).unwrap_or(INT::MAX)
}

fn row_to_map(pairs: Vec<(String, Cell)>) -> Map {
    pairs
        .into_iter()
        .map(|(column, cell)| (column.into(), cell_to_dynamic(&cell)))
        .collect()
}

fn cell_to_dynamic(cell: &Cell) -> Dynamic {
    match cell {
        Cell::Missing => Dynamic::UNIT,
        Cell::Bool(value) => Dynamic::from(*value),
        Cell::Int(value) => Dynamic::from(*value),
        Cell::Float(value) => Dynamic::from(*value),
        Cell::Text(value) => Dynamic::from(value.clone()),
    }
}

fn dynamic_to_cell(value: &Dynamic) -> Result<Cell, FrameError> {
    if value.is_unit() {
        Ok(Cell::Missing)
    } else if let Ok(value) = value.as_bool() {
        Ok(Cell::Bool(value))
    } else if let Ok(value) = value.as_int() {
        Ok(Cell::Int(value))
    } else if let Ok(value) = value.as_float() {
        Ok(Cell::Float(value))
    } else if let Ok(value) = value.as_char() {
        Ok(Cell::Text(value.to_string()))
    } else if value.is_string() {
        Ok(Cell::Text(value.to_string()))
    } else {
        Err(type_error("cells must be scalars", value.type_name()))
    }
}

/// Columns appear in first-seen order; absent keys read as missing.
fn table_from_records(records: Array) -> Result<DataFrame, FrameError> {
    let mut columns: Vec<String> = Vec::new();
    let mut maps = Vec::with_capacity(records.len());
    for record in records {
        let map = record
            .try_cast::<Map>()
            .ok_or_else(|| type_error("table() expects an array of object maps", "another type"))?;
        for key in map.keys() {
            if !columns.iter().any(|column| column == key.as_str()) {
                columns.push(key.to_string());
            }
        }
        maps.push(map);
    }
    let rows = maps
        .iter()
        .map(|map| {
            columns
                .iter()
                .map(|column| {
                    map.get(column.as_str())
                        .map_or(Ok(Cell::Missing), dynamic_to_cell)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    DataFrame::new(columns, rows)
}

/// Describe an engine value for the normalizer.
fn dynamic_to_runtime(value: &Dynamic) -> RuntimeValue {
    let value = value.flatten_clone();
    if value.is_unit() {
        RuntimeValue::Null
    } else if let Ok(value) = value.as_bool() {
        RuntimeValue::Bool { value }
    } else if let Ok(value) = value.as_int() {
        RuntimeValue::Int { value }
    } else if let Ok(value) = value.as_float() {
        if value.is_nan() {
            RuntimeValue::Missing
        } else if value.is_finite() {
            RuntimeValue::Float { value }
        } else {
            RuntimeValue::NonFinite {
                repr: value.to_string(),
            }
        }
    } else if let Ok(value) = value.as_char() {
        RuntimeValue::Str {
            value: value.to_string(),
        }
    } else if value.is_string() {
        RuntimeValue::Str {
            value: value.to_string(),
        }
    } else if value.is::<DataFrame>() {
        value
            .try_cast::<DataFrame>()
            .map_or(RuntimeValue::Null, |frame| frame.to_runtime())
    } else if value.is_array() {
        match value.into_array() {
            Ok(items) => RuntimeValue::List {
                items: items.iter().map(dynamic_to_runtime).collect(),
            },
            Err(type_name) => unsupported(type_name, ""),
        }
    } else if value.is_map() {
        let type_name = value.type_name().to_string();
        match value.try_cast::<Map>() {
            Some(map) => RuntimeValue::Map {
                entries: map
                    .iter()
                    .map(|(key, value)| (key.to_string(), dynamic_to_runtime(value)))
                    .collect(),
            },
            None => unsupported(&type_name, ""),
        }
    } else {
        unsupported(value.type_name(), &value.to_string())
    }
}

fn unsupported(type_name: &str, repr: &str) -> RuntimeValue {
    RuntimeValue::Unsupported {
        type_name: type_name.to_string(),
        repr: repr.to_string(),
    }
}

/// Map an engine error onto the exception vocabulary the pipeline reports.
fn classify_error(err: EvalAltResult, output: CapturedOutput) -> SandboxRun {
    let message = err.to_string();
    let (exception, message) = match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, ..) => {
            return classify_error(*inner, output);
        }
        EvalAltResult::ErrorTerminated(token, ..) => {
            let reason = if token.to_string() == StopReason::Cancelled.as_str() {
                StopReason::Cancelled
            } else {
                StopReason::TimedOut
            };
            warn!(reason = reason.as_str(), "embedded run terminated");
            return stopped(reason, output);
        }
        EvalAltResult::ErrorRuntime(value, ..) => split_exception(&value.to_string()),
        EvalAltResult::ErrorArithmetic(ref detail, ..) => {
            if detail.to_lowercase().contains("division by zero") {
                ("ZeroDivisionError".to_string(), message)
            } else {
                ("ArithmeticError".to_string(), message)
            }
        }
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            ("NameError".to_string(), message)
        }
        EvalAltResult::ErrorPropertyNotFound(..) => ("AttributeError".to_string(), message),
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => {
            ("IndexError".to_string(), message)
        }
        EvalAltResult::ErrorIndexNotFound(..) => ("KeyError".to_string(), message),
        EvalAltResult::ErrorMismatchDataType(..)
        | EvalAltResult::ErrorMismatchOutputType(..)
        | EvalAltResult::ErrorIndexingType(..)
        | EvalAltResult::ErrorFor(..)
        | EvalAltResult::ErrorAssignmentToConstant(..) => ("TypeError".to_string(), message),
        EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..) => ("ResourceLimitError".to_string(), message),
        EvalAltResult::ErrorParsing(..) => ("SyntaxError".to_string(), message),
        _ => ("ScriptError".to_string(), message),
    };
    debug!(%exception, "embedded run faulted");
    SandboxRun::Faulted {
        exception,
        message,
        output,
    }
}

/// `"KeyError: column ..."` from host functions becomes `(KeyError, column ...)`.
fn split_exception(text: &str) -> (String, String) {
    match text.split_once(": ") {
        Some((name, rest))
            if name.ends_with("Error") && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (name.to_string(), rest.to_string())
        }
        _ => ("RuntimeError".to_string(), text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::cancel::CancelToken;

    const SALES: &str = "region,units,revenue\nwest,3,10.5\neast,5,\nwest,2,4.5\n";

    fn run_in(dir: &Path, code: &str, timeout: Duration) -> SandboxRun {
        let data_path = dir.join("sales.csv");
        fs::write(&data_path, SALES).expect("write csv");
        let request = SandboxRequest {
            code: code.to_string(),
            data_path,
            data_handle: "df".to_string(),
            output_limit_bytes: 1_000,
        };
        let scope = CancelScope::new(&CancelToken::new(), Some(timeout));
        EmbeddedSandbox::new()
            .execute(&request, &scope)
            .expect("execute")
    }

    fn run(code: &str) -> SandboxRun {
        let temp = tempfile::tempdir().expect("tempdir");
        run_in(temp.path(), code, Duration::from_secs(10))
    }

    fn completed(run: SandboxRun) -> (Bindings, CapturedOutput, usize) {
        match run {
            SandboxRun::Completed {
                bindings,
                output,
                charts,
            } => (bindings, output, charts.len()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn scalar_binding_is_collected() {
        let (bindings, _, _) = completed(run("result_value = 2 + 2"));
        assert_eq!(bindings.value, Some(RuntimeValue::Int { value: 4 }));
        assert_eq!(bindings.table, None);
    }

    #[test]
    fn table_binding_keeps_frame_shape() {
        let (bindings, _, _) = completed(run(r#"result_df = df.group_sum("region", "units");"#));
        let Some(RuntimeValue::Table { columns, rows }) = bindings.table else {
            panic!("expected table");
        };
        assert_eq!(columns, vec!["region", "units"]);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn unbound_results_are_reported_as_empty_bindings() {
        let (bindings, output, _) = completed(run(r#"print("rows: " + df.len());"#));
        assert_eq!(bindings, Bindings::default());
        assert_eq!(output.stdout, "rows: 3\n");
    }

    #[test]
    fn data_handle_is_read_only() {
        let SandboxRun::Faulted { exception, .. } = run("df = 1; result_value = 1;") else {
            panic!("expected fault");
        };
        assert_eq!(exception, "TypeError");
    }

    #[test]
    fn division_by_zero_is_a_fault() {
        let SandboxRun::Faulted { exception, .. } = run("let zero = 0; result_value = 1 / zero;")
        else {
            panic!("expected fault");
        };
        assert_eq!(exception, "ZeroDivisionError");
    }

    #[test]
    fn host_function_errors_keep_their_exception_name() {
        let SandboxRun::Faulted {
            exception, message, ..
        } = run(r#"result_value = df.sum("profit");"#)
        else {
            panic!("expected fault");
        };
        assert_eq!(exception, "KeyError");
        assert!(message.contains("profit"));
    }

    #[test]
    fn syntax_errors_are_faults_not_errors() {
        let SandboxRun::Faulted { exception, .. } = run("result_value = (1 + ;") else {
            panic!("expected fault");
        };
        assert_eq!(exception, "SyntaxError");
    }

    #[test]
    fn eval_and_import_are_unavailable() {
        for code in [r#"result_value = eval("1");"#, r#"import "os" as os; result_value = 1;"#] {
            assert!(
                matches!(run(code), SandboxRun::Faulted { .. }),
                "{code} should not run"
            );
        }
    }

    #[test]
    fn runaway_loop_is_terminated_at_the_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let run = run_in(
            temp.path(),
            "let x = 0; loop { x += 1; }",
            Duration::from_millis(300),
        );
        assert!(matches!(run, SandboxRun::TimedOut { .. }), "{run:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn output_is_bounded() {
        let (_, output, _) = completed(run(
            r#"for i in 0..1000 { print("0123456789"); } result_value = 1;"#,
        ));
        assert!(output.stdout.len() < 1_100);
        assert!(output.stdout.contains("stdout truncated"));
    }

    #[test]
    fn charts_are_collected_as_svg() {
        let (_, _, charts) = completed(run(
            r#"bar_chart("Units", ["west", "east"], [5, 5]); result_value = 1;"#,
        ));
        assert_eq!(charts, 1);
    }

    #[test]
    fn records_build_tables() {
        let (bindings, _, _) = completed(run(
            r#"result_df = table([#{ name: "a", n: 1 }, #{ name: "b" }]);"#,
        ));
        let Some(RuntimeValue::Table { rows, .. }) = bindings.table else {
            panic!("expected table");
        };
        assert_eq!(rows[1][0], RuntimeValue::Missing);
    }

    #[test]
    fn missing_data_file_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = SandboxRequest {
            code: "result_value = 1".to_string(),
            data_path: temp.path().join("absent.csv"),
            data_handle: "df".to_string(),
            output_limit_bytes: 1_000,
        };
        let run = EmbeddedSandbox::new()
            .execute(&request, &CancelScope::unbounded(&CancelToken::new()))
            .expect("execute");
        assert!(matches!(run, SandboxRun::MissingDataPath { .. }));
    }

    #[test]
    fn cancelled_scope_never_starts() {
        let token = CancelToken::new();
        token.cancel();
        let temp = tempfile::tempdir().expect("tempdir");
        let request = SandboxRequest {
            code: "result_value = 1".to_string(),
            data_path: temp.path().join("sales.csv"),
            data_handle: "df".to_string(),
            output_limit_bytes: 1_000,
        };
        let run = EmbeddedSandbox::new()
            .execute(&request, &CancelScope::unbounded(&token))
            .expect("execute");
        assert_eq!(run, SandboxRun::Cancelled);
    }

    #[test]
    fn exception_prefix_is_split_only_for_error_names() {
        assert_eq!(
            split_exception("KeyError: column `x` not found"),
            ("KeyError".to_string(), "column `x` not found".to_string())
        );
        assert_eq!(
            split_exception("bad input: no"),
            ("RuntimeError".to_string(), "bad input: no".to_string())
        );
    }
}
