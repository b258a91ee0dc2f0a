//! Conversion of sandbox-native values into transport-safe JSON.
//!
//! Sandboxes describe every bound value as a tagged [`RuntimeValue`]. The
//! normalizer is total over that set: each variant either maps onto plain
//! JSON (null, bool, integer, finite float, string, ordered list, ordered map)
//! or fails closed with `SerializationError`. Nothing is silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::core::outcome::{ErrorKind, Failure, Row};

/// Tagged description of a value produced inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeValue {
    Null,
    /// NaN, NA, NaT and similar missing-value markers.
    Missing,
    Bool {
        value: bool,
    },
    Int {
        value: i64,
    },
    /// Integer that does not fit in 64 bits, as decimal digits.
    BigInt {
        digits: String,
    },
    Float {
        value: f64,
    },
    /// Positive or negative infinity.
    NonFinite {
        repr: String,
    },
    Str {
        value: String,
    },
    /// ISO-8601 timestamp or date.
    Datetime {
        value: String,
    },
    List {
        items: Vec<RuntimeValue>,
    },
    Map {
        entries: Vec<(String, RuntimeValue)>,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<RuntimeValue>>,
    },
    Unsupported {
        type_name: String,
        #[serde(default)]
        repr: String,
    },
}

impl RuntimeValue {
    pub fn type_label(&self) -> &str {
        match self {
            RuntimeValue::Null => "null",
            RuntimeValue::Missing => "missing",
            RuntimeValue::Bool { .. } => "bool",
            RuntimeValue::Int { .. } => "int",
            RuntimeValue::BigInt { .. } => "big_int",
            RuntimeValue::Float { .. } => "float",
            RuntimeValue::NonFinite { .. } => "non_finite",
            RuntimeValue::Str { .. } => "str",
            RuntimeValue::Datetime { .. } => "datetime",
            RuntimeValue::List { .. } => "list",
            RuntimeValue::Map { .. } => "map",
            RuntimeValue::Table { .. } => "table",
            RuntimeValue::Unsupported { type_name, .. } => type_name,
        }
    }
}

/// Normalize any bound value (used for `result_value`).
pub fn normalize_value(value: &RuntimeValue, binding: &str) -> Result<Value, Failure> {
    to_json(value, binding)
}

/// Normalize a tabular binding (used for `result_df`) into ordered row maps.
///
/// Accepts a table or a list of record maps; anything else is a
/// `SerializationError`.
pub fn normalize_table(value: &RuntimeValue, binding: &str) -> Result<Vec<Row>, Failure> {
    match value {
        RuntimeValue::Table { columns, rows } => table_rows(columns, rows, binding),
        RuntimeValue::List { items } => items
            .iter()
            .enumerate()
            .map(|(index, item)| match item {
                RuntimeValue::Map { entries } => {
                    map_entries(entries, &format!("{binding}[{index}]"))
                }
                other => Err(serialization_error(format!(
                    "{binding}[{index}] is a `{}`, expected a record",
                    other.type_label()
                ))),
            })
            .collect(),
        other => Err(serialization_error(format!(
            "{binding} must be tabular, got `{}`",
            other.type_label()
        ))),
    }
}

fn to_json(value: &RuntimeValue, path: &str) -> Result<Value, Failure> {
    match value {
        RuntimeValue::Null | RuntimeValue::Missing => Ok(Value::Null),
        RuntimeValue::Bool { value } => Ok(Value::Bool(*value)),
        RuntimeValue::Int { value } => Ok(Value::from(*value)),
        RuntimeValue::Float { value } => Number::from_f64(*value)
            .map(Value::Number)
            .ok_or_else(|| serialization_error(format!("{path} is a non-finite float"))),
        RuntimeValue::BigInt { digits } => Err(serialization_error(format!(
            "{path} is an integer outside the 64-bit range ({digits})"
        ))),
        RuntimeValue::NonFinite { repr } => Err(serialization_error(format!(
            "{path} is a non-finite float ({repr})"
        ))),
        RuntimeValue::Str { value } | RuntimeValue::Datetime { value } => {
            Ok(Value::String(value.clone()))
        }
        RuntimeValue::List { items } => items
            .iter()
            .enumerate()
            .map(|(index, item)| to_json(item, &format!("{path}[{index}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        RuntimeValue::Map { entries } => map_entries(entries, path).map(Value::Object),
        RuntimeValue::Table { columns, rows } => table_rows(columns, rows, path)
            .map(|rows| Value::Array(rows.into_iter().map(Value::Object).collect())),
        RuntimeValue::Unsupported { type_name, repr } => Err(serialization_error(format!(
            "{path} has unsupported type `{type_name}` ({})",
            truncate(repr, 80)
        ))),
    }
}

fn map_entries(
    entries: &[(String, RuntimeValue)],
    path: &str,
) -> Result<Map<String, Value>, Failure> {
    let mut map = Map::with_capacity(entries.len());
    for (key, value) in entries {
        if map.contains_key(key) {
            return Err(serialization_error(format!("{path} has duplicate key `{key}`")));
        }
        let normalized = to_json(value, &format!("{path}.{key}"))?;
        map.insert(key.clone(), normalized);
    }
    Ok(map)
}

fn table_rows(
    columns: &[String],
    rows: &[Vec<RuntimeValue>],
    path: &str,
) -> Result<Vec<Row>, Failure> {
    rows.iter()
        .enumerate()
        .map(|(index, cells)| {
            if cells.len() != columns.len() {
                return Err(serialization_error(format!(
                    "{path} row {index} has {} cells, expected {}",
                    cells.len(),
                    columns.len()
                )));
            }
            let mut row = Row::with_capacity(columns.len());
            for (column, cell) in columns.iter().zip(cells) {
                if row.contains_key(column) {
                    return Err(serialization_error(format!(
                        "{path} has duplicate column `{column}`"
                    )));
                }
                let normalized = to_json(cell, &format!("{path}[{index}].{column}"))?;
                row.insert(column.clone(), normalized);
            }
            Ok(row)
        })
        .collect()
}

fn serialization_error(message: String) -> Failure {
    Failure::new(ErrorKind::SerializationError, message)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn float(value: f64) -> RuntimeValue {
        RuntimeValue::Float { value }
    }

    #[test]
    fn missing_values_become_null_in_arrays() {
        let array = RuntimeValue::List {
            items: vec![float(1.5), RuntimeValue::Missing, RuntimeValue::Int { value: 3 }],
        };
        let normalized = normalize_value(&array, "result_value").expect("normalize");
        assert_eq!(normalized, json!([1.5, null, 3]));
        assert_eq!(serde_json::to_string(&normalized).expect("ser"), "[1.5,null,3]");
    }

    #[test]
    fn tagged_values_parse_from_sandbox_json() {
        let raw = r#"{"type":"list","items":[{"type":"float","value":2.0},{"type":"missing"}]}"#;
        let parsed: RuntimeValue = serde_json::from_str(raw).expect("parse");
        assert_eq!(
            normalize_value(&parsed, "result_value").expect("normalize"),
            json!([2.0, null])
        );
    }

    #[test]
    fn table_keeps_column_order() {
        let table = RuntimeValue::Table {
            columns: vec!["region".to_string(), "revenue".to_string(), "as_of".to_string()],
            rows: vec![vec![
                RuntimeValue::Str { value: "west".to_string() },
                RuntimeValue::Missing,
                RuntimeValue::Datetime { value: "2024-01-31T00:00:00".to_string() },
            ]],
        };
        let rows = normalize_table(&table, "result_df").expect("normalize");
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["region", "revenue", "as_of"]);
        assert_eq!(rows[0]["revenue"], Value::Null);
    }

    #[test]
    fn list_of_records_is_tabular() {
        let records = RuntimeValue::List {
            items: vec![RuntimeValue::Map {
                entries: vec![("n".to_string(), RuntimeValue::Int { value: 1 })],
            }],
        };
        let rows = normalize_table(&records, "result_df").expect("normalize");
        assert_eq!(Value::Object(rows[0].clone()), json!({"n": 1}));
    }

    #[test]
    fn scalar_is_not_tabular() {
        let err =
            normalize_table(&RuntimeValue::Int { value: 1 }, "result_df").expect_err("scalar");
        assert_eq!(err.kind, ErrorKind::SerializationError);
    }

    #[test]
    fn unsupported_nested_value_fails_closed_with_path() {
        let value = RuntimeValue::Map {
            entries: vec![(
                "items".to_string(),
                RuntimeValue::List {
                    items: vec![RuntimeValue::Unsupported {
                        type_name: "set".to_string(),
                        repr: "{1, 2}".to_string(),
                    }],
                },
            )],
        };
        let err = normalize_value(&value, "result_value").expect_err("unsupported");
        assert_eq!(err.kind, ErrorKind::SerializationError);
        assert!(err.message.contains("result_value.items[0]"));
        assert!(err.message.contains("`set`"));
    }

    #[test]
    fn infinity_and_big_integers_fail_closed() {
        for value in [
            RuntimeValue::NonFinite { repr: "inf".to_string() },
            RuntimeValue::BigInt { digits: "123456789012345678901234567890".to_string() },
            float(f64::INFINITY),
        ] {
            let err = normalize_value(&value, "result_value").expect_err("fail closed");
            assert_eq!(err.kind, ErrorKind::SerializationError);
        }
    }

    #[test]
    fn ragged_table_is_rejected() {
        let table = RuntimeValue::Table {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![RuntimeValue::Null]],
        };
        let err = normalize_table(&table, "result_df").expect_err("ragged");
        assert!(err.message.contains("row 0 has 1 cells, expected 2"));
    }
}
