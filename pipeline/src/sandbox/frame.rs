//! Read-only tabular data handle for the embedded backend.
//!
//! A [`DataFrame`] is immutable and cheap to clone: columns and rows sit
//! behind `Rc`, and every transforming method returns a new frame. CSV parsing
//! follows the usual spreadsheet conventions (header row, quoted fields with
//! `""` escapes, blank lines skipped) and infers one type per column.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::core::normalize::RuntimeValue;

/// Strings read as missing values.
const MISSING_MARKERS: &[&str] = &[
    "", "NA", "N/A", "n/a", "#N/A", "NaN", "nan", "-NaN", "-nan", "null", "NULL", "None", "<NA>",
];

/// Error raised by frame operations, named like the exception a script sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub exception: &'static str,
    pub message: String,
}

impl FrameError {
    fn new(exception: &'static str, message: impl Into<String>) -> Self {
        Self {
            exception,
            message: message.into(),
        }
    }

    fn key(column: &str) -> Self {
        Self::new("KeyError", format!("column `{column}` not found"))
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception, self.message)
    }
}

impl std::error::Error for FrameError {}

pub type FrameResult<T> = Result<T, FrameError>;

/// One table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(value) => Some(*value as f64),
            Cell::Float(value) => Some(*value),
            Cell::Bool(value) => Some(f64::from(u8::from(*value))),
            Cell::Missing | Cell::Text(_) => None,
        }
    }

    /// Equality used for filtering: numbers compare by value across int/float.
    pub fn matches(&self, other: &Cell) -> bool {
        match (self, other) {
            (Cell::Int(_) | Cell::Float(_), Cell::Int(_) | Cell::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            _ => self == other,
        }
    }

    pub fn to_runtime(&self) -> RuntimeValue {
        match self {
            Cell::Missing => RuntimeValue::Missing,
            Cell::Bool(value) => RuntimeValue::Bool { value: *value },
            Cell::Int(value) => RuntimeValue::Int { value: *value },
            Cell::Float(value) if value.is_finite() => RuntimeValue::Float { value: *value },
            Cell::Float(value) => RuntimeValue::NonFinite {
                repr: value.to_string(),
            },
            Cell::Text(value) => RuntimeValue::Str {
                value: value.clone(),
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Cell::Bool(_) => 0,
            Cell::Int(_) | Cell::Float(_) => 1,
            Cell::Text(_) => 2,
            Cell::Missing => 3,
        }
    }
}

/// Total order with missing values last.
pub fn compare_cells(a: &Cell, b: &Cell) -> Ordering {
    match (a, b) {
        (Cell::Bool(x), Cell::Bool(y)) => x.cmp(y),
        (Cell::Text(x), Cell::Text(y)) => x.cmp(y),
        (Cell::Int(x), Cell::Int(y)) => x.cmp(y),
        (Cell::Int(_) | Cell::Float(_), Cell::Int(_) | Cell::Float(_)) => {
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        _ => a.rank().cmp(&b.rank()),
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Missing => f.write_str("NaN"),
            Cell::Bool(value) => write!(f, "{value}"),
            Cell::Int(value) => write!(f, "{value}"),
            Cell::Float(value) => write!(f, "{value}"),
            Cell::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    columns: Rc<Vec<String>>,
    rows: Rc<Vec<Vec<Cell>>>,
}

impl DataFrame {
    /// Build a frame, rejecting duplicate columns and ragged rows.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> FrameResult<Self> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = columns.iter().find(|column| !seen.insert(column.as_str())) {
            return Err(FrameError::new(
                "ValueError",
                format!("duplicate column `{duplicate}`"),
            ));
        }
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(FrameError::new(
                "ValueError",
                format!(
                    "row {index} has {} cells, expected {}",
                    row.len(),
                    columns.len()
                ),
            ));
        }
        Ok(Self {
            columns: Rc::new(columns),
            rows: Rc::new(rows),
        })
    }

    pub fn from_csv(text: &str) -> FrameResult<Self> {
        let mut records = parse_records(text.trim_start_matches('\u{feff}'))?.into_iter();
        let Some(header) = records.next() else {
            return Err(FrameError::new("EmptyDataError", "no columns to parse from file"));
        };
        let columns = header_names(header);

        let mut raw_rows = Vec::new();
        for (index, mut record) in records.enumerate() {
            if record.len() > columns.len() {
                return Err(FrameError::new(
                    "ParserError",
                    format!(
                        "expected {} fields in line {}, saw {}",
                        columns.len(),
                        index + 2,
                        record.len()
                    ),
                ));
            }
            record.resize(columns.len(), String::new());
            raw_rows.push(record);
        }

        let kinds: Vec<ColumnKind> = (0..columns.len())
            .map(|col| ColumnKind::infer(raw_rows.iter().map(|row| row[col].as_str())))
            .collect();
        let rows = raw_rows
            .into_iter()
            .map(|row| {
                row.iter()
                    .zip(&kinds)
                    .map(|(raw, kind)| kind.parse(raw))
                    .collect()
            })
            .collect();
        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    fn index_of(&self, column: &str) -> FrameResult<usize> {
        self.columns
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| FrameError::key(column))
    }

    fn with_rows(&self, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            columns: Rc::clone(&self.columns),
            rows: Rc::new(rows),
        }
    }

    pub fn column(&self, column: &str) -> FrameResult<Vec<Cell>> {
        let index = self.index_of(column)?;
        Ok(self.rows.iter().map(|row| row[index].clone()).collect())
    }

    /// Row `index` as `(column, cell)` pairs in column order.
    pub fn row(&self, index: i64) -> FrameResult<Vec<(String, Cell)>> {
        let row = usize::try_from(index)
            .ok()
            .and_then(|index| self.rows.get(index))
            .ok_or_else(|| {
                FrameError::new(
                    "IndexError",
                    format!("row {index} out of range for {} rows", self.rows.len()),
                )
            })?;
        Ok(self.columns.iter().cloned().zip(row.iter().cloned()).collect())
    }

    pub fn head(&self, n: i64) -> Self {
        let n = usize::try_from(n).unwrap_or(0).min(self.rows.len());
        self.with_rows(self.rows[..n].to_vec())
    }

    pub fn select(&self, names: &[String]) -> FrameResult<Self> {
        let indices = names
            .iter()
            .map(|name| self.index_of(name))
            .collect::<FrameResult<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&index| row[index].clone()).collect())
            .collect();
        Self::new(names.to_vec(), rows)
    }

    pub fn filter_eq(&self, column: &str, value: &Cell) -> FrameResult<Self> {
        let index = self.index_of(column)?;
        let rows = self
            .rows
            .iter()
            .filter(|row| row[index].matches(value))
            .cloned()
            .collect();
        Ok(self.with_rows(rows))
    }

    fn numeric(&self, column: &str, op: &str) -> FrameResult<Vec<Cell>> {
        let cells = self.column(column)?;
        if let Some(text) = cells.iter().find(|cell| matches!(cell, Cell::Text(_))) {
            return Err(FrameError::new(
                "TypeError",
                format!("cannot {op} non-numeric column `{column}` (found {text:?})"),
            ));
        }
        Ok(cells.into_iter().filter(|cell| !cell.is_missing()).collect())
    }

    /// Sum of non-missing values; integer unless a float is present.
    pub fn sum(&self, column: &str) -> FrameResult<Cell> {
        let cells = self.numeric(column, "sum")?;
        if cells.iter().any(|cell| matches!(cell, Cell::Float(_))) {
            return Ok(Cell::Float(cells.iter().filter_map(Cell::as_f64).sum()));
        }
        let mut total: i64 = 0;
        for cell in &cells {
            let value = match cell {
                Cell::Int(value) => *value,
                Cell::Bool(value) => i64::from(*value),
                _ => 0,
            };
            total = total.checked_add(value).ok_or_else(|| {
                FrameError::new("OverflowError", format!("sum of `{column}` overflows"))
            })?;
        }
        Ok(Cell::Int(total))
    }

    pub fn mean(&self, column: &str) -> FrameResult<Cell> {
        let values: Vec<f64> = self
            .numeric(column, "average")?
            .iter()
            .filter_map(Cell::as_f64)
            .collect();
        if values.is_empty() {
            return Ok(Cell::Missing);
        }
        Ok(Cell::Float(values.iter().sum::<f64>() / values.len() as f64))
    }

    pub fn min(&self, column: &str) -> FrameResult<Cell> {
        self.extreme(column, Ordering::Less)
    }

    pub fn max(&self, column: &str) -> FrameResult<Cell> {
        self.extreme(column, Ordering::Greater)
    }

    fn extreme(&self, column: &str, wanted: Ordering) -> FrameResult<Cell> {
        Ok(self
            .column(column)?
            .into_iter()
            .filter(|cell| !cell.is_missing())
            .reduce(|best, cell| {
                if compare_cells(&cell, &best) == wanted {
                    cell
                } else {
                    best
                }
            })
            .unwrap_or(Cell::Missing))
    }

    /// Number of non-missing values.
    pub fn count(&self, column: &str) -> FrameResult<i64> {
        let count = self
            .column(column)?
            .iter()
            .filter(|cell| !cell.is_missing())
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    /// Distinct values in order of first appearance.
    pub fn unique(&self, column: &str) -> FrameResult<Vec<Cell>> {
        let mut distinct: Vec<Cell> = Vec::new();
        for cell in self.column(column)? {
            if !distinct.iter().any(|seen| seen == &cell) {
                distinct.push(cell);
            }
        }
        Ok(distinct)
    }

    /// Sum `value` per distinct `key`, keys sorted, missing keys dropped.
    pub fn group_sum(&self, key: &str, value: &str) -> FrameResult<Self> {
        let key_index = self.index_of(key)?;
        let value_index = self.index_of(value)?;
        let mut groups: Vec<(Cell, Vec<Vec<Cell>>)> = Vec::new();
        for row in self.rows.iter().filter(|row| !row[key_index].is_missing()) {
            match groups.iter_mut().find(|(group, _)| *group == row[key_index]) {
                Some((_, rows)) => rows.push(row.clone()),
                None => groups.push((row[key_index].clone(), vec![row.clone()])),
            }
        }
        groups.sort_by(|(a, _), (b, _)| compare_cells(a, b));

        let mut rows = Vec::with_capacity(groups.len());
        for (group, members) in groups {
            let total = self.with_rows(members).sum(value)?;
            rows.push(vec![group, total]);
        }
        let value_column = self.columns[value_index].clone();
        Self::new(vec![key.to_string(), value_column], rows)
    }

    /// Stable sort on one column; missing values always last.
    pub fn sort_by(&self, column: &str, ascending: bool) -> FrameResult<Self> {
        let index = self.index_of(column)?;
        let mut rows = self.rows.to_vec();
        rows.sort_by(|a, b| {
            let (a, b) = (&a[index], &b[index]);
            match (a.is_missing(), b.is_missing()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) if ascending => compare_cells(a, b),
                (false, false) => compare_cells(b, a),
            }
        });
        Ok(self.with_rows(rows))
    }

    pub fn to_runtime(&self) -> RuntimeValue {
        RuntimeValue::Table {
            columns: self.columns.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| row.iter().map(Cell::to_runtime).collect())
                .collect(),
        }
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW_ROWS: usize = 10;
        writeln!(f, "{}", self.columns.join("\t"))?;
        for row in self.rows.iter().take(PREVIEW_ROWS) {
            let cells: Vec<String> = row.iter().map(Cell::to_string).collect();
            writeln!(f, "{}", cells.join("\t"))?;
        }
        if self.rows.len() > PREVIEW_ROWS {
            writeln!(f, "... ({} rows)", self.rows.len())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

impl ColumnKind {
    fn of(raw: &str) -> Self {
        if parse_bool(raw).is_some() {
            ColumnKind::Bool
        } else if raw.parse::<i64>().is_ok() {
            ColumnKind::Int
        } else if raw.parse::<f64>().is_ok() {
            ColumnKind::Float
        } else {
            ColumnKind::Text
        }
    }

    fn infer<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        let mut kind: Option<ColumnKind> = None;
        for raw in values.filter(|raw| !is_missing(raw)) {
            let next = ColumnKind::of(raw.trim());
            kind = Some(match (kind, next) {
                (None, next) => next,
                (Some(current), next) if current == next => current,
                (
                    Some(ColumnKind::Int | ColumnKind::Float),
                    ColumnKind::Int | ColumnKind::Float,
                ) => ColumnKind::Float,
                _ => return ColumnKind::Text,
            });
        }
        // An all-missing column reads as floats full of NaN.
        kind.unwrap_or(ColumnKind::Float)
    }

    fn parse(self, raw: &str) -> Cell {
        if is_missing(raw) {
            return Cell::Missing;
        }
        let trimmed = raw.trim();
        let parsed = match self {
            ColumnKind::Bool => parse_bool(trimmed).map(Cell::Bool),
            ColumnKind::Int => trimmed.parse().ok().map(Cell::Int),
            ColumnKind::Float => trimmed.parse().ok().map(Cell::Float),
            ColumnKind::Text => None,
        };
        parsed.unwrap_or_else(|| Cell::Text(raw.to_string()))
    }
}

fn is_missing(raw: &str) -> bool {
    MISSING_MARKERS.contains(&raw.trim())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Blank names become `Unnamed: i`; repeats get `.1`, `.2` suffixes.
fn header_names(header: Vec<String>) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(header.len());
    for (index, raw) in header.into_iter().enumerate() {
        let base = if raw.trim().is_empty() {
            format!("Unnamed: {index}")
        } else {
            raw
        };
        let mut name = base.clone();
        let mut suffix = 1;
        while names.contains(&name) {
            name = format!("{base}.{suffix}");
            suffix += 1;
        }
        names.push(name);
    }
    names
}

fn parse_records(text: &str) -> FrameResult<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                }
                record.clear();
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(FrameError::new("ParserError", "unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}
