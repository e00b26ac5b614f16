use serde::Serialize;
use serde_json::Value;

use super::value::{CellValue, RawResultSet};

/// Preview-ready result: column names, display rows and counts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_row_count: usize,
    pub displayed_row_count: usize,
}

/// Truncate `raw` to `display_limit` rows and clean every value for JSON.
///
/// `total_row_count` always reflects the full result. `None` disables the cap.
pub fn normalize(raw: RawResultSet, display_limit: Option<usize>) -> NormalizedResult {
    let total_row_count = raw.rows.len();
    let limit = display_limit.unwrap_or(total_row_count);

    let rows: Vec<Vec<Value>> = raw
        .rows
        .into_iter()
        .take(limit)
        .map(|row| row.into_iter().map(to_json).collect())
        .collect();

    NormalizedResult {
        columns: raw.columns,
        displayed_row_count: rows.len(),
        rows,
        total_row_count,
    }
}

/// Convert one cell to JSON. Non-finite floats become null.
pub fn to_json(cell: CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(b),
        CellValue::Int(i) => Value::from(i),
        CellValue::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CellValue::Text(s) => Value::String(s),
        CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        CellValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        CellValue::DateTimeTz(dt) => Value::String(dt.to_rfc3339()),
    }
}

/// Clean a cell for spreadsheet output.
///
/// Non-finite floats become `Null`, and timezone-aware timestamps lose their
/// offset (keeping the wall-clock time they were stored with).
pub fn clean_for_export(cell: CellValue) -> CellValue {
    match cell {
        CellValue::Float(f) if !f.is_finite() => CellValue::Null,
        CellValue::DateTimeTz(dt) => CellValue::DateTime(dt.naive_local()),
        other => other,
    }
}
