//! Row-and-column value tables exchanged between cells.
//!
//! A [`Frame`] is the interchange shape for everything tabular: session-DB
//! query results, data-cell outputs, and pipeline stages. Values are plain
//! JSON so frames round-trip through interpreters and the session DB without
//! a schema layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames at or under this many cells serialize inline; larger frames go to
/// a file under the session artifacts directory.
pub const INLINE_CELL_LIMIT: usize = 2_000;

/// A column-named table of JSON values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Frame {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Total cell count, used to decide inline vs file serialization.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.rows.len() * self.columns.len()
    }

    /// Column index by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at `(row, column_name)`.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Render as a list of `{column: value}` records.
    #[must_use]
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (col, val) in self.columns.iter().zip(row.iter()) {
                    obj.insert(col.clone(), val.clone());
                }
                Value::Object(obj)
            })
            .collect()
    }

    /// Build a frame from a list of `{column: value}` records.
    ///
    /// Column order follows first appearance; rows missing a column get
    /// `null`. Non-object entries produce a single-column `value` frame.
    #[must_use]
    pub fn from_records(records: &[Value]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            if let Value::Object(map) = record {
                for key in map.keys() {
                    if !columns.iter().any(|c| c == key) {
                        columns.push(key.clone());
                    }
                }
            }
        }
        if columns.is_empty() && !records.is_empty() {
            columns.push("value".to_string());
        }
        let rows = records
            .iter()
            .map(|record| match record {
                Value::Object(map) => columns
                    .iter()
                    .map(|c| map.get(c).cloned().unwrap_or(Value::Null))
                    .collect(),
                other => vec![other.clone()],
            })
            .collect();
        Self { columns, rows }
    }

    /// Coerce a cell result value into a frame.
    ///
    /// Accepts a list of records, a single record, a frame-shaped object
    /// (`{columns, rows}`), or a scalar (one `value` cell).
    #[must_use]
    pub fn coerce(value: &Value) -> Self {
        if let Ok(frame) = serde_json::from_value::<Frame>(value.clone()) {
            if !frame.columns.is_empty() {
                return frame;
            }
        }
        match value {
            Value::Array(items) => Self::from_records(items),
            Value::Object(_) => Self::from_records(std::slice::from_ref(value)),
            other => Self {
                columns: vec!["value".to_string()],
                rows: vec![vec![other.clone()]],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_round_trip() {
        let frame = Frame::from_records(&[
            json!({"id": 1, "name": "a"}),
            json!({"id": 2, "name": "b", "extra": true}),
        ]);
        assert_eq!(frame.columns, vec!["id", "name", "extra"]);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.value(0, "extra"), Some(&Value::Null));

        let records = frame.to_records();
        assert_eq!(records[1]["extra"], json!(true));
    }

    #[test]
    fn coerce_scalar() {
        let frame = Frame::coerce(&json!(42));
        assert_eq!(frame.columns, vec!["value"]);
        assert_eq!(frame.rows, vec![vec![json!(42)]]);
    }

    #[test]
    fn coerce_frame_shape() {
        let frame = Frame::coerce(&json!({"columns": ["x"], "rows": [[1], [2]]}));
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.value(1, "x"), Some(&json!(2)));
    }
}
