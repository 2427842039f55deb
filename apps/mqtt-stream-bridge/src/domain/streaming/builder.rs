//! Frame Builder
//!
//! Turns a batch of [`TimedMessage`]s into one columnar [`Frame`].
//!
//! Every message adds one row and one `Time` value. In structured mode a
//! JSON object payload contributes one column per top-level key; the
//! column's type is fixed by the first non-null value seen for that key.
//! Anything else lands in a single opaque `data` column. Both kinds of
//! message may share a batch.
//!
//! Columns are written extend-then-set: before a value is stored the column
//! is padded with nulls up to the current row, and every column is padded
//! to the full row count when the frame is finished.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::TimedMessage;
use super::frame::{Column, ColumnValues, DATA_COLUMN, Frame, FrameMeta, TIME_COLUMN};

/// Default frame name.
const FRAME_NAME: &str = "data";

/// Builds one frame per batch. Owned by a single session and reused.
#[derive(Debug)]
pub struct FrameBuilder {
    include_schema: bool,
    times: Vec<DateTime<Utc>>,
    columns: Vec<Column>,
    positions: HashMap<String, usize>,
    notices: Vec<String>,
    time_key_dropped: bool,
}

impl FrameBuilder {
    /// Create a builder. With `include_schema` false every payload is raw.
    #[must_use]
    pub fn new(include_schema: bool) -> Self {
        Self {
            include_schema,
            times: Vec::new(),
            columns: Vec::new(),
            positions: HashMap::new(),
            notices: Vec::new(),
            time_key_dropped: false,
        }
    }

    /// Build a frame from a batch and reset for the next one.
    pub fn build(&mut self, batch: &[TimedMessage]) -> Frame {
        for message in batch {
            self.push(message);
        }
        self.finish()
    }

    /// Append one message as a new row.
    pub fn push(&mut self, message: &TimedMessage) {
        let row = self.times.len();
        self.times.push(message.acquired_at);

        if self.include_schema {
            if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(&message.payload) {
                for (key, value) in fields {
                    self.set_field(row, key, value);
                }
                return;
            }
            tracing::debug!(topic = %message.topic, "payload is not a JSON object, using raw column");
        }

        self.set_raw(row, message.payload.to_vec());
    }

    /// Produce the frame for everything pushed so far and reset.
    pub fn finish(&mut self) -> Frame {
        let rows = self.times.len();
        self.positions.clear();
        self.time_key_dropped = false;

        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Column::new(
            TIME_COLUMN,
            ColumnValues::Time(std::mem::take(&mut self.times)),
        ));
        for mut column in self.columns.drain(..) {
            column.values.extend_to(rows);
            columns.push(column);
        }

        Frame {
            name: FRAME_NAME.to_string(),
            columns,
            meta: FrameMeta {
                channel: None,
                notices: std::mem::take(&mut self.notices),
            },
        }
    }

    fn set_field(&mut self, row: usize, key: String, value: Value) {
        // The acquisition time owns the `Time` column.
        if key == TIME_COLUMN {
            if !self.time_key_dropped {
                self.time_key_dropped = true;
                tracing::warn!(row, "payload key \"Time\" collides with the time column, dropped");
                self.notices.push(format!(
                    "payload key \"Time\" at row {row} collides with the time column, dropped"
                ));
            }
            return;
        }

        if let Some(&position) = self.positions.get(&key) {
            let column = &mut self.columns[position];
            column.values.extend_to(row + 1);
            if !store(&mut column.values, row, value) {
                let notice = format!(
                    "value for {key:?} at row {row} does not match column type {}, stored as null",
                    column.values.type_name()
                );
                tracing::warn!(key = %key, row, expected = column.values.type_name(), "column type changed mid-stream");
                self.notices.push(notice);
            }
            return;
        }

        // A key whose first value is null has no type yet.
        let Some(mut values) = empty_values_for(&value) else {
            return;
        };
        values.extend_to(row + 1);
        store(&mut values, row, value);

        self.positions.insert(key.clone(), self.columns.len());
        self.columns.push(Column::new(key, values));
    }

    fn set_raw(&mut self, row: usize, payload: Vec<u8>) {
        let position = if let Some(&position) = self.positions.get(DATA_COLUMN) {
            position
        } else {
            self.positions.insert(DATA_COLUMN.to_string(), self.columns.len());
            self.columns
                .push(Column::new(DATA_COLUMN, ColumnValues::Opaque(Vec::new())));
            self.columns.len() - 1
        };

        let values = &mut self.columns[position].values;
        values.extend_to(row + 1);
        if !store_raw(values, row, payload) {
            // A JSON key named "data" already claimed the column with another type.
            tracing::warn!(row, "raw payload collides with a typed \"data\" column, stored as null");
            self.notices.push(format!(
                "raw payload at row {row} collides with a typed \"data\" column, stored as null"
            ));
        }
    }
}

/// An empty column typed after `value`, or `None` for null.
fn empty_values_for(value: &Value) -> Option<ColumnValues> {
    match value {
        Value::Null => None,
        Value::String(_) => Some(ColumnValues::String(Vec::new())),
        Value::Bool(_) => Some(ColumnValues::Bool(Vec::new())),
        Value::Number(_) => Some(ColumnValues::Number(Vec::new())),
        Value::Array(_) | Value::Object(_) => Some(ColumnValues::Opaque(Vec::new())),
    }
}

/// Store `value` at `row`. Returns false on a type mismatch.
///
/// Null always succeeds and leaves the padding in place.
fn store(values: &mut ColumnValues, row: usize, value: Value) -> bool {
    match (values, value) {
        (_, Value::Null) => true,
        (ColumnValues::String(v), Value::String(s)) => {
            v[row] = Some(s);
            true
        }
        (ColumnValues::Bool(v), Value::Bool(b)) => {
            v[row] = Some(b);
            true
        }
        (ColumnValues::Number(v), Value::Number(n)) => {
            v[row] = n.as_f64();
            true
        }
        (ColumnValues::Opaque(v), nested @ (Value::Array(_) | Value::Object(_))) => {
            v[row] = Some(nested.to_string().into_bytes());
            true
        }
        _ => false,
    }
}

fn store_raw(values: &mut ColumnValues, row: usize, payload: Vec<u8>) -> bool {
    if let ColumnValues::Opaque(v) = values {
        v[row] = Some(payload);
        true
    } else {
        false
    }
}
