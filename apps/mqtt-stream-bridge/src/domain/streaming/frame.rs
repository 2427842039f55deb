//! Columnar frames.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Name of the timestamp column present in every frame.
pub const TIME_COLUMN: &str = "Time";

/// Name of the single payload column used in raw mode.
pub const DATA_COLUMN: &str = "data";

/// Values of one column. Every variant holds one entry per frame row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    /// Arrival timestamps, never null.
    Time(Vec<DateTime<Utc>>),
    /// Text values.
    String(Vec<Option<String>>),
    /// Boolean values.
    Bool(Vec<Option<bool>>),
    /// Numeric values.
    Number(Vec<Option<f64>>),
    /// Opaque bytes: raw payloads or nested JSON.
    Opaque(Vec<Option<Vec<u8>>>),
}

impl ColumnValues {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Time(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Number(v) => v.len(),
            Self::Opaque(v) => v.len(),
        }
    }

    /// Whether the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short type tag used on the wire.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Time(_) => "time",
            Self::String(_) => "string",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Pad with nulls up to `len` rows. Time columns are never padded.
    pub(crate) fn extend_to(&mut self, len: usize) {
        match self {
            Self::Time(_) => {}
            Self::String(v) => v.resize(len.max(v.len()), None),
            Self::Bool(v) => v.resize(len.max(v.len()), None),
            Self::Number(v) => v.resize(len.max(v.len()), None),
            Self::Opaque(v) => v.resize(len.max(v.len()), None),
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name: `Time`, `data`, or a JSON key.
    pub name: String,
    /// Column values.
    pub values: ColumnValues,
}

impl Column {
    /// Create a column.
    #[must_use]
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Column {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Column", 3)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", self.values.type_name())?;
        match &self.values {
            ColumnValues::Time(v) => state.serialize_field("values", v)?,
            ColumnValues::String(v) => state.serialize_field("values", v)?,
            ColumnValues::Bool(v) => state.serialize_field("values", v)?,
            ColumnValues::Number(v) => state.serialize_field("values", v)?,
            ColumnValues::Opaque(v) => {
                let text: Vec<Option<String>> = v
                    .iter()
                    .map(|bytes| bytes.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect();
                state.serialize_field("values", &text)?;
            }
        }
        state.end()
    }
}

/// Frame metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameMeta {
    /// Channel address a client can open to stream this data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Data quality notices raised while building the frame.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<String>,
}

/// A columnar batch of rows. All columns share the same length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    /// Frame name.
    pub name: String,
    /// Columns in display order.
    pub columns: Vec<Column>,
    /// Metadata.
    pub meta: FrameMeta,
}

impl Frame {
    /// A frame with no columns.
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            meta: FrameMeta::default(),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    /// Look up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}
