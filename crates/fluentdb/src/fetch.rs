//! Output shapes for row-returning calls.

use crate::row::{Record, Row};
use serde::Serialize;

/// Serialization options for [`FetchMode::Json`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonOptions {
    pub pretty: bool,
}

impl JsonOptions {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

/// How rows are handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Plain column → value rows.
    #[default]
    Rows,
    /// Owned field-name → value records.
    Records,
    /// One JSON string holding every row.
    Json(JsonOptions),
}

/// Result of a multi-row call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Rows(Vec<Row>),
    Records(Vec<Record>),
    Json(String),
}

impl Fetched {
    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Fetched::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Fetched::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<String> {
        match self {
            Fetched::Json(json) => Some(json),
            _ => None,
        }
    }

    /// Row count for the row and record shapes; `None` for JSON.
    pub fn len(&self) -> Option<usize> {
        match self {
            Fetched::Rows(rows) => Some(rows.len()),
            Fetched::Records(records) => Some(records.len()),
            Fetched::Json(_) => None,
        }
    }
}

/// Result of a single-row call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedRow {
    Row(Row),
    Record(Record),
    Json(String),
}

impl FetchedRow {
    pub fn into_row(self) -> Option<Row> {
        match self {
            FetchedRow::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            FetchedRow::Record(record) => Some(record),
            FetchedRow::Row(row) => Some(row.into_record()),
            FetchedRow::Json(_) => None,
        }
    }

    pub fn into_json(self) -> Option<String> {
        match self {
            FetchedRow::Json(json) => Some(json),
            _ => None,
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T, options: JsonOptions) -> String {
    // Rows serialize as string-keyed maps of scalars, which serde_json always accepts.
    let encoded = if options.pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    encoded.unwrap_or_default()
}

impl FetchMode {
    pub(crate) fn shape(self, rows: Vec<Row>) -> Fetched {
        match self {
            FetchMode::Rows => Fetched::Rows(rows),
            FetchMode::Records => Fetched::Records(rows.into_iter().map(Row::into_record).collect()),
            FetchMode::Json(options) => Fetched::Json(to_json(&rows, options)),
        }
    }

    pub(crate) fn shape_one(self, row: Row) -> FetchedRow {
        match self {
            FetchMode::Rows => FetchedRow::Row(row),
            FetchMode::Records => FetchedRow::Record(row.into_record()),
            FetchMode::Json(options) => FetchedRow::Json(to_json(&row, options)),
        }
    }
}
