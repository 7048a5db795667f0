//! CSV dataset loader
//!
//! Reads the whole file eagerly, then decides one type per column: a column is only
//! numeric if every non-missing cell in it is numeric. Integer cells in a column that also
//! holds decimals are widened to floats.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use super::{Dataset, Record, Row, Value};
use crate::error::BridgeError;

/// Cell contents treated as a missing value
const MISSING_MARKERS: &[&str] = &[
    "", "NaN", "nan", "-NaN", "-nan", "NA", "N/A", "n/a", "#N/A", "null", "NULL", "None",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Empty,
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnKind {
    fn classify(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.parse::<i64>().is_ok() {
            ColumnKind::Integer
        } else if cell.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
            ColumnKind::Float
        } else if parse_bool(cell).is_some() {
            ColumnKind::Boolean
        } else {
            ColumnKind::Text
        }
    }

    fn widen(self, other: ColumnKind) -> Self {
        use ColumnKind::*;
        match (self, other) {
            (Empty, k) | (k, Empty) => k,
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => Text,
        }
    }

    fn convert(self, cell: &str) -> Value {
        if is_missing(cell) {
            return Value::Null;
        }
        let trimmed = cell.trim();
        match self {
            ColumnKind::Empty => Value::Null,
            ColumnKind::Integer => trimmed.parse().map(Value::Int).unwrap_or(Value::Null),
            ColumnKind::Float => trimmed.parse().map(Value::Float).unwrap_or(Value::Null),
            ColumnKind::Boolean => parse_bool(trimmed).map(Value::Bool).unwrap_or(Value::Null),
            ColumnKind::Text => Value::Text(cell.to_string()),
        }
    }
}

fn is_missing(cell: &str) -> bool {
    MISSING_MARKERS.contains(&cell.trim())
}

fn parse_bool(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        Some(true)
    } else if cell.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Loads a CSV file with a header row into an ordered [`Dataset`]
///
/// A path that does not resolve yields [`BridgeError::DatasetNotFound`]; the caller is
/// expected to give up rather than retry.
pub fn load(path: impl AsRef<Path>) -> Result<Dataset, BridgeError> {
    let path = path.as_ref();

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BridgeError::DatasetNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(BridgeError::Io(e)),
    };

    let malformed = |reason: String| BridgeError::DatasetMalformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    if columns.is_empty() || columns.iter().all(String::is_empty) {
        return Err(malformed("missing header row".to_string()));
    }
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(malformed(format!("duplicate column '{}'", column)));
        }
    }

    let records = reader
        .records()
        .collect::<Result<Vec<csv::StringRecord>, _>>()
        .map_err(|e| match e.position() {
            Some(pos) => malformed(format!("line {}: {}", pos.line(), e)),
            None => malformed(e.to_string()),
        })?;

    let kinds: Vec<ColumnKind> = (0..columns.len())
        .map(|col| {
            records
                .iter()
                .filter_map(|record| record.get(col))
                .filter(|cell| !is_missing(cell))
                .fold(ColumnKind::Empty, |kind, cell| kind.widen(ColumnKind::classify(cell)))
        })
        .collect();
    debug!("Inferred column kinds for {}: {:?}", path.display(), kinds);

    let rows = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let fields: Record = columns
                .iter()
                .zip(&kinds)
                .zip(record.iter())
                .map(|((column, kind), cell)| (column.clone(), kind.convert(cell)))
                .collect();
            Row::new(index, fields)
        })
        .collect::<Vec<_>>();

    info!(
        "Loaded {} rows with {} columns from {}",
        rows.len(),
        columns.len(),
        path.display()
    );

    Ok(Dataset::new(columns, rows))
}
