//! JSON payload codec
//!
//! One row becomes one JSON object: keys are the column names in file order, values keep
//! their scalar type (`40` stays an integer, `40.0` stays a float, null stays null).

use crate::dataset::{Row, Value};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON has no representation for NaN or infinity
    #[error("column '{column}' holds a non-finite float")]
    NonFiniteFloat { column: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a row into its wire payload
pub fn encode(row: &Row) -> Result<Vec<u8>, CodecError> {
    for (column, value) in row.record().iter() {
        if let Value::Float(x) = value {
            if !x.is_finite() {
                return Err(CodecError::NonFiniteFloat {
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(serde_json::to_vec(row.record())?)
}

/// Parses a payload produced by [`encode`] back into a record
#[cfg(test)]
pub fn decode(bytes: &[u8]) -> Result<crate::dataset::Record, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// First `max_chars` characters of a payload, for progress output
pub fn preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}
