#![forbid(unsafe_code)]

use super::super::StoreError;
use serde_json::Value as JsonValue;

pub(in crate::store) fn encode_json(value: &JsonValue) -> String {
    value.to_string()
}

/// Decode a JSON text column; a malformed value means the row was written by something else.
pub(in crate::store) fn decode_json_column(
    column: &'static str,
    raw: &str,
) -> Result<JsonValue, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow(format!("{column}: {e}")))
}

pub(in crate::store) fn decode_optional_json_column(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<JsonValue>, StoreError> {
    raw.as_deref()
        .map(|raw| decode_json_column(column, raw))
        .transpose()
}
