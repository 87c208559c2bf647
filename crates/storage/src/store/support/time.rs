#![forbid(unsafe_code)]

use super::super::StoreError;
use ::time::OffsetDateTime;
use ::time::format_description::well_known::Rfc3339;

pub(in crate::store) fn rfc3339_from_ms(ms: i64) -> Result<String, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| StoreError::CorruptRow(format!("timestamp out of range: {e}")))?
        .format(&Rfc3339)
        .map_err(|e| StoreError::CorruptRow(format!("timestamp format: {e}")))
}

pub(in crate::store) fn expiry_ms(now_ms: i64, ttl_ms: u64) -> i64 {
    now_ms.saturating_add(ttl_ms.min(i64::MAX as u64) as i64)
}
