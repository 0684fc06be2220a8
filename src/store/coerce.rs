//! Normalization helpers for loosely-typed legacy data.
//!
//! The legacy guild document carries ids as either JSON numbers or strings,
//! booleans as `true`/`false` or `0`/`1`, and timestamps as naive ISO-8601
//! strings (sometimes with a trailing `Z`). Everything is normalized on read.
//! Timestamps are treated as UTC throughout; values written by this crate are
//! RFC 3339 with a `Z` suffix.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

/// Extract a platform id from a JSON value that may be a number or a string.
pub fn id_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Null => None,
        Value::Number(number) => number.as_u64(),
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => id_from_text(text),
        other => {
            warn!("Store: unexpected id value {other} ignored");
            None
        }
    }
}

/// Parse an id stored as text (the database keeps all ids as TEXT columns).
pub fn id_from_text(text: &str) -> Option<u64> {
    match text.trim().parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Store: unable to parse id value '{text}'");
            None
        }
    }
}

/// Normalize a boolean that may be stored as a bool or a 0/1 integer.
pub fn flag_from_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Normalize a minute count that may be stored as a number or numeric string.
pub fn minutes_from_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Parse an ISO-8601 timestamp. Naive values (no offset) are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }
    warn!("Store: unable to parse timestamp value '{raw}'");
    None
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Serde adapter for optional timestamps in the guild document.
pub mod opt_timestamp {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use tracing::warn;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&format_timestamp(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => parse_timestamp(&raw),
            Some(other) => {
                warn!("Store: unexpected timestamp value {other} ignored");
                None
            }
        })
    }
}

pub fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}

pub fn de_id_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(id_from_value(&value).unwrap_or_default())
}

pub fn de_flag_true<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(flag_from_value(&value).unwrap_or_else(|| {
        warn!("Store: unexpected boolean value {value}, keeping default");
        true
    }))
}

pub fn de_flag_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(flag_from_value(&value).unwrap_or_else(|| {
        warn!("Store: unexpected boolean value {value}, keeping default");
        false
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_id_coercion() {
        assert_eq!(id_from_value(&json!(123456789012345678u64)), Some(123456789012345678));
        assert_eq!(id_from_value(&json!("987654321")), Some(987654321));
        assert_eq!(id_from_value(&json!(null)), None);
        assert_eq!(id_from_value(&json!("")), None);
        assert_eq!(id_from_value(&json!("not-an-id")), None);
    }

    #[test]
    fn test_flag_coercion() {
        assert_eq!(flag_from_value(&json!(true)), Some(true));
        assert_eq!(flag_from_value(&json!(0)), Some(false));
        assert_eq!(flag_from_value(&json!(1)), Some(true));
        assert_eq!(flag_from_value(&json!("yes")), None);
    }

    #[test]
    fn test_timestamp_parsing() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        // Naive, naive with Z, and full RFC 3339 all normalize to UTC.
        assert_eq!(parse_timestamp("2025-03-14T15:09:26"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-14T15:09:26Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-14T15:09:26+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-14 15:09:26"), Some(expected));
        assert_eq!(parse_timestamp("garbage"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let dt = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let formatted = format_timestamp(&dt);
        assert_eq!(formatted, "2025-12-31T23:59:59Z");
        assert_eq!(parse_timestamp(&formatted), Some(dt));
    }
}
