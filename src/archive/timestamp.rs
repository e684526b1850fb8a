//! ISO-8601 timestamps with millisecond precision.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Render as `2024-05-01T10:00:00.123Z`.
pub fn format_millis(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse any RFC 3339 timestamp, normalised to UTC.
pub fn parse_iso(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|at| at.with_timezone(&Utc))
}

/// Parse an HTTP date as found in `Expires` cookie attributes.
///
/// Accepts RFC 1123 (`Wed, 21 Oct 2015 07:28:00 GMT`) and the Netscape
/// variant with dashes (`Wed, 21-Oct-2015 07:28:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%a, %d-%b-%y %H:%M:%S GMT"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for optional timestamps written with millisecond precision.
pub mod option_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_str(&super::format_millis(at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            // Other tools write HTTP dates here; an unreadable expiry is a session cookie.
            Some(value) => Ok(super::parse_iso(&value)
                .ok()
                .or_else(|| super::parse_http_date(&value))),
            None => Ok(None),
        }
    }
}
