//! Timestamp parsing for ingress payloads and query parameters.
//!
//! Producers send either RFC 3339 timestamps or ISO-8601 local date-times without an
//! offset. The latter are read as UTC.
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer};

const LOCAL_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let rfc3339_error = match DateTime::parse_from_rfc3339(value) {
        Ok(timestamp) => return Ok(timestamp.with_timezone(&Utc)),
        Err(error) => error,
    };

    LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or(rfc3339_error)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse(&value).map_err(|error| de::Error::custom(format!("invalid timestamp '{value}': {error}")))
}

pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => parse(&value).map(Some).map_err(|error| {
            de::Error::custom(format!("invalid timestamp '{value}': {error}"))
        }),
    }
}
