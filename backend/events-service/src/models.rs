//! Event types and boundary validation.
//!
//! Raw records arrive as loose JSON (HTTP body, queued job payload, CSV row).
//! [`Event::from_raw`] turns one into a validated [`Event`] or names the first
//! offending field.

use chrono::{DateTime, NaiveDateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Upper bound of ClickHouse `DateTime` (u32 seconds)
const MAX_UNIX_SECONDS: i64 = u32::MAX as i64;

const MAX_IDENTIFIER_LEN: usize = 255;

/// Opaque event attributes, held as canonical JSON object text.
///
/// Core logic never looks inside; only the query engine filters on it, and
/// that happens in the analytical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties(String);

impl Properties {
    pub fn empty() -> Self {
        Properties("{}".to_string())
    }

    /// Accept a JSON object; `null` means no properties.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(Self::empty()),
            serde_json::Value::Object(_) if contains_nul(value) => {
                Err("must not contain NUL characters".to_string())
            }
            serde_json::Value::Object(_) => serde_json::to_string(value)
                .map(Properties)
                .map_err(|e| e.to_string()),
            _ => Err("must be a JSON object".to_string()),
        }
    }

    /// Parse JSON object text; blank input means no properties.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::empty());
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))?;
        Self::from_value(&value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: serde_json::Value =
            serde_json::from_str(&self.0).map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Properties::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// A validated activity event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub user_id: String,
    pub event_type: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Which field of a raw record failed validation, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    /// `events[2].occurred_at: ...` style message for batch positions
    pub fn at(&self, index: usize) -> String {
        format!("events[{}].{}: {}", index, self.field, self.reason)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl Event {
    /// Validate one raw JSON record.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, FieldError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| FieldError::new("event", "must be a JSON object"))?;
        let null = serde_json::Value::Null;
        let field = |name: &str| obj.get(name).unwrap_or(&null);

        let event_id = match field("event_id") {
            serde_json::Value::String(s) => Uuid::parse_str(s)
                .map_err(|_| FieldError::new("event_id", "must be a UUID"))?,
            serde_json::Value::Null => return Err(FieldError::new("event_id", "field required")),
            _ => return Err(FieldError::new("event_id", "must be a UUID string")),
        };

        let occurred_at = match field("occurred_at") {
            serde_json::Value::String(s) => parse_timestamp(s)
                .map_err(|reason| FieldError::new("occurred_at", reason))?,
            serde_json::Value::Null => {
                return Err(FieldError::new("occurred_at", "field required"))
            }
            _ => return Err(FieldError::new("occurred_at", "must be an ISO-8601 string")),
        };

        let user_id = required_identifier(field("user_id"), "user_id")?;
        let event_type = required_identifier(field("event_type"), "event_type")?;
        let properties = Properties::from_value(field("properties"))
            .map_err(|reason| FieldError::new("properties", reason))?;

        Ok(Self {
            event_id,
            occurred_at,
            user_id,
            event_type,
            properties,
        })
    }

    /// JSON form used in queue payloads; round-trips through [`Event::from_raw`].
    pub fn to_raw(&self) -> serde_json::Value {
        serde_json::json!({
            "event_id": self.event_id.to_string(),
            "occurred_at": self.occurred_at.to_rfc3339(),
            "user_id": self.user_id,
            "event_type": self.event_type,
            "properties": serde_json::from_str::<serde_json::Value>(self.properties.as_str())
                .unwrap_or_else(|_| serde_json::json!({})),
        })
    }

    pub fn to_row(&self) -> AnalyticsEventRow {
        AnalyticsEventRow {
            event_id: self.event_id.to_string(),
            // Range checked in parse_timestamp
            occurred_at: self.occurred_at.timestamp() as u32,
            user_id: self.user_id.clone(),
            event_type: self.event_type.clone(),
            properties: self.properties.as_str().to_string(),
        }
    }
}

fn required_identifier(value: &serde_json::Value, name: &'static str) -> Result<String, FieldError> {
    match value {
        serde_json::Value::String(s) if s.trim().is_empty() => {
            Err(FieldError::new(name, "must not be empty"))
        }
        serde_json::Value::String(s) if s.contains('\0') => {
            Err(FieldError::new(name, "must not contain NUL characters"))
        }
        serde_json::Value::String(s) if s.len() > MAX_IDENTIFIER_LEN => Err(FieldError::new(
            name,
            format!("longer than {} characters", MAX_IDENTIFIER_LEN),
        )),
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Null => Err(FieldError::new(name, "field required")),
        _ => Err(FieldError::new(name, "must be a string")),
    }
}

/// PostgreSQL text and JSONB columns cannot hold U+0000
fn contains_nul(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.contains('\0'),
        serde_json::Value::Array(items) => items.iter().any(contains_nul),
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(key, item)| key.contains('\0') || contains_nul(item)),
        _ => false,
    }
}

/// RFC 3339 with offset, or a naive ISO-8601 timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
        })
        .map_err(|_| "invalid timestamp".to_string())?;

    let secs = parsed.timestamp();
    if !(0..=MAX_UNIX_SECONDS).contains(&secs) {
        return Err("timestamp outside supported range (1970-01-01 to 2106-02-07)".to_string());
    }
    Ok(parsed)
}

/// Row in the ClickHouse `events` table. `created_at` is filled by the server.
#[derive(Debug, Clone, PartialEq, Eq, Row, Serialize, Deserialize)]
pub struct AnalyticsEventRow {
    pub event_id: String,
    pub occurred_at: u32, // Unix timestamp for ClickHouse DateTime
    pub user_id: String,
    pub event_type: String,
    pub properties: String,
}

/// `POST /events` body. Records stay raw until validated so errors can name
/// the exact position.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Row)]
pub struct DauRow {
    pub date: String,
    pub unique_users: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Row)]
pub struct TopEventRow {
    pub event_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionRow {
    pub cohort_week: String,
    pub week_0: u64,
    pub week_1: f64,
    pub week_2: f64,
    pub week_3: f64,
}
