use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Declared type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Uuid,
    Json,
}

impl ScalarType {
    /// Whether values of this type can identify a row.
    pub fn is_key_type(self) -> bool {
        matches!(self, ScalarType::Integer | ScalarType::Text | ScalarType::Uuid)
    }

    /// Converts a JSON payload value into a typed value, `None` when it does not fit.
    pub fn from_json(self, value: &Value) -> Option<FieldValue> {
        if value.is_null() {
            return Some(FieldValue::Null);
        }
        match (self, value) {
            // Json columns render as their text form, so strings are read back through it
            (ScalarType::Json, Value::String(s)) => self.parse_text(s),
            (ScalarType::Json, v) => Some(FieldValue::Json(v.clone())),
            (ScalarType::Text, Value::String(s)) => Some(FieldValue::Text(s.clone())),
            (ScalarType::Text, Value::Number(n)) => Some(FieldValue::Text(n.to_string())),
            (ScalarType::Text, Value::Bool(b)) => Some(FieldValue::Text(b.to_string())),
            (ScalarType::Integer, Value::Number(n)) => n.as_i64().map(FieldValue::Int),
            (ScalarType::Float, Value::Number(n)) => n.as_f64().map(FieldValue::Float),
            (ScalarType::Boolean, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
            (_, Value::String(s)) => self.parse_text(s),
            _ => None,
        }
    }

    /// Parses the textual form used by filters and URL identifiers.
    pub fn parse_text(self, text: &str) -> Option<FieldValue> {
        match self {
            ScalarType::Text => Some(FieldValue::Text(text.to_string())),
            ScalarType::Integer => text.trim().parse().ok().map(FieldValue::Int),
            ScalarType::Float => text.trim().parse().ok().map(FieldValue::Float),
            ScalarType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(FieldValue::Bool(true)),
                "false" | "0" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            ScalarType::Timestamp => parse_timestamp(text.trim()).map(FieldValue::Timestamp),
            ScalarType::Date => parse_date(text.trim()).map(FieldValue::Date),
            ScalarType::Uuid => Uuid::parse_str(text.trim()).ok().map(FieldValue::Uuid),
            ScalarType::Json => Some(FieldValue::Json(
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
            )),
        }
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    // A bare date means midnight UTC
    parse_date(text)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// A runtime attribute value as the store hands it out.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Json(Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Primitive values map directly onto plain data; the rest are store-native.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            FieldValue::Null
                | FieldValue::Bool(_)
                | FieldValue::Int(_)
                | FieldValue::Float(_)
                | FieldValue::Text(_)
        )
    }

    /// Plain-data rendering. Store-native values are coerced to their textual form.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            other => other.as_text().map(Value::String).unwrap_or(Value::Null),
        }
    }

    /// Textual representation used by text lookups and output coercion.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            FieldValue::Date(d) => Some(d.to_string()),
            FieldValue::Uuid(u) => Some(u.to_string()),
            FieldValue::Json(v) => Some(v.to_string()),
        }
    }

    /// Ordering between values of compatible kinds, `None` otherwise.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Json(a), Json(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    pub fn same_as(&self, other: &FieldValue) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Key> for FieldValue {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(i) => FieldValue::Int(i),
            Key::Text(s) => FieldValue::Text(s),
            Key::Uuid(u) => FieldValue::Uuid(u),
        }
    }
}

/// Identity of a row: the value of a primary key or of a foreign key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl Key {
    pub fn from_field(value: &FieldValue) -> Option<Key> {
        match value {
            FieldValue::Int(i) => Some(Key::Int(*i)),
            FieldValue::Text(s) => Some(Key::Text(s.clone())),
            FieldValue::Uuid(u) => Some(Key::Uuid(*u)),
            _ => None,
        }
    }

    /// Reads an identifier supplied in a payload (`5` and `"5"` are the same integer key).
    pub fn from_json(value: &Value, key_type: ScalarType) -> Option<Key> {
        match value {
            Value::String(_) | Value::Number(_) => key_type
                .from_json(value)
                .as_ref()
                .and_then(Key::from_field),
            _ => None,
        }
    }

    pub fn parse(text: &str, key_type: ScalarType) -> Option<Key> {
        key_type.parse_text(text).as_ref().and_then(Key::from_field)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{}", s),
            Key::Uuid(u) => write!(f, "{}", u),
        }
    }
}
