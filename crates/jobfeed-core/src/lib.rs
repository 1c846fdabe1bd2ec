//! Core domain model for the job feed: loosely-typed raw records, identity,
//! and the pure pipeline stages (normalization, diffing, projection, schema
//! inspection). Nothing in this crate performs I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod diff;
pub mod normalize;
pub mod projection;
pub mod schema;

pub use diff::{compute_diff, DiffResult, EventKind, LifecycleEvent};
pub use normalize::{derive_facility_id, facility_id_from_parts, normalize_string, FACILITY_ID_LEN};
pub use projection::{JobClassification, JobProjection};
pub use schema::{analyze, FieldStat, SchemaReport};

pub const CRATE_NAME: &str = "jobfeed-core";

/// Identity field of a feed record, most specific name first.
pub const IDENTITY_FIELDS: &[&str] = &["Stellennummer", "job_id"];

/// Last-modified marker used for change detection.
pub const CHANGE_FIELDS: &[&str] = &["Aenderungsdatum", "modified_at"];

/// Keys under which a feed may wrap its list of records.
pub const FEED_LIST_KEYS: &[&str] = &[
    "items",
    "data",
    "jobs",
    "results",
    "stellen",
    "Stellen",
    "stellenangebote",
];

/// Primary key of a persisted run.
pub type RunId = i64;

/// One job record exactly as the feed delivered it.
///
/// No schema is assumed. Field access goes through the first-matching-key
/// helpers so that upstream renames degrade to empty values instead of errors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawJobRecord(Map<String, Value>);

impl RawJobRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts JSON objects only; any other value is not a record.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// First key from `keys` that is present with a non-null value.
    pub fn first_value(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .find(|value| !value.is_null())
    }

    /// Scalar text of the first present key. Arrays and objects have no text.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        self.first_value(keys).and_then(scalar_text)
    }

    pub fn text_or_empty(&self, keys: &[&str]) -> String {
        self.text(keys).unwrap_or_default()
    }

    /// Like [`RawJobRecord::text`] but skips keys whose text is blank.
    pub fn non_empty_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .filter_map(scalar_text)
            .map(|text| text.trim().to_string())
            .find(|text| !text.is_empty())
    }

    /// Integer value of the first present key; anything non-numeric is 0.
    pub fn integer(&self, keys: &[&str]) -> i64 {
        match self.first_value(keys) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                    .unwrap_or(0)
            }
            Some(Value::Bool(b)) => i64::from(*b),
            _ => 0,
        }
    }

    /// First entry of an associative code table such as `{"12": "Pflege"}`.
    ///
    /// A JSON list is treated as a table keyed by position.
    pub fn first_code(&self, key: &str) -> Option<(String, String)> {
        match self.0.get(key)? {
            Value::Object(map) => map
                .iter()
                .next()
                .map(|(k, v)| (k.clone(), scalar_text(v).unwrap_or_default())),
            Value::Array(items) => items
                .first()
                .map(|v| ("0".to_string(), scalar_text(v).unwrap_or_default())),
            _ => None,
        }
    }

    /// Stable identity of the job, if the record carries a usable one.
    pub fn job_id(&self) -> Option<String> {
        self.non_empty_text(IDENTITY_FIELDS)
    }

    /// Value of the change-detection field; empty counts as absent.
    pub fn change_marker(&self) -> Option<String> {
        self.text(CHANGE_FIELDS).filter(|marker| !marker.is_empty())
    }
}

impl From<Map<String, Value>> for RawJobRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Text form of a scalar JSON value (`true` is `"1"`, `false` is empty).
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("1".to_string()),
        Value::Bool(false) => Some(String::new()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Flattens a decoded feed document into its list of records.
///
/// Accepts a bare array, an object wrapping the array under one of
/// [`FEED_LIST_KEYS`], or an object keyed by job number whose values are all
/// records. Anything else yields zero records.
pub fn unwrap_feed(document: Value) -> Vec<RawJobRecord> {
    match document {
        Value::Array(items) => collect_records(items),
        Value::Object(mut map) => {
            for key in FEED_LIST_KEYS {
                if matches!(map.get(*key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove(*key) {
                        return collect_records(items);
                    }
                }
            }
            if !map.is_empty() && map.values().all(Value::is_object) {
                return collect_records(map.into_iter().map(|(_, v)| v).collect());
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn collect_records(items: Vec<Value>) -> Vec<RawJobRecord> {
    items.into_iter().filter_map(RawJobRecord::from_value).collect()
}

#[cfg(test)]
pub(crate) fn record(value: Value) -> RawJobRecord {
    RawJobRecord::from_value(value).expect("test record must be an object")
}
