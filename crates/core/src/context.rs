//! Restart state attached to job and step executions.
//!
//! An `ExecutionContext` is a flat, string-keyed bag of primitive values (plus
//! nested maps) that readers and writers use to record enough progress to
//! resume mid-stream after a crash. It tracks a dirty flag so the repository
//! only persists it when something actually changed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value stored in an [`ExecutionContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextValue {
    String(String),
    Long(i64),
    Double(#[serde(with = "double")] f64),
    DateTime(DateTime<Utc>),
    Bool(bool),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    fn type_name(&self) -> &'static str {
        match self {
            ContextValue::String(_) => "string",
            ContextValue::Long(_) => "long",
            ContextValue::Double(_) => "double",
            ContextValue::DateTime(_) => "datetime",
            ContextValue::Bool(_) => "bool",
            ContextValue::Map(_) => "map",
        }
    }
}

/// NaN doubles compare equal to each other.
impl PartialEq for ContextValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ContextValue::String(a), ContextValue::String(b)) => a == b,
            (ContextValue::Long(a), ContextValue::Long(b)) => a == b,
            (ContextValue::Double(a), ContextValue::Double(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (ContextValue::DateTime(a), ContextValue::DateTime(b)) => a == b,
            (ContextValue::Bool(a), ContextValue::Bool(b)) => a == b,
            (ContextValue::Map(a), ContextValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

/// JSON has no representation for NaN or the infinities; those are written
/// as strings so they survive a round trip.
mod double {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value.is_sign_positive() {
            serializer.serialize_str(INFINITY)
        } else {
            serializer.serialize_str(NEG_INFINITY)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Special(text) => match text.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid double '{other}'"))),
            },
        }
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_string())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Long(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Double(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for ContextValue {
    fn from(value: DateTime<Utc>) -> Self {
        ContextValue::DateTime(value)
    }
}

impl From<BTreeMap<String, ContextValue>> for ContextValue {
    fn from(value: BTreeMap<String, ContextValue>) -> Self {
        ContextValue::Map(value)
    }
}

/// Typed read failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no value for key '{0}'")]
    Missing(String),

    #[error("value for key '{key}' is a {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("execution context codec failed: {0}")]
    Codec(String),
}

/// String-keyed restart state with dirty tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    entries: BTreeMap<String, ContextValue>,
    #[serde(skip)]
    dirty: bool,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty, $expected:literal) => {
        pub fn $name(&self, key: &str) -> Result<$ty, ContextError> {
            match self.entries.get(key) {
                Some(ContextValue::$variant(v)) => Ok(v.clone()),
                Some(other) => Err(ContextError::TypeMismatch {
                    key: key.to_string(),
                    expected: $expected,
                    found: other.type_name(),
                }),
                None => Err(ContextError::Missing(key.to_string())),
            }
        }
    };
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; marks the context dirty only if the stored value changed.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let value = value.into();
        let previous = self.entries.insert(key.into(), value.clone());
        if previous.as_ref() != Some(&value) {
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Replace every entry with those of `other` (restore, never merge).
    pub fn replace_with(&mut self, other: &ExecutionContext) {
        if self.entries != other.entries {
            self.entries = other.entries.clone();
            self.dirty = true;
        }
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    typed_getter!(get_string, String, String, "string");
    typed_getter!(get_long, Long, i64, "long");
    typed_getter!(get_double, Double, f64, "double");
    typed_getter!(get_datetime, DateTime, DateTime<Utc>, "datetime");
    typed_getter!(get_bool, Bool, bool, "bool");
    typed_getter!(get_map, Map, BTreeMap<String, ContextValue>, "map");

    /// Long value with a fallback when the key is absent.
    pub fn get_long_or(&self, key: &str, default: i64) -> Result<i64, ContextError> {
        match self.get_long(key) {
            Err(ContextError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by the repository once the context has been persisted.
    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
    }

    pub fn to_json(&self) -> Result<String, ContextError> {
        serde_json::to_string(self).map_err(|e| ContextError::Codec(e.to_string()))
    }

    /// Decode a persisted context; the result starts clean.
    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        serde_json::from_str(json).map_err(|e| ContextError::Codec(e.to_string()))
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
