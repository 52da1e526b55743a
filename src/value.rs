//! Script value codec boundary
//!
//! [`Value`] is what crosses between the scripting host and the bridge: call
//! arguments come in as values, and task results, frames and errors go back
//! out as values. The host's own marshalling layer maps these onto its stack.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::registry::{Handle, HandleRegistry};

/// A script-side value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Byte string; scripts treat these as (possibly binary) strings
    Bytes(Vec<u8>),
    /// Sequence table, 1-based on the script side
    List(Vec<Value>),
    /// Table keyed by strings
    Map(BTreeMap<String, Value>),
    /// Opaque reference into the handle registry
    Handle(Handle),
}

impl Value {
    /// Byte string from text
    pub fn string(s: impl Into<String>) -> Self {
        Value::Bytes(s.into().into_bytes())
    }

    /// Script-side type name, used in argument errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Bytes(_) => "string",
            Value::List(_) | Value::Map(_) => "table",
            Value::Handle(_) => "userdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow a byte string as UTF-8 text
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Value::Handle(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup on a map table; anything else has no fields
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Build a map table from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

// Byte strings render as (lossy) text so results read naturally as JSON.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Value::Handle(h) => h.serialize(serializer),
        }
    }
}

/// Conversion of a host-side result into a script value
///
/// Called every time a completed task is polled, so implementations must be
/// repeatable. Implementations that expose host objects allocate a fresh
/// handle in `registry` on each call.
pub trait Marshal: Send + Sync + 'static {
    fn marshal(&self, registry: &HandleRegistry) -> Value;
}

impl Marshal for Value {
    fn marshal(&self, _registry: &HandleRegistry) -> Value {
        self.clone()
    }
}
