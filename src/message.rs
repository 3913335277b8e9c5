//! # Wire Message Model
//!
//! This module defines the payload carried by every RPC frame: a `Message`
//! with two ordered, insertion-order-preserving sections (`head` and
//! `data`), and the small tagged `Value` type used for section entries.
//!
//! ## Design
//!
//! - **Ordered**: both sections preserve insertion order across a
//!   serialize/deserialize round trip (spec invariant).
//! - **Best-effort typed access**: `get_string`/`get_int`/`get_long`/
//!   `get_double`/`get_bool` coerce across value kinds and fall back to the
//!   zero value of the target type on failure, logging rather than
//!   propagating an error — callers should never need to handle a
//!   malformed field as an exception.
//! - **Self-describing, schema-bounded**: `Value` is a closed enum, so a
//!   decoder can only ever produce one of these nine shapes. There is no
//!   arbitrary-class deserialization surface to allow-list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Reserved `head` keys used by the routing and response envelope machinery.
pub mod head_keys {
    pub const PROC: &str = "proc";
    pub const PROC_ID: &str = "procId";
    pub const PROC_IP: &str = "procIp";
    pub const PROC_HOST: &str = "procHost";
    pub const SOURCE: &str = "source";
    pub const TARGET: &str = "target";
    pub const RESULT: &str = "result";
    pub const MESSAGE: &str = "message";
    pub const ID: &str = "id";
    pub const EXT_TRX_ID: &str = "extTrxId";
    pub const TIME: &str = "time";
}

/// A single value carried in a `head` or `data` section.
///
/// Closed set of variants: a decoder can never materialize anything other
/// than one of these shapes, which is what makes the wire codec
/// schema-bounded rather than reflective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Map(Section),
    List(Vec<Value>),
    Null,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Section> for Value {
    fn from(v: Section) -> Self {
        Value::Map(v)
    }
}

/// An insertion-order-preserving string-keyed map.
///
/// Keys are assumed non-empty (the spec's invariant); this type does not
/// enforce it itself since enforcement belongs to whoever builds a
/// `Message` by hand, not to the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(String, Value)>", into = "Vec<(String, Value)>")]
pub struct Section {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert or replace a value, preserving the original position on
    /// replace rather than moving the key to the end.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(&i) = self.index.get(&key) {
            self.entries[i].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for idx in self.index.values_mut() {
            if *idx > i {
                *idx -= 1;
            }
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Merge `other` into `self`, replacing any keys that already exist.
    pub fn merge(&mut self, other: Section) {
        for (k, v) in other.entries {
            self.insert(k, v);
        }
    }

    /// Best-effort coercion to `String`. Numeric and boolean values format
    /// as text; byte arrays decode with a lossy UTF-8 conversion. Returns
    /// an empty string and logs on a missing key or unsupported shape.
    pub fn get_string(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::Str(s)) => s.clone(),
            Some(Value::I32(v)) => v.to_string(),
            Some(Value::I64(v)) => v.to_string(),
            Some(Value::F64(v)) => v.to_string(),
            Some(Value::Bool(v)) => v.to_string(),
            Some(Value::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
            other => {
                warn!(key, ?other, "get_string: coercion failed, returning empty string");
                String::new()
            }
        }
    }

    /// Best-effort coercion to `i32`. Numeric strings parse; booleans map
    /// to 0/1; out-of-range widening truncates. Returns 0 on failure.
    pub fn get_int(&self, key: &str) -> i32 {
        match self.get(key) {
            Some(Value::I32(v)) => *v,
            Some(Value::I64(v)) => *v as i32,
            Some(Value::F64(v)) => *v as i32,
            Some(Value::Bool(v)) => *v as i32,
            Some(Value::Str(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %s, "get_int: failed to parse string, returning 0");
                0
            }),
            other => {
                warn!(key, ?other, "get_int: coercion failed, returning 0");
                0
            }
        }
    }

    /// Best-effort coercion to `i64`. See `get_int` for the coercion rules.
    pub fn get_long(&self, key: &str) -> i64 {
        match self.get(key) {
            Some(Value::I64(v)) => *v,
            Some(Value::I32(v)) => *v as i64,
            Some(Value::F64(v)) => *v as i64,
            Some(Value::Bool(v)) => *v as i64,
            Some(Value::Str(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %s, "get_long: failed to parse string, returning 0");
                0
            }),
            other => {
                warn!(key, ?other, "get_long: coercion failed, returning 0");
                0
            }
        }
    }

    /// Best-effort coercion to `f64`. See `get_int` for the coercion rules.
    pub fn get_double(&self, key: &str) -> f64 {
        match self.get(key) {
            Some(Value::F64(v)) => *v,
            Some(Value::I32(v)) => *v as f64,
            Some(Value::I64(v)) => *v as f64,
            Some(Value::Bool(v)) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            Some(Value::Str(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %s, "get_double: failed to parse string, returning 0.0");
                0.0
            }),
            other => {
                warn!(key, ?other, "get_double: coercion failed, returning 0.0");
                0.0
            }
        }
    }

    /// Best-effort coercion to `bool`. Numbers are truthy when non-zero;
    /// strings accept `"true"`/`"false"` case-insensitively or `"1"`/`"0"`.
    /// Returns `false` on failure.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(v)) => *v,
            Some(Value::I32(v)) => *v != 0,
            Some(Value::I64(v)) => *v != 0,
            Some(Value::F64(v)) => *v != 0.0,
            Some(Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    warn!(key, value = %s, "get_bool: failed to parse string, returning false");
                    false
                }
            },
            other => {
                warn!(key, ?other, "get_bool: coercion failed, returning false");
                false
            }
        }
    }
}

impl TryFrom<Vec<(String, Value)>> for Section {
    type Error = std::convert::Infallible;

    fn try_from(entries: Vec<(String, Value)>) -> Result<Self, Self::Error> {
        let mut section = Section::default();
        for (k, v) in entries {
            section.insert(k, v);
        }
        Ok(section)
    }
}

impl From<Section> for Vec<(String, Value)> {
    fn from(section: Section) -> Self {
        section.entries
    }
}

/// A complete RPC payload: a `head` section for routing/control metadata
/// and a `data` section for the application payload.
///
/// A freshly constructed `Message` always has empty (never null) sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub head: Section,
    pub data: Section,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for a request addressed at `target`.
    pub fn for_target(target: impl Into<String>) -> Self {
        let mut message = Self::new();
        message.head.insert(head_keys::TARGET, target.into());
        message
    }

    pub fn target(&self) -> Option<String> {
        self.head.get(head_keys::TARGET).map(|_| self.head.get_string(head_keys::TARGET))
    }

    /// Encode to bytes using the crate's tagged binary codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from bytes produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_preserves_insertion_order() {
        let mut section = Section::new();
        section.insert("c", 1i32);
        section.insert("a", 2i32);
        section.insert("b", 3i32);

        let keys: Vec<&str> = section.keys().collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn section_replace_keeps_position() {
        let mut section = Section::new();
        section.insert("a", 1i32);
        section.insert("b", 2i32);
        section.insert("a", 99i32);

        let keys: Vec<&str> = section.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(section.get_int("a"), 99);
    }

    #[test]
    fn message_round_trip_preserves_order_and_values() {
        let mut message = Message::new();
        message.head.insert(head_keys::TARGET, "/inet/head");
        message.head.insert("extTrxId", "12345-abc");
        message.data.insert("x", 1i64);
        message.data.insert("y", vec![1u8, 2, 3]);

        let bytes = message.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(message, decoded);
        let keys: Vec<&str> = decoded.head.keys().collect();
        assert_eq!(keys, vec!["target", "extTrxId"]);
    }

    #[test]
    fn typed_getters_coerce_best_effort() {
        let mut section = Section::new();
        section.insert("n", "42");
        section.insert("f", "3.5");
        section.insert("b", "true");
        section.insert("missing_placeholder", Value::Null);

        assert_eq!(section.get_int("n"), 42);
        assert_eq!(section.get_double("f"), 3.5);
        assert!(section.get_bool("b"));
        assert_eq!(section.get_string("missing"), "");
        assert_eq!(section.get_int("missing"), 0);
        assert!(!section.get_bool("missing"));
    }

    #[test]
    fn merge_replaces_overlapping_keys() {
        let mut base = Section::new();
        base.insert("a", 1i32);
        base.insert("b", 2i32);

        let mut incoming = Section::new();
        incoming.insert("b", 99i32);
        incoming.insert("c", 3i32);

        base.merge(incoming);

        assert_eq!(base.get_int("a"), 1);
        assert_eq!(base.get_int("b"), 99);
        assert_eq!(base.get_int("c"), 3);
    }
}
