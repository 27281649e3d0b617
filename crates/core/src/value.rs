//! Value types for the persistence cache
//!
//! This module defines:
//! - Value: the recursive document type stored in the cache
//! - Path-addressed helpers (`get_child`, `update_child`) used by every
//!   tree algorithm in this crate
//!
//! ## Type Rules
//!
//! - Eight variants: Null, Bool, Int, Float, String, Bytes, Array, Object
//! - No implicit coercions: `Int(1) != Float(1.0)`
//! - Equality and ordering are total. Floats compare with `f64::total_cmp`,
//!   so `NaN == NaN` and `-0.0 < 0.0`. Values of different types order by
//!   variant rank.
//!
//! ## Priority
//!
//! A leaf carrying a priority is represented as an object
//! `{".value": leaf, ".priority": p}`. An object whose only key is
//! `.priority` is empty.

use crate::path::Path;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Reserved key carrying a sibling-ordering hint.
pub const PRIORITY_KEY: &str = ".priority";

/// Reserved key holding the leaf value of a node that also has a priority.
pub const VALUE_KEY: &str = ".value";

static NULL_VALUE: Value = Value::Null;

/// Recursive document value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    /// Absence of data
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Opaque blob
    Bytes(Vec<u8>),
    /// Ordered sequence
    Array(Vec<Value>),
    /// Map with string keys
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// An empty object.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::Array(_) => "Array",
            Value::Object(_) => "Object",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Array(_) => 6,
            Value::Object(_) => 7,
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this is an object value
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// True for anything that is not an object, including null.
    pub fn is_leaf(&self) -> bool {
        !self.is_object()
    }

    /// True for null and for objects holding nothing but a priority.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Object(map) => map.keys().all(|k| k == PRIORITY_KEY),
            _ => false,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a map if this is an Object value
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Priority attached to this value, or null.
    pub fn priority(&self) -> &Value {
        self.get_key(PRIORITY_KEY)
    }

    /// Immediate child by key, or null.
    pub fn get_key(&self, key: &str) -> &Value {
        match self {
            Value::Object(map) => map.get(key).unwrap_or(&NULL_VALUE),
            _ => &NULL_VALUE,
        }
    }

    /// Descendant at `path`, or null when any segment is missing.
    pub fn get_child(&self, path: &Path) -> &Value {
        let mut current = self;
        for segment in path.segments() {
            current = current.get_key(segment);
            if current.is_null() {
                break;
            }
        }
        current
    }

    /// Copy of this value with the descendant at `path` replaced.
    pub fn with_child(&self, path: &Path, value: Value) -> Value {
        let mut result = self.clone();
        result.update_child(path, value);
        result
    }

    /// Replace the descendant at `path` with `value`.
    ///
    /// Intermediate objects are created as needed. Writing null removes the
    /// child, and objects left empty collapse to null.
    pub fn update_child(&mut self, path: &Path, value: Value) {
        let Some(front) = path.front_directory() else {
            *self = value;
            return;
        };
        let rest = path.pop_front_directory();

        if !self.is_object() {
            if value.is_null() {
                return;
            }
            let previous = std::mem::take(self);
            let mut map = BTreeMap::new();
            if front == PRIORITY_KEY && rest.is_empty() && !previous.is_null() {
                map.insert(VALUE_KEY.to_string(), previous);
            }
            *self = Value::Object(map);
        }

        if let Value::Object(map) = self {
            if front != PRIORITY_KEY && front != VALUE_KEY {
                map.remove(VALUE_KEY);
            }
            // A node's own leaf replaces its children.
            if front == VALUE_KEY && rest.is_empty() && !value.is_null() {
                map.retain(|key, _| key == PRIORITY_KEY);
            }
            let child = map.entry(front.to_string()).or_default();
            child.update_child(&rest, value);
            if child.is_empty() && front != PRIORITY_KEY {
                map.remove(front);
            } else if child.is_null() {
                map.remove(front);
            }
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        let Value::Object(map) = self else {
            return;
        };
        if map.keys().all(|k| k == PRIORITY_KEY) {
            *self = Value::Null;
        } else if map.len() == 1 && map.contains_key(VALUE_KEY) {
            if let Some(leaf) = map.remove(VALUE_KEY) {
                *self = leaf;
            }
        }
    }

    /// Visit every non-null leaf with its path relative to `self`.
    pub fn visit_leaves<F>(&self, visitor: &mut F)
    where
        F: FnMut(&Path, &Value),
    {
        self.visit_leaves_at(&Path::root(), visitor);
    }

    fn visit_leaves_at<F>(&self, prefix: &Path, visitor: &mut F)
    where
        F: FnMut(&Path, &Value),
    {
        match self {
            Value::Null => {}
            Value::Object(map) => {
                for (key, child) in map {
                    child.visit_leaves_at(&prefix.child(key), visitor);
                }
            }
            leaf => visitor(prefix, leaf),
        }
    }

    /// Rough in-memory footprint in bytes.
    pub fn estimated_size(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
            Value::Array(items) => items.iter().map(Value::estimated_size).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() as u64 + v.estimated_size())
                .sum(),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

// ============================================================================
// From implementations for ergonomic API usage
// ============================================================================

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(o: BTreeMap<String, Value>) -> Self {
        Value::Object(o)
    }
}

// ============================================================================
// serde_json interop for ergonomic JSON construction
// ============================================================================

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                let mut map = BTreeMap::new();
                let mut nested = Vec::new();
                for (k, v) in obj {
                    let child = Value::from(v);
                    if child.is_null() {
                        continue;
                    }
                    if k.contains(crate::path::SEPARATOR) {
                        nested.push((k, child));
                    } else {
                        map.insert(k, child);
                    }
                }
                let mut result = if map.is_empty() {
                    Value::Null
                } else {
                    Value::Object(map)
                };
                // Keys such as "rooms/eros" address nested children.
                for (k, child) in nested {
                    result.update_child(&Path::new(&k), child);
                }
                result
            }
        }
    }
}
