//! Ordered multi-value metadata store.
//!
//! Used for per-context side data (gRPC call metadata, HTTP response
//! headers, internal bookkeeping keys) and for application-level ad hoc
//! data. Keys keep their first-insertion order; each key maps to a
//! non-empty list of values.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A single metadata value.
///
/// Binary values are copied (never aliased) whenever the store hands out a
/// projection or a clone, so a caller mutating a received buffer can never
/// observe or disturb another holder's copy.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// UTF-8 text (headers, gRPC ASCII metadata, request payloads).
    Text(String),
    /// Raw bytes (gRPC `-bin` metadata).
    Binary(Bytes),
    /// Arbitrary structured data (configuration caches, GraphQL variables).
    Json(serde_json::Value),
}

impl MetadataValue {
    /// Returns the text content if this is a `Text` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the JSON content if this is a `Json` value.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a copy whose binary payload (if any) owns fresh storage.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        match self {
            Self::Binary(b) => Self::Binary(Bytes::copy_from_slice(b)),
            other => other.clone(),
        }
    }

    /// Converts a JSON value into the most specific metadata value.
    ///
    /// JSON strings become `Text`; everything else stays `Json`.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }

    /// Converts the value to JSON for serialization.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Binary(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Self::Json(v) => v.clone(),
        }
    }

    /// Whether the value is "truly empty": empty text, empty bytes, JSON
    /// null, or an empty JSON string/array/object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Binary(b) => b.is_empty(),
            Self::Json(v) => match v {
                serde_json::Value::Null => true,
                serde_json::Value::String(s) => s.is_empty(),
                serde_json::Value::Array(a) => a.is_empty(),
                serde_json::Value::Object(o) => o.is_empty(),
                _ => false,
            },
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Binary(b) => f.write_str(&String::from_utf8_lossy(b)),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl Serialize for MetadataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(s) => serializer.serialize_str(s),
            Self::Binary(b) => serializer.collect_seq(b.iter()),
            Self::Json(v) => v.serialize(serializer),
        }
    }
}

/// Ordered mapping from string key to a non-empty list of values.
///
/// `get` on a missing key yields an empty slice. `set` replaces the whole
/// list, `add` appends, `merge` concatenates per key keeping the receiver's
/// values first.
#[derive(Debug, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, Vec<MetadataValue>)>,
}

impl Metadata {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from already-formed value lists (no wrapping).
    ///
    /// Keys with an empty list are skipped so every stored key keeps at
    /// least one value.
    pub fn from_map<I, K>(lists: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<MetadataValue>)>,
        K: Into<String>,
    {
        let mut md = Self::new();
        for (key, values) in lists {
            if !values.is_empty() {
                md.put(key.into(), values);
            }
        }
        md
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    fn put(&mut self, key: String, values: Vec<MetadataValue>) {
        match self.position(&key) {
            Some(idx) => self.entries[idx].1 = values,
            None => self.entries.push((key, values)),
        }
    }

    /// Replaces the value list for `key` with `[value]`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.put(key.into(), vec![value.into()]);
    }

    /// Replaces the value list for `key` with `values`.
    ///
    /// An empty `values` removes the key.
    pub fn set_all(&mut self, key: impl Into<String>, values: Vec<MetadataValue>) {
        let key = key.into();
        if values.is_empty() {
            self.remove(&key);
        } else {
            self.put(key, values);
        }
    }

    /// Appends `value` to the list for `key`, creating it if absent.
    ///
    /// A JSON array value is concatenated element by element instead of
    /// being nested as a single entry.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        match value.into() {
            MetadataValue::Json(serde_json::Value::Array(items)) => {
                self.add_all(key, items.into_iter().map(MetadataValue::from_json));
            }
            single => self.add_all(key, std::iter::once(single)),
        }
    }

    /// Appends every value in `values` to the list for `key`.
    pub fn add_all<I>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = MetadataValue>,
    {
        let key = key.into();
        let mut values = values.into_iter().peekable();
        if values.peek().is_none() {
            return;
        }
        match self.position(&key) {
            Some(idx) => self.entries[idx].1.extend(values),
            None => self.entries.push((key, values.collect())),
        }
    }

    /// Deletes `key` and all its values. No-op if absent.
    pub fn remove(&mut self, key: &str) {
        if let Some(idx) = self.position(key) {
            self.entries.remove(idx);
        }
    }

    /// Returns every value stored under `key`, or an empty slice.
    #[must_use]
    pub fn get(&self, key: &str) -> &[MetadataValue] {
        match self.position(key) {
            Some(idx) => &self.entries[idx].1,
            None => &[],
        }
    }

    /// Returns the first value stored under `key`.
    #[must_use]
    pub fn get_first(&self, key: &str) -> Option<&MetadataValue> {
        self.get(key).first()
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterates `(key, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[MetadataValue])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every key.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Lossy projection: each key mapped to a copy of its first value.
    #[must_use]
    pub fn get_map(&self) -> HashMap<String, MetadataValue> {
        self.entries
            .iter()
            .filter_map(|(k, values)| values.first().map(|v| (k.clone(), v.deep_copy())))
            .collect()
    }

    /// Appends `other`'s values after this store's values, key by key.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            self.add_all(key.clone(), values.iter().cloned());
        }
    }

    /// Full, non-lossy JSON form: every key mapped to its value list.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|(k, values)| {
                (
                    k.clone(),
                    serde_json::Value::Array(values.iter().map(MetadataValue::to_json).collect()),
                )
            })
            .collect()
    }
}

impl Clone for Metadata {
    /// Deep copy: binary values get their own storage.
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(k, values)| (k.clone(), values.iter().map(MetadataValue::deep_copy).collect()))
                .collect(),
        }
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}
