//! Blob metadata: a string map with case-insensitive keys that remembers the casing
//! each key was last written with, so responses echo it back unchanged.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{StorageError, StorageResult};

/// Request/response header namespace for caller metadata.
pub const META_HEADER_PREFIX: &str = "x-ms-meta-";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    // lowercased key -> (original key, value)
    entries: BTreeMap<String, (String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced key adopts the new casing.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        self.entries
            .insert(key.to_lowercase(), (key, value.into()))
            .map(|(_, old)| old)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_lowercase()).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as (original key, value).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into self; keys in `other` win.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Collect every `x-ms-meta-*` header with the prefix stripped. Repeated headers
    /// are joined with ", " as HTTP list semantics dictate. Values must be UTF-8;
    /// anything else is rejected rather than rewritten.
    pub fn from_headers(headers: &HeaderMap) -> StorageResult<Self> {
        let mut out = Metadata::new();
        for name in headers.keys() {
            let Some(key) = name.as_str().strip_prefix(META_HEADER_PREFIX) else { continue };
            if key.is_empty() {
                continue;
            }
            let values = headers
                .get_all(name)
                .iter()
                .map(|v| {
                    std::str::from_utf8(v.as_bytes())
                        .map_err(|_| StorageError::InvalidMetadata(format!("{} is not valid UTF-8", name)))
                })
                .collect::<StorageResult<Vec<_>>>()?;
            out.insert(key, values.join(", "));
        }
        Ok(out)
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut out = Metadata::new();
        for (k, v) in raw {
            out.insert(k, v);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn keys_are_case_insensitive_and_case_preserving() {
        let mut m = Metadata::new();
        m.insert("Author", "alice");
        assert_eq!(m.get("author"), Some("alice"));
        assert!(m.contains_key("AUTHOR"));
        let old = m.insert("AUTHOR", "bob");
        assert_eq!(old.as_deref(), Some("alice"));
        assert_eq!(m.len(), 1);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![("AUTHOR", "bob")]);
        assert_eq!(m.remove("author").as_deref(), Some("bob"));
        assert!(m.is_empty());
    }

    #[test]
    fn merge_overrides_and_keeps_unmentioned() {
        let mut base = Metadata::new();
        base.insert("a", "1");
        base.insert("b", "2");
        let mut update = Metadata::new();
        update.insert("B", "20");
        update.insert("c", "3");
        base.merge(&update);
        assert_eq!(base.get("a"), Some("1"));
        assert_eq!(base.get("b"), Some("20"));
        assert_eq!(base.get("c"), Some("3"));
    }

    #[test]
    fn headers_with_prefix_are_collected() {
        let mut h = HeaderMap::new();
        h.insert("x-ms-meta-roles", HeaderValue::from_static("HR,Manager"));
        h.insert("x-ms-meta-project", HeaderValue::from_static("apollo"));
        h.append("x-ms-meta-tag", HeaderValue::from_static("a"));
        h.append("x-ms-meta-tag", HeaderValue::from_static("b"));
        h.insert("x-ms-meta-", HeaderValue::from_static("ignored"));
        h.insert("content-type", HeaderValue::from_static("text/plain"));
        let m = Metadata::from_headers(&h).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.get("roles"), Some("HR,Manager"));
        assert_eq!(m.get("project"), Some("apollo"));
        assert_eq!(m.get("tag"), Some("a, b"));
    }

    #[test]
    fn non_utf8_header_values_are_rejected() {
        let mut h = HeaderMap::new();
        h.insert("x-ms-meta-project", HeaderValue::from_static("apollo"));
        h.insert("x-ms-meta-label", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        let err = Metadata::from_headers(&h).unwrap_err();
        assert!(matches!(err, StorageError::InvalidMetadata(ref m) if m.contains("x-ms-meta-label")));
    }

    #[test]
    fn json_form_preserves_original_keys() {
        let mut m = Metadata::new();
        m.insert("fileName", "f.txt");
        m.insert("createdBy", "alice");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"fileName\":\"f.txt\""));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.get("FILENAME"), Some("f.txt"));
    }
}
