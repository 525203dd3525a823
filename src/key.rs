//! Canonical request keys.
//!
//! A cacheable operation is identified by `{path, body, isErrorable}`. The
//! key is the canonical JSON serialization of that triple with object keys
//! sorted recursively, so structurally equal bodies produce the same key
//! regardless of field order and therefore share one cache entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The request triple a cache key is derived from.
///
/// `is_errorable` is part of the key: callers that tolerate errors must not
/// share an entry with callers that do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub path: String,
    pub body: Value,
    #[serde(default)]
    pub is_errorable: bool,
}

/// Canonical, order-independent identifier of a cacheable operation.
#[derive(Debug, Clone)]
pub struct RequestKey {
    request: Request,
    canonical: String,
}

impl RequestKey {
    pub fn new(path: &str, body: Value, is_errorable: bool) -> Self {
        let request = Request {
            path: path.to_string(),
            body,
            is_errorable,
        };
        let canonical = canonical_for(&request);
        Self { request, canonical }
    }

    /// Parse a key back from its canonical form, e.g. when rehydrating a
    /// serialized cache payload. Fails on malformed keys, which callers
    /// treat as a cache miss.
    pub fn from_canonical(key: &str) -> Result<Self, serde_json::Error> {
        let request: Request = serde_json::from_str(key)?;
        let canonical = canonical_for(&request);
        Ok(Self { request, canonical })
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn body(&self) -> &Value {
        &self.request.body
    }

    pub fn is_errorable(&self) -> bool {
        self.request.is_errorable
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RequestKey {}

impl std::hash::Hash for RequestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

fn canonical_for(request: &Request) -> String {
    let mut map = Map::new();
    map.insert("body".to_string(), request.body.clone());
    map.insert("isErrorable".to_string(), Value::Bool(request.is_errorable));
    map.insert("path".to_string(), Value::String(request.path.clone()));
    canonical_json(&Value::Object(map))
}

/// Serialize a value with all object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
