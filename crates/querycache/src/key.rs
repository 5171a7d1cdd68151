use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::QueryError;

/// The key addressing one cached resource.
///
/// A key is built from any [`Serialize`] value: strings, tuples, vectors, or structs. It is
/// canonicalized into JSON with object fields sorted by name, so two keys that only differ in
/// field order address the same resource. That canonical JSON is the key's [`hash`](Self::hash),
/// and the [`QueryCache`](crate::QueryCache) is keyed by it.
///
/// Equality and [`std::hash::Hash`] go through the SHA-256 [`digest`](Self::digest) of the
/// canonical form.
#[derive(Clone, Eq)]
pub struct QueryKey {
    value: Arc<Value>,
    hash: Arc<str>,
    digest: [u8; 32],
}

impl QueryKey {
    /// Creates a key from any serializable value.
    ///
    /// # Errors
    ///
    /// Fails with [`QueryError::InvalidConfiguration`] if the value cannot be represented as
    /// JSON, for example a map with non-string keys.
    pub fn new<K: Serialize + ?Sized>(key: &K) -> Result<Self, QueryError> {
        let value = serde_json::to_value(key).map_err(|e| {
            QueryError::InvalidConfiguration(format!("query key is not serializable: {e}"))
        })?;
        Ok(Self::from_value(value))
    }

    /// Creates a key from an already built JSON value.
    pub fn from_value(value: Value) -> Self {
        let value = canonicalize(value);
        // `Value`'s `Display` never fails, and `Map` is ordered by key
        let hash: Arc<str> = value.to_string().into();
        let digest = Sha256::digest(hash.as_bytes()).into();
        Self {
            value: Arc::new(value),
            hash,
            digest,
        }
    }

    /// The canonical, order-independent string form of this key.
    pub fn hash(&self) -> &Arc<str> {
        &self.hash
    }

    /// The structured value of this key.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The SHA-256 digest over the canonical form.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// A short hex prefix of the digest, suitable for log lines.
    pub fn short_digest(&self) -> String {
        self.digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Whether `prefix` partially matches this key.
    ///
    /// Arrays match when `prefix` is an element-wise prefix, objects match when every field of
    /// `prefix` matches the same field of this key, and everything else matches on equality.
    /// So `["posts"]` matches `["posts", 1]`, and `{"id": 1}` matches `{"id": 1, "page": 2}`.
    pub fn matches_prefix(&self, prefix: &QueryKey) -> bool {
        partial_match(&self.value, &prefix.value)
    }
}

/// Sorts object fields recursively.
///
/// `serde_json::Map` is already ordered unless the `preserve_order` feature is enabled somewhere
/// in the dependency graph, in which case insertion order would leak into the hash.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.into_iter().collect();
            fields.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn partial_match(value: &Value, prefix: &Value) -> bool {
    match (value, prefix) {
        (Value::Array(items), Value::Array(prefix)) => {
            prefix.len() <= items.len()
                && items
                    .iter()
                    .zip(prefix)
                    .all(|(item, prefix)| partial_match(item, prefix))
        }
        (Value::Object(fields), Value::Object(prefix)) => prefix.iter().all(|(name, prefix)| {
            fields
                .get(name)
                .is_some_and(|field| partial_match(field, prefix))
        }),
        _ => value == prefix,
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl std::hash::Hash for QueryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&self.hash).finish()
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self::from_value(Value::String(key.to_owned()))
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self::from_value(Value::String(key))
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}
