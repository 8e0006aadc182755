//! Key functions: map an object to the stable string identifying it across watch events.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object is not a JSON map")]
    NotAnObject,
    #[error("{0}")]
    Other(String),
}

/// Strategy computing the queue key of an object.
///
/// Must be deterministic for the lifetime of the queue it is given to: two
/// events about the same logical object have to produce the same key.
pub trait KeyFunc<T>: Send + Sync {
    fn key_of(&self, obj: &T) -> Result<String, KeyError>;
}

impl<T, F> KeyFunc<T> for F
where
    F: Fn(&T) -> Result<String, KeyError> + Send + Sync,
{
    fn key_of(&self, obj: &T) -> Result<String, KeyError> {
        self(obj)
    }
}

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones.
pub fn meta_namespace_key(v: &serde_json::Value) -> Result<String, KeyError> {
    if !v.is_object() {
        return Err(KeyError::NotAnObject);
    }
    let meta = v.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .ok_or(KeyError::MissingName)?;
    match meta.and_then(|m| m.get("namespace")).and_then(|n| n.as_str()) {
        Some(ns) if !ns.is_empty() => Ok(format!("{}/{}", ns, name)),
        _ => Ok(name.to_string()),
    }
}

/// [`meta_namespace_key`] as a [`KeyFunc`] over raw JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaNamespaceKey;

impl KeyFunc<serde_json::Value> for MetaNamespaceKey {
    fn key_of(&self, obj: &serde_json::Value) -> Result<String, KeyError> {
        meta_namespace_key(obj)
    }
}
