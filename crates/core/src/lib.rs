//! evq core types: watch event kinds, the watch wire record and key functions.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod key;

pub use key::{meta_namespace_key, KeyError, KeyFunc, MetaNamespaceKey};

/// Kind of change reported by a watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a Kubernetes watch response body: `{"type":"ADDED","object":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub object: T,
}

pub mod prelude {
    pub use super::{meta_namespace_key, EventType, KeyError, KeyFunc, MetaNamespaceKey, WatchEvent};
}
