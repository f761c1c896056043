//! The unit of storage exchanged with the host system.

use serde::Deserialize;
use serde::Serialize;

/// A single key-value entry.
///
/// Keys are user-visible strings; embedded `/` is interpreted as hierarchy.
/// Values are opaque bytes and survive a put/get round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

impl Entry {
    /// Create a new entry.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
