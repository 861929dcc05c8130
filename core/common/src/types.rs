//! Common types used throughout Satchel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned content version. Monotonically increasing per content
/// item; assigned at publish time and never reused.
pub type Version = u64;

/// Opaque stable identifier for a content item.
///
/// Doubles as the key component for package blobs, so separators are
/// rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Create a new ContentId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    /// - `id` must not contain path separators
    ///
    /// # Errors
    /// - Returns error if id is empty or contains a separator
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ContentId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "ContentId cannot contain separators".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
