//! Type-safe identifier newtypes for Wharf.
//!
//! A [`ServiceId`] names one proxied service. Every replica of the same
//! logical service derives the same identifier, which is what lets the
//! service table count upstreams per service instead of per container.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for an ingress target.
///
/// Derived from the logical service name, so container replicas of one
/// service share the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Wrap an already-normalized identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier for a logical service name.
    ///
    /// The name is lowercased and every run of characters outside
    /// `[a-z0-9_]` collapses into a single `-`, with leading and trailing
    /// separators trimmed.
    pub fn derive(name: &str) -> Self {
        let mut id = String::with_capacity(name.len());
        let mut pending_dash = false;
        for c in name.chars().flat_map(char::to_lowercase) {
            if c.is_ascii_alphanumeric() || c == '_' {
                if pending_dash && !id.is_empty() {
                    id.push('-');
                }
                pending_dash = false;
                id.push(c);
            } else {
                pending_dash = true;
            }
        }
        Self(id)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
