// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Owner identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of the user or team an instance is allocated to.
///
/// Owners are compared by exact string equality only. Numeric identities from
/// the session provider must be rendered to their canonical decimal form
/// before they reach this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for OwnerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_owner_renders_canonically() {
        assert_eq!(OwnerId::from(42u64), OwnerId::from("42"));
    }

    #[test]
    fn test_no_lenient_comparison() {
        assert_ne!(OwnerId::from("042"), OwnerId::from(42u64));
        assert_ne!(OwnerId::from(" 42"), OwnerId::from("42"));
    }
}
