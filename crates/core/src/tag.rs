// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance tag conventions: resource filters and the ownership claim.
//!
//! The cloud registry offers no locking primitive, so exclusive use of
//! an instance is negotiated through a single well-known tag. Presence
//! of the tag means some dispatcher considers the instance claimed;
//! absence means free. The value identifies the claimant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The reserved tag name used as the distributed claim marker.
pub const OWNERSHIP_TAG: &str = "TextTest user";

/// An ownership claim: `<user>_<start_stamp>`.
///
/// The prefix before the first underscore identifies the owning user;
/// the suffix is the claiming dispatcher's start time, which makes
/// claims from successive runs of the same user distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerClaim {
    pub user: String,
    pub stamp: String,
}

impl OwnerClaim {
    pub fn new(user: impl Into<String>, stamp: impl Into<String>) -> Self {
        Self { user: user.into(), stamp: stamp.into() }
    }

    /// The tag value written to claimed instances.
    pub fn value(&self) -> String {
        format!("{}_{}", self.user, self.stamp)
    }

    /// Extract the owning user from a tag value written by any dispatcher.
    pub fn user_of(value: &str) -> &str {
        value.split('_').next().unwrap_or(value)
    }
}

impl fmt::Display for OwnerClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.user, self.stamp)
    }
}

/// Error raised for malformed resource filter strings.
#[derive(Debug, Error)]
pub enum TagFilterError {
    #[error("invalid glob in resource filter '{filter}': {reason}")]
    BadGlob { filter: String, reason: String },
}

/// One resource filter from the `queue_system_resource` config value.
///
/// `NAME` selects instances whose tag `NAME` has the value `1`;
/// `NAME=GLOB` matches the tag value against a shell-style glob.
/// A missing tag matches as the empty string.
#[derive(Debug, Clone)]
pub struct TagFilter {
    name: String,
    pattern: glob::Pattern,
    raw: String,
}

impl TagFilter {
    pub fn parse(raw: &str) -> Result<Self, TagFilterError> {
        let (name, value) = match raw.split_once('=') {
            Some((name, value)) => (name, value),
            None => (raw, "1"),
        };
        let pattern = glob::Pattern::new(value).map_err(|e| TagFilterError::BadGlob {
            filter: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { name: name.to_string(), pattern, raw: raw.to_string() })
    }

    /// Whether an instance's tag mapping satisfies this filter.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        let value = tags.get(&self.name).map(String::as_str).unwrap_or("");
        self.pattern.matches(value)
    }

    /// The filter as configured, for diagnostics.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
#[path = "tag_tests.rs"]
mod tests;
