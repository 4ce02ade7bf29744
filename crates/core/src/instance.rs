// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observed cloud instances and their core budgets.

use crate::tag::OWNERSHIP_TAG;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a cloud instance, as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Create a new InstanceId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value of this InstanceId.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq<str> for InstanceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for InstanceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Concurrent-job capacity per instance size class (the last dot-segment
/// of the instance type). Unknown size classes count as a single core.
const SIZE_CLASS_CORES: [(&str, u32); 6] = [
    ("8xlarge", 32),
    ("4xlarge", 16),
    ("2xlarge", 8),
    ("xlarge", 4),
    ("large", 2),
    ("medium", 1),
];

/// A cloud instance as observed through the cloud API.
///
/// Instances are discovered once at dispatcher startup; the tag mapping
/// is a snapshot and goes stale the moment another dispatcher writes a
/// claim. Ownership decisions therefore always re-read tags through the
/// cloud API rather than trusting this copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub private_ip: String,
    pub instance_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// The size class, e.g. `"2xlarge"` for instance type `"c4.2xlarge"`.
    pub fn size_class(&self) -> &str {
        self.instance_type.rsplit('.').next().unwrap_or("")
    }

    /// Concurrent-job budget for this instance.
    pub fn core_budget(&self) -> u32 {
        self.core_budget_or(1)
    }

    /// Core budget with an explicit fallback for unknown size classes.
    ///
    /// Discovery sorts unknown sizes to the back (`default` 0) while the
    /// ownership negotiator counts them as one core (`default` 1).
    pub fn core_budget_or(&self, default: u32) -> u32 {
        let class = self.size_class();
        SIZE_CLASS_CORES
            .iter()
            .find(|(name, _)| *name == class)
            .map(|(_, cores)| *cores)
            .unwrap_or(default)
    }

    /// Value of an arbitrary tag, if present.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Non-empty ownership tag value, if some dispatcher has claimed
    /// this instance.
    pub fn owner_value(&self) -> Option<&str> {
        self.tag(OWNERSHIP_TAG).filter(|v| !v.is_empty())
    }
}

/// Instance status as reported by the cloud status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceHealth {
    Ok,
    Initializing,
    Impaired,
    InsufficientData,
    NotApplicable,
}

impl InstanceHealth {
    /// Parse a cloud status string; anything unrecognized is reported
    /// as `not-applicable`.
    pub fn from_status(status: &str) -> Self {
        match status {
            "ok" => Self::Ok,
            "initializing" => Self::Initializing,
            "impaired" => Self::Impaired,
            "insufficient-data" => Self::InsufficientData,
            _ => Self::NotApplicable,
        }
    }

    /// Whether the instance counts as running for scheduling purposes.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Ok | Self::Initializing)
    }
}

crate::simple_display! {
    InstanceHealth {
        Ok => "ok",
        Initializing => "initializing",
        Impaired => "impaired",
        InsufficientData => "insufficient-data",
        NotApplicable => "not-applicable",
    }
}

crate::builder! {
    pub struct InstanceBuilder => Instance {
        into {
            id: InstanceId = "i-0000",
            private_ip: String = "10.0.0.1",
            instance_type: String = "m4.large",
        }
        set {
            tags: BTreeMap<String, String> = BTreeMap::new(),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl InstanceBuilder {
    /// Add a single tag.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
