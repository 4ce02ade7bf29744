// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slave job identifiers, pid bookkeeping, and reported status.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of a slave job dispatched to a cloud instance.
///
/// Formatted as `job<index>_<privateIP>` where `<index>` counts jobs
/// already created on the owning machine agent, starting at 0. Unique
/// per agent, and globally unique because private IPs are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaveJobId(pub String);

impl SlaveJobId {
    /// Allocate the id for the `index`-th job on the machine at `ip`.
    pub fn allocate(index: usize, ip: &str) -> Self {
        Self(format!("job{index}_{ip}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlaveJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SlaveJobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SlaveJobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for SlaveJobId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SlaveJobId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl Borrow<str> for SlaveJobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Pid bookkeeping for one slave job.
///
/// Both pids start unset. The local pid is recorded when the agent's
/// worker finishes submitting; the remote pid arrives later, out of
/// band, once the slave reports it. Once set, neither is ever cleared —
/// the record persists until final cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub local_pid: Option<u32>,
    pub remote_pid: Option<u32>,
}

/// Reported status of a job: a short code plus a human-readable line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub abbrev: String,
    pub description: String,
}

impl JobStatus {
    pub fn new(abbrev: impl Into<String>, description: impl Into<String>) -> Self {
        Self { abbrev: abbrev.into(), description: description.into() }
    }

    /// Sentinel status for a job whose local pid is not yet known: the
    /// owning agent is still mirroring files to the remote host.
    pub fn synchronizing(host: &str) -> Self {
        Self::new("SYNCH", format!("Synchronizing data with {host}"))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.abbrev, self.description)
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
