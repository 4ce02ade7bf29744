// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seam to the local queue system that forks the ssh helper processes.
//!
//! The dispatcher never spawns slave helpers itself; it hands fully
//! wrapped argv lines to the embedding queue system and tracks the pids
//! it gets back. The queue system shares a read-only view of its process
//! table so idle-machine detection can tell exited helpers from live ones.

use async_trait::async_trait;
use flo_core::JobStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Default signal used for job termination (SIGTERM).
pub const DEFAULT_KILL_SIGNAL: i32 = 15;

/// Errors from local slave submission.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to launch slave process: {0}")]
    Spawn(String),
}

/// Pollable view of one launched local process.
pub trait ProcessProbe: Send + Sync {
    /// Whether the process has exited.
    fn has_exited(&self) -> bool;
}

/// Read-only shared view of the queue system's process table,
/// keyed by local pid.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<u32, Arc<dyn ProcessProbe>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: u32, probe: Arc<dyn ProcessProbe>) {
        self.inner.lock().insert(pid, probe);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.inner.lock().contains_key(&pid)
    }

    /// Present in the table and not yet exited.
    pub fn is_running(&self, pid: u32) -> bool {
        self.inner.lock().get(&pid).map(|probe| !probe.has_exited()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Operations the dispatcher needs from the local queue system.
#[async_trait]
pub trait SlaveLauncher: Send + Sync {
    /// Fork the local helper for one slave job. Returns the local pid
    /// and any stderr produced during submission.
    async fn submit_slave(&self, cmd_args: Vec<String>) -> Result<(u32, String), LaunchError>;

    /// Kill a locally tracked process. Returns whether a kill landed.
    async fn kill_local(&self, local_pid: u32) -> bool;

    /// Status of every locally tracked process, keyed by pid.
    async fn status_for_all(&self) -> HashMap<u32, JobStatus>;

    /// Read-only view of launched process handles.
    fn processes(&self) -> ProcessRegistry;

    /// Signal number delivered to jobs on termination.
    fn kill_signal(&self) -> i32 {
        DEFAULT_KILL_SIGNAL
    }
}

#[cfg(test)]
#[path = "launcher_tests.rs"]
mod tests;
