// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake collaborators for engine and integration tests.
//!
//! [`FakeCloud`] is a scriptable tag registry: tests can make a
//! competing dispatcher win a claim race, or delay tag visibility to
//! model the eventually-consistent registry the verification loop
//! exists for. [`FakeRemote`] records every call and can hold copies
//! open until the test resolves them. [`FakeLauncher`] hands out
//! sequential pids and tracks kills.

use crate::cloud::{CloudApi, CloudError};
use crate::launcher::{LaunchError, ProcessProbe, ProcessRegistry, SlaveLauncher, DEFAULT_KILL_SIGNAL};
use crate::remote::{CopyProcess, RemoteExec, RemoteExecError};
use async_trait::async_trait;
use flo_core::{Instance, InstanceHealth, InstanceId, JobStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ── FakeCloud ──────────────────────────────────────────────────────

/// Failure injected into every [`FakeCloud`] API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    /// The SDK cannot be loaded at all.
    Unavailable,
    /// The SDK loaded but credentials are rejected.
    Auth,
}

/// Scripted behavior for one instance's next ownership-tag write.
#[derive(Debug, Clone)]
pub enum TagOutcome {
    /// The write lands but stays invisible to the first `n` re-reads.
    Hidden(u32),
    /// A competing dispatcher's write wins; re-reads observe their value.
    Lost(String),
}

#[derive(Default)]
struct CloudState {
    instances: Vec<Instance>,
    health: HashMap<InstanceId, InstanceHealth>,
    outcomes: HashMap<InstanceId, TagOutcome>,
    /// (remaining invisible reads, tag name, pending value)
    hidden: HashMap<InstanceId, (u32, String, String)>,
    started: Vec<InstanceId>,
    removed_tags: Vec<(InstanceId, String)>,
    tag_writes: Vec<(InstanceId, String, String)>,
    failure: Option<FakeFailure>,
}

/// In-memory cloud API with a scriptable tag registry.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: Vec<Instance>) -> Self {
        let cloud = Self::new();
        cloud.state.lock().instances = instances;
        cloud
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state.lock().instances.push(instance);
    }

    pub fn set_health(&self, id: impl Into<InstanceId>, health: InstanceHealth) {
        self.state.lock().health.insert(id.into(), health);
    }

    /// Script the next ownership-tag write on `id`.
    pub fn set_tag_outcome(&self, id: impl Into<InstanceId>, outcome: TagOutcome) {
        self.state.lock().outcomes.insert(id.into(), outcome);
    }

    /// Make every API call fail from now on.
    pub fn fail_with(&self, failure: FakeFailure) {
        self.state.lock().failure = Some(failure);
    }

    /// Currently applied (visible) value of a tag.
    pub fn tag_value(&self, id: &InstanceId, name: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .instances
            .iter()
            .find(|inst| &inst.id == id)
            .and_then(|inst| inst.tags.get(name))
            .cloned()
    }

    /// Instances whose start was requested, in request order.
    pub fn started(&self) -> Vec<InstanceId> {
        self.state.lock().started.clone()
    }

    /// Recorded tag removals (repeats included).
    pub fn removed_tags(&self) -> Vec<(InstanceId, String)> {
        self.state.lock().removed_tags.clone()
    }

    /// Recorded tag writes, in order.
    pub fn tag_writes(&self) -> Vec<(InstanceId, String, String)> {
        self.state.lock().tag_writes.clone()
    }

    fn check_failure(state: &CloudState) -> Result<(), CloudError> {
        match state.failure {
            Some(FakeFailure::Unavailable) => {
                Err(CloudError::Unavailable("fake SDK not installed".to_string()))
            }
            Some(FakeFailure::Auth) => {
                Err(CloudError::Auth("fake credentials rejected".to_string()))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn list_instances(
        &self,
        ids: Option<&[InstanceId]>,
    ) -> Result<Vec<Instance>, CloudError> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;

        // Age delayed-visibility writes by one read, applying any that
        // have become visible.
        let matured: Vec<InstanceId> = state
            .hidden
            .iter_mut()
            .filter_map(|(id, entry)| {
                if entry.0 == 0 {
                    Some(id.clone())
                } else {
                    entry.0 -= 1;
                    None
                }
            })
            .collect();
        for id in matured {
            if let Some((_, name, value)) = state.hidden.remove(&id) {
                if let Some(inst) = state.instances.iter_mut().find(|inst| inst.id == id) {
                    inst.tags.insert(name, value);
                }
            }
        }

        Ok(state
            .instances
            .iter()
            .filter(|inst| ids.map(|ids| ids.contains(&inst.id)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn instance_health(
        &self,
        ids: &[InstanceId],
    ) -> Result<HashMap<InstanceId, InstanceHealth>, CloudError> {
        let state = self.state.lock();
        Self::check_failure(&state)?;
        Ok(state
            .health
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(id, health)| (id.clone(), *health))
            .collect())
    }

    async fn add_tag(&self, id: &InstanceId, name: &str, value: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state.tag_writes.push((id.clone(), name.to_string(), value.to_string()));
        match state.outcomes.remove(id) {
            Some(TagOutcome::Lost(winner)) => {
                if let Some(inst) = state.instances.iter_mut().find(|inst| &inst.id == id) {
                    inst.tags.insert(name.to_string(), winner);
                }
            }
            Some(TagOutcome::Hidden(reads)) => {
                state
                    .hidden
                    .insert(id.clone(), (reads, name.to_string(), value.to_string()));
            }
            None => {
                if let Some(inst) = state.instances.iter_mut().find(|inst| &inst.id == id) {
                    inst.tags.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(())
    }

    async fn remove_tag(&self, id: &InstanceId, name: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state.removed_tags.push((id.clone(), name.to_string()));
        state.hidden.remove(id);
        if let Some(inst) = state.instances.iter_mut().find(|inst| &inst.id == id) {
            inst.tags.remove(name);
        }
        Ok(())
    }

    async fn start_instance(&self, id: &InstanceId) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;
        state.started.push(id.clone());
        Ok(())
    }
}

// ── FakeRemote ─────────────────────────────────────────────────────

/// One recorded [`FakeRemote`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    EnsureDirs { host: String, dirs: Vec<PathBuf> },
    Copy { src: PathBuf, dst_dir: PathBuf, host: String },
    WrapArgs { host: String, agent_forwarding: bool },
    Run { host: String, args: Vec<String> },
}

struct PendingCopy {
    src: PathBuf,
    done: oneshot::Sender<Result<(), RemoteExecError>>,
    #[allow(dead_code)]
    cancel: CancellationToken,
}

/// Recording [`RemoteExec`] with scriptable copies.
#[derive(Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<RemoteCall>>,
    ensure_failure: Mutex<Option<String>>,
    manual_copies: Mutex<bool>,
    pending: Mutex<Vec<PendingCopy>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Make `ensure_remote_dirs` fail with the given detail.
    pub fn fail_ensure_dirs(&self, detail: impl Into<String>) {
        *self.ensure_failure.lock() = Some(detail.into());
    }

    /// Hold copies open until the test resolves them with
    /// [`FakeRemote::finish_next_copy`] (or aborts them).
    pub fn hold_copies(&self) {
        *self.manual_copies.lock() = true;
    }

    /// Number of copies currently held open.
    pub fn pending_copies(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve the oldest held copy.
    pub fn finish_next_copy(&self, result: Result<(), RemoteExecError>) {
        if !self.pending.lock().is_empty() {
            let pending = self.pending.lock().remove(0);
            let _ = pending.done.send(result);
        }
    }

    /// Source paths of copies currently held open.
    pub fn pending_sources(&self) -> Vec<PathBuf> {
        self.pending.lock().iter().map(|p| p.src.clone()).collect()
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    async fn ensure_remote_dirs(
        &self,
        host: &str,
        dirs: &[PathBuf],
    ) -> Result<(), RemoteExecError> {
        self.calls
            .lock()
            .push(RemoteCall::EnsureDirs { host: host.to_string(), dirs: dirs.to_vec() });
        if let Some(detail) = self.ensure_failure.lock().clone() {
            return Err(RemoteExecError::CommandFailed { host: host.to_string(), detail });
        }
        Ok(())
    }

    async fn copy_tree_process(
        &self,
        src: &Path,
        _src_host: &str,
        dst_dir: &Path,
        dst_host: &str,
    ) -> Result<CopyProcess, RemoteExecError> {
        self.calls.lock().push(RemoteCall::Copy {
            src: src.to_path_buf(),
            dst_dir: dst_dir.to_path_buf(),
            host: dst_host.to_string(),
        });
        let (process, done, cancel) = CopyProcess::scripted();
        if *self.manual_copies.lock() {
            self.pending.lock().push(PendingCopy { src: src.to_path_buf(), done, cancel });
        } else {
            let _ = done.send(Ok(()));
        }
        Ok(process)
    }

    fn command_args_on(
        &self,
        host: &str,
        args: &[String],
        agent_forwarding: bool,
    ) -> Vec<String> {
        self.calls
            .lock()
            .push(RemoteCall::WrapArgs { host: host.to_string(), agent_forwarding });
        let mut out = vec!["rsh".to_string()];
        if agent_forwarding {
            out.push("-A".to_string());
        }
        out.push(host.to_string());
        out.extend(args.iter().cloned());
        out
    }

    async fn run_command_on(&self, host: &str, args: &[String]) -> Result<(), RemoteExecError> {
        self.calls
            .lock()
            .push(RemoteCall::Run { host: host.to_string(), args: args.to_vec() });
        Ok(())
    }
}

// ── FakeLauncher ───────────────────────────────────────────────────

#[derive(Default)]
struct FakeProbe {
    exited: AtomicBool,
}

impl ProcessProbe for FakeProbe {
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Local queue system fake: sequential pids, recorded submissions and kills.
pub struct FakeLauncher {
    next_pid: Mutex<u32>,
    submissions: Mutex<Vec<Vec<String>>>,
    statuses: Mutex<HashMap<u32, JobStatus>>,
    killed: Mutex<Vec<u32>>,
    registry: ProcessRegistry,
    probes: Mutex<HashMap<u32, Arc<FakeProbe>>>,
    signal: i32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::with_first_pid(101)
    }

    pub fn with_first_pid(pid: u32) -> Self {
        Self {
            next_pid: Mutex::new(pid),
            submissions: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            killed: Mutex::new(Vec::new()),
            registry: ProcessRegistry::new(),
            probes: Mutex::new(HashMap::new()),
            signal: DEFAULT_KILL_SIGNAL,
        }
    }

    /// Recorded submission argv lines, in order.
    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.submissions.lock().clone()
    }

    /// Pids killed locally, in order.
    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().clone()
    }

    /// Script the status reported for a local pid.
    pub fn set_status(&self, pid: u32, status: JobStatus) {
        self.statuses.lock().insert(pid, status);
    }

    /// Mark a launched process as exited.
    pub fn finish(&self, pid: u32) {
        if let Some(probe) = self.probes.lock().get(&pid) {
            probe.exited.store(true, Ordering::SeqCst);
        }
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlaveLauncher for FakeLauncher {
    async fn submit_slave(&self, cmd_args: Vec<String>) -> Result<(u32, String), LaunchError> {
        let pid = {
            let mut next = self.next_pid.lock();
            let pid = *next;
            *next += 1;
            pid
        };
        self.submissions.lock().push(cmd_args);
        let probe = Arc::new(FakeProbe::default());
        self.registry.insert(pid, probe.clone());
        self.probes.lock().insert(pid, probe);
        Ok((pid, String::new()))
    }

    async fn kill_local(&self, local_pid: u32) -> bool {
        self.killed.lock().push(local_pid);
        self.finish(local_pid);
        true
    }

    async fn status_for_all(&self) -> HashMap<u32, JobStatus> {
        self.statuses.lock().clone()
    }

    fn processes(&self) -> ProcessRegistry {
        self.registry.clone()
    }

    fn kill_signal(&self) -> i32 {
        self.signal
    }
}
