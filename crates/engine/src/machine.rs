// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-instance worker.
//!
//! One `MachineAgent` owns every remote side-effect on one cloud
//! instance: starting it if needed, mirroring the working tree to it,
//! then serving an inbox of slave submissions. A single worker task per
//! agent keeps submissions FIFO; pid bookkeeping is shared with the
//! dispatcher under a per-agent mutex.
//!
//! The agent never holds a cloud handle. The one cloud call in its
//! lifecycle — the initial start request — happens inline in
//! [`MachineAgent::submit_slave`], in dispatcher context, after which
//! the start action degrades to an ssh port probe the worker runs itself.

use flo_adapters::{
    CloudApi, CopyAborter, ProcessRegistry, RemoteExec, RemoteExecError, SlaveLauncher,
};
use flo_core::{Instance, InstanceId, JobRecord, JobStatus, SlaveJobId};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Remote login user on slave instances.
pub const REMOTE_USER: &str = "ec2-user";

/// Attempts (one per second) to observe a remote pid before a kill
/// gives up and falls back to the local process.
const REMOTE_PID_ATTEMPTS: u32 = 10;
const REMOTE_PID_PAUSE: Duration = Duration::from_secs(1);

/// Port probes before giving up on a freshly started instance.
const SSH_PROBE_ATTEMPTS: u32 = 1000;
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const SSH_RETRY_PAUSE: Duration = Duration::from_secs(1);

fn ssh_port() -> u16 {
    std::env::var("FLO_SSH_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(22)
}

/// What happens before the worker may use the instance. The cloud start
/// request runs once, inline in dispatcher context; every start after
/// that is just waiting for sshd to answer.
enum StartAction {
    StartInstance,
    WaitForSsh,
}

/// `None` is the shutdown sentinel.
type InboxMessage = Option<(SlaveJobId, Vec<String>)>;

/// Worker for one owned cloud instance.
pub struct MachineAgent {
    id: InstanceId,
    ip: String,
    remote_host: String,
    core_budget: u32,
    sync_dirs: Vec<PathBuf>,
    remote: Arc<dyn RemoteExec>,
    launcher: Arc<dyn SlaveLauncher>,
    /// Dispatcher-wide lock serializing slave dispatch across agents.
    dispatch_lock: Arc<tokio::sync::Mutex<()>>,
    /// Ordered job table; entries are inserted at submission and never
    /// removed before final cleanup.
    jobs: Mutex<IndexMap<SlaveJobId, JobRecord>>,
    inbox_tx: mpsc::UnboundedSender<InboxMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<InboxMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    error_message: Mutex<String>,
    start_action: Mutex<Option<StartAction>>,
    /// Abort handle for an in-flight synch copy.
    sync_abort: Mutex<Option<CopyAborter>>,
}

impl MachineAgent {
    pub fn new(
        instance: &Instance,
        sync_dirs: Vec<PathBuf>,
        remote: Arc<dyn RemoteExec>,
        launcher: Arc<dyn SlaveLauncher>,
        dispatch_lock: Arc<tokio::sync::Mutex<()>>,
        already_running: bool,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: instance.id.clone(),
            ip: instance.private_ip.clone(),
            remote_host: format!("{REMOTE_USER}@{}", instance.private_ip),
            core_budget: instance.core_budget(),
            sync_dirs,
            remote,
            launcher,
            dispatch_lock,
            jobs: Mutex::new(IndexMap::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            worker: Mutex::new(None),
            error_message: Mutex::new(String::new()),
            start_action: Mutex::new(if already_running {
                None
            } else {
                Some(StartAction::StartInstance)
            }),
            sync_abort: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The `user@ip` this agent executes on.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn core_budget(&self) -> u32 {
        self.core_budget
    }

    /// Non-empty once the agent has failed; it accepts no further work
    /// and its jobs are considered failed.
    pub fn error_message(&self) -> String {
        self.error_message.lock().clone()
    }

    pub fn has_job(&self, job_id: &SlaveJobId) -> bool {
        self.jobs.lock().contains_key(job_id)
    }

    /// Current pid bookkeeping for a job.
    pub fn job_record(&self, job_id: &SlaveJobId) -> Option<JobRecord> {
        self.jobs.lock().get(job_id).copied()
    }

    /// Whether the job table has reached this instance's core budget.
    pub fn is_full(&self) -> bool {
        self.jobs.lock().len() >= self.core_budget as usize
    }

    fn worker_alive(&self) -> bool {
        self.worker.lock().as_ref().map(|handle| !handle.is_finished()).unwrap_or(false)
    }

    /// Accept one slave submission.
    ///
    /// Reserves the job entry synchronously — `has_job`/`is_full`
    /// observe it before this call returns — starts the instance and
    /// the worker on first use, and enqueues the wrapped argv. The one
    /// cloud call happens here, in the caller's (dispatcher) context,
    /// never in the worker.
    pub async fn submit_slave(
        self: &Arc<Self>,
        cloud: &dyn CloudApi,
        cmd_args: &[String],
        file_args: &[String],
    ) -> SlaveJobId {
        let job_id = {
            let mut jobs = self.jobs.lock();
            let job_id = SlaveJobId::allocate(jobs.len(), &self.ip);
            jobs.insert(job_id.clone(), JobRecord::default());
            job_id
        };

        if !self.worker_alive() {
            if matches!(*self.start_action.lock(), Some(StartAction::StartInstance)) {
                tracing::info!(ip = %self.ip, "starting cloud instance");
                if let Err(e) = cloud.start_instance(&self.id).await {
                    tracing::warn!(ip = %self.ip, error = %e, "instance start request failed");
                }
                *self.start_action.lock() = Some(StartAction::WaitForSsh);
            }
            self.spawn_worker();
        }

        let mut remote_args = self.remote.command_args_on(&self.remote_host, cmd_args, true);
        remote_args.extend(file_args.iter().cloned());
        if self.inbox_tx.send(Some((job_id.clone(), remote_args))).is_err() {
            tracing::warn!(ip = %self.ip, job = %job_id, "worker gone, submission dropped");
        }
        job_id
    }

    fn spawn_worker(self: &Arc<Self>) {
        let Some(inbox) = self.inbox_rx.lock().take() else { return };
        let agent = Arc::clone(self);
        *self.worker.lock() = Some(tokio::spawn(agent.run_worker(inbox)));
    }

    pub fn set_local_pid(&self, job_id: &SlaveJobId, local_pid: u32) {
        self.jobs.lock().entry(job_id.clone()).or_default().local_pid = Some(local_pid);
        tracing::info!(job = %job_id, local_pid, "job got local pid");
    }

    pub fn set_remote_pid(&self, job_id: &SlaveJobId, remote_pid: u32) {
        if let Some(record) = self.jobs.lock().get_mut(job_id) {
            record.remote_pid = Some(remote_pid);
        }
        tracing::info!(job = %job_id, remote_pid, "job got remote pid");
    }

    /// Terminate one job's remote process.
    ///
    /// During file synch there is no remote process yet: the synch copy
    /// itself is torn down and the whole agent is failed. Otherwise the
    /// remote pid is awaited briefly and signalled explicitly, because
    /// ssh does not forward signals; python can be assumed on the
    /// remote side, not much else.
    ///
    /// Returns whether the remote kill landed, plus the local pid for
    /// the caller's bookkeeping (or fallback kill).
    pub async fn kill_remote_process(
        &self,
        job_id: &SlaveJobId,
        signal: i32,
    ) -> (bool, Option<u32>) {
        let sync_abort = self.sync_abort.lock().clone();
        if let Some(abort) = sync_abort {
            *self.error_message.lock() = "Terminated test during file synchronisation".to_string();
            abort.terminate();
            return (true, None);
        }

        let (local_pid, remote_pid) = self.wait_for_remote_pid(job_id).await;
        if let Some(remote_pid) = remote_pid {
            let cmd_args = vec![
                "python".to_string(),
                "-c".to_string(),
                format!("import os; os.kill({remote_pid}, {signal})"),
            ];
            if let Err(e) = self.remote.run_command_on(&self.remote_host, &cmd_args).await {
                tracing::warn!(job = %job_id, error = %e, "remote kill command failed");
            }
            (true, local_pid)
        } else {
            (false, local_pid)
        }
    }

    /// Poll for a job's remote pid. The remote process may exist but
    /// not have reported its pid yet, so wait a bit and try again.
    async fn wait_for_remote_pid(&self, job_id: &SlaveJobId) -> (Option<u32>, Option<u32>) {
        for _ in 0..REMOTE_PID_ATTEMPTS {
            let record = self.job_record(job_id).unwrap_or_default();
            if record.remote_pid.is_some() {
                return (record.local_pid, record.remote_pid);
            }
            tokio::time::sleep(REMOTE_PID_PAUSE).await;
        }
        let record = self.job_record(job_id).unwrap_or_default();
        (record.local_pid, None)
    }

    /// Report status for this agent's jobs. Jobs without a local pid
    /// are still in the synch phase; jobs whose pid the local process
    /// table no longer reports are left out. A failed agent reports
    /// nothing.
    pub fn collect_job_status(
        &self,
        out: &mut HashMap<SlaveJobId, JobStatus>,
        proc_status: &HashMap<u32, JobStatus>,
    ) {
        if !self.error_message.lock().is_empty() {
            return;
        }
        for (job_id, record) in self.jobs.lock().iter() {
            match record.local_pid {
                Some(pid) => {
                    if let Some(status) = proc_status.get(&pid) {
                        out.insert(job_id.clone(), status.clone());
                    }
                }
                None => {
                    out.insert(job_id.clone(), JobStatus::synchronizing(&self.remote_host));
                }
            }
        }
    }

    /// Whether this agent still uses its machine in some way — worker
    /// running, or any of its local processes not yet exited. A live
    /// worker is asked to drain and exit via the sentinel.
    pub fn cleanup(&self, processes: &ProcessRegistry) -> bool {
        if self.worker_alive() {
            let _ = self.inbox_tx.send(None);
            return true;
        }
        self.jobs
            .lock()
            .values()
            .any(|record| record.local_pid.map(|pid| processes.is_running(pid)).unwrap_or(false))
    }

    // ── Worker task ────────────────────────────────────────────────

    async fn run_worker(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<InboxMessage>) {
        if matches!(*self.start_action.lock(), Some(StartAction::WaitForSsh)) {
            self.wait_for_ssh().await;
        }

        tracing::info!(ip = %self.ip, "synchronising files with instance");
        if let Err(e) = self.synchronise().await {
            let mut message = self.error_message.lock();
            if message.is_empty() {
                *message = format!(
                    "Failed to synchronise files with cloud instance with private IP address \
                     '{}'\nIntended usage is to start an ssh-agent, and add the keypair for \
                     this instance to it, in your shell before starting the dispatcher from \
                     it.\n\n({e})\n",
                    self.ip
                );
            }
        }
        if !self.error_message.lock().is_empty() {
            return;
        }

        loop {
            tracing::debug!(ip = %self.ip, "waiting for new job");
            let Some(Some((job_id, remote_args))) = inbox.recv().await else {
                tracing::info!(ip = %self.ip, "no more jobs, worker exiting");
                return;
            };
            tracing::debug!(ip = %self.ip, job = %job_id, "got job");
            let submitted = {
                let _guard = self.dispatch_lock.lock().await;
                self.launcher.submit_slave(remote_args).await
            };
            match submitted {
                Ok((local_pid, _stderr)) => self.set_local_pid(&job_id, local_pid),
                Err(e) => {
                    tracing::error!(ip = %self.ip, job = %job_id, error = %e, "slave submission failed");
                }
            }
        }
    }

    /// Probe the instance's ssh port until it answers. A probe that
    /// merely timed out retries immediately; other failures (host still
    /// booting, connection refused) pause first.
    async fn wait_for_ssh(&self) {
        let port = ssh_port();
        tracing::info!(ip = %self.ip, "waiting for response to ssh");
        for _ in 0..SSH_PROBE_ATTEMPTS {
            let probe =
                tokio::time::timeout(SSH_PROBE_TIMEOUT, TcpStream::connect((self.ip.as_str(), port)))
                    .await;
            match probe {
                Ok(Ok(_)) => return,
                Err(_) => {}
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Ok(Err(_)) => tokio::time::sleep(SSH_RETRY_PAUSE).await,
            }
        }
        tracing::warn!(ip = %self.ip, "instance never answered on the ssh port");
    }

    async fn synchronise(&self) -> Result<(), RemoteExecError> {
        let parents = parent_dirs(&self.sync_dirs);
        self.remote.ensure_remote_dirs(&self.remote_host, &parents).await?;
        for dir in &self.sync_dirs {
            if !self.error_message.lock().is_empty() {
                break;
            }
            self.synchronise_path(dir).await?;
        }
        Ok(())
    }

    async fn synchronise_path(&self, path: &Path) -> Result<(), RemoteExecError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        let process = {
            let _guard = self.dispatch_lock.lock().await;
            let process =
                self.remote.copy_tree_process(path, "localhost", parent, &self.remote_host).await?;
            *self.sync_abort.lock() = Some(process.aborter());
            process
        };
        let result = process.wait().await;
        *self.sync_abort.lock() = None;
        if let Err(e) = result {
            // A copy torn down by the kill path already failed the
            // agent; keep that message.
            if self.error_message.lock().is_empty() {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Parent directories of the mirrored set, deduplicated in order.
/// These are created on the remote host before any copy runs.
fn parent_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut parents = Vec::new();
    for dir in dirs {
        let parent = dir.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
    parents
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
