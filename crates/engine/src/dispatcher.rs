// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatcher: owns the machine agents and routes everything.
//!
//! Submissions go to one agent at a time, advancing only when the
//! current agent's core budget is spent, so early (larger, running)
//! machines fill first. Kill requests, remote-pid reports, and failure
//! queries find the owning agent through the job table. Idle machines
//! are untagged and retired as status polls notice them.

use crate::catalog::{self, Discovery};
use crate::config::{ConfigError, DispatcherConfig};
use crate::machine::MachineAgent;
use crate::ownership;
use crate::sync_paths;
use flo_adapters::{CloudApi, RemoteExec, SlaveLauncher};
use flo_core::{start_stamp, Clock, InstanceId, JobStatus, OwnerClaim, SlaveJobId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// CaptureMock mode env var; `"0"` (replay) forces the local kill too.
const CAPTUREMOCK_MODE_VAR: &str = "CAPTUREMOCK_MODE";

/// Errors surfaced to the embedding queue system.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No more available machines to submit cloud jobs to - existing jobs have failed")]
    NoMachines,
}

/// Coordinator for slave submissions onto owned cloud instances.
pub struct Dispatcher {
    cloud: Arc<dyn CloudApi>,
    launcher: Arc<dyn SlaveLauncher>,
    claim: OwnerClaim,
    slave_program: String,
    sync_slave_code: bool,
    machines: Mutex<Vec<Arc<MachineAgent>>>,
    released: Mutex<Vec<Arc<MachineAgent>>>,
    next_machine: Mutex<usize>,
    capacity: u32,
    other_owners: Vec<String>,
    file_args: Mutex<Vec<String>>,
}

impl Dispatcher {
    /// Discover, negotiate ownership, and spawn one agent per owned
    /// instance. Cloud trouble yields a dispatcher with zero capacity
    /// rather than an error; only bad configuration fails.
    pub async fn new(
        config: DispatcherConfig,
        cloud: Arc<dyn CloudApi>,
        remote: Arc<dyn RemoteExec>,
        launcher: Arc<dyn SlaveLauncher>,
        clock: &impl Clock,
    ) -> Result<Self, ConfigError> {
        let user = config.resolve_user()?;
        let filters = config.parsed_filters()?;
        let claim = OwnerClaim::new(user, start_stamp(clock.epoch_ms()));

        let Discovery { instances, running } = catalog::discover(cloud.as_ref(), &filters).await;
        let mut owned = Vec::new();
        let mut other_owners = Vec::new();
        if !instances.is_empty() {
            let negotiation =
                ownership::take_ownership(cloud.as_ref(), &instances, config.max_capacity, &claim)
                    .await;
            owned = negotiation.owned;
            other_owners = negotiation.other_owners;
            if owned.is_empty() {
                tracing::error!(
                    candidates = instances.len(),
                    filters = %catalog::join_filters(&filters),
                    owners = %other_owners.join(", "),
                    "cannot run tests in the cloud: all matching instances are currently \
                     being used by other users"
                );
            }
        }

        let sync_dirs = sync_paths::dirs_to_mirror(&config);
        let dispatch_lock = Arc::new(tokio::sync::Mutex::new(()));
        let machines: Vec<Arc<MachineAgent>> = owned
            .iter()
            .map(|inst| {
                MachineAgent::new(
                    inst,
                    sync_dirs.clone(),
                    Arc::clone(&remote),
                    Arc::clone(&launcher),
                    Arc::clone(&dispatch_lock),
                    running.contains(&inst.id),
                )
            })
            .collect();
        let capacity = machines.iter().map(|m| m.core_budget()).sum();
        tracing::info!(machines = machines.len(), capacity, "dispatcher ready");

        Ok(Self {
            cloud,
            launcher,
            claim,
            slave_program: config.slave_program.clone(),
            sync_slave_code: config.sync_slave_code,
            machines: Mutex::new(machines),
            released: Mutex::new(Vec::new()),
            next_machine: Mutex::new(0),
            capacity,
            other_owners,
            file_args: Mutex::new(Vec::new()),
        })
    }

    /// Summed core budget of the initially owned machines. Stable: it
    /// does not shrink as machines are released.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Users found owning candidate instances during negotiation.
    pub fn other_owners(&self) -> &[String] {
        &self.other_owners
    }

    /// Slaves always execute on remote machines.
    pub fn slaves_on_remote_system(&self) -> bool {
        true
    }

    /// Active machine agents, in routing order.
    pub fn machines(&self) -> Vec<Arc<MachineAgent>> {
        self.machines.lock().clone()
    }

    /// Agents retired by earlier cleanup passes.
    pub fn released_machines(&self) -> Vec<Arc<MachineAgent>> {
        self.released.lock().clone()
    }

    /// Argv slaves run with: the local invocation when the local code
    /// is mirrored across, otherwise the central installation.
    pub fn slave_program_args(&self, own_args: &[String]) -> Vec<String> {
        if self.sync_slave_code {
            own_args.to_vec()
        } else {
            vec![self.slave_program.clone()]
        }
    }

    /// Route one submission to the current machine agent.
    pub async fn submit_slave_job(&self, cmd_args: &[String]) -> Result<SlaveJobId, DispatchError> {
        let machine = {
            let machines = self.machines.lock();
            let index = *self.next_machine.lock();
            machines.get(index).cloned()
        }
        .ok_or(DispatchError::NoMachines)?;

        let file_args = self.file_args(cmd_args);
        let job_id = machine.submit_slave(self.cloud.as_ref(), cmd_args, &file_args).await;
        if machine.is_full() {
            *self.next_machine.lock() += 1;
        }
        Ok(job_id)
    }

    /// The extra argv telling slaves where to synch result files back
    /// to. Parsed once from the first submission's `-servaddr` and
    /// reused for every job.
    fn file_args(&self, cmd_args: &[String]) -> Vec<String> {
        let mut cached = self.file_args.lock();
        if cached.is_empty() {
            match arg_value(cmd_args, "-servaddr").and_then(|addr| addr.split(':').next()) {
                Some(host) => {
                    *cached = vec![
                        "-slavefilesynch".to_string(),
                        format!("{}@{}", self.claim.user, host),
                    ];
                }
                None => {
                    tracing::warn!("no -servaddr argument; slaves cannot synch files back");
                }
            }
        }
        cached.clone()
    }

    fn machine_for(
        &self,
        job_id: &SlaveJobId,
        include_released: bool,
    ) -> Option<Arc<MachineAgent>> {
        if let Some(machine) = self.machines.lock().iter().find(|m| m.has_job(job_id)) {
            return Some(Arc::clone(machine));
        }
        if include_released {
            return self.released.lock().iter().find(|m| m.has_job(job_id)).cloned();
        }
        None
    }

    /// Record the pid the slave reported from the remote machine.
    pub fn set_remote_pid(&self, job_id: &SlaveJobId, remote_pid: u32) {
        if let Some(machine) = self.machine_for(job_id, false) {
            machine.set_remote_pid(job_id, remote_pid);
        }
    }

    /// The `user@ip` a job runs on, once known.
    pub fn remote_test_machine(&self, job_id: &SlaveJobId) -> Option<String> {
        self.machine_for(job_id, false).map(|m| m.remote_host().to_string())
    }

    /// Failure description for a job's machine, empty when healthy or
    /// unknown. Also searches released machines.
    pub fn job_failure_info(&self, job_id: &SlaveJobId) -> String {
        self.machine_for(job_id, true).map(|m| m.error_message()).unwrap_or_default()
    }

    /// Signal a job's remote process via its owning agent.
    pub async fn kill_remote_process(&self, job_id: &SlaveJobId) -> (bool, Option<u32>) {
        match self.machine_for(job_id, false) {
            Some(machine) => {
                machine.kill_remote_process(job_id, self.launcher.kill_signal()).await
            }
            None => (false, None),
        }
    }

    /// Kill one job. The remote process is signalled explicitly; the
    /// local helper is killed too when the remote kill did not land or
    /// CaptureMock replay is active.
    pub async fn kill_job(&self, job_id: &SlaveJobId) -> bool {
        let (killed, local_pid) = self.kill_remote_process(job_id).await;
        let replaying = std::env::var(CAPTUREMOCK_MODE_VAR).as_deref() == Ok("0");
        if let Some(local_pid) = local_pid {
            if !killed || replaying {
                return self.launcher.kill_local(local_pid).await;
            }
        }
        true
    }

    /// Aggregate job status: local process statuses annotated by each
    /// agent, then a release pass over idle machines.
    pub async fn status_for_all_jobs(&self) -> HashMap<SlaveJobId, JobStatus> {
        let proc_status = self.launcher.status_for_all().await;
        let mut out = HashMap::new();
        let machines = self.machines();
        for machine in &machines {
            machine.collect_job_status(&mut out, &proc_status);
        }
        // Try to release any machines we're not using
        self.cleanup(false).await;
        out
    }

    /// Release machines.
    ///
    /// Final cleanup untags every active machine unconditionally —
    /// processes might not be quite terminated, the surrounding
    /// shutdown path has dealt with them. A non-final pass retires only
    /// machines whose agents report themselves idle.
    ///
    /// Always returns `false`: submission happens in agent tasks, so
    /// "complete" is not a state the dispatcher can observe here.
    pub async fn cleanup(&self, final_cleanup: bool) -> bool {
        if final_cleanup {
            let ids: Vec<InstanceId> =
                self.machines.lock().iter().map(|m| m.id().clone()).collect();
            ownership::release_ownership(self.cloud.as_ref(), &ids).await;
        } else {
            let processes = self.launcher.processes();
            let machines = self.machines();
            let mut used = Vec::new();
            let mut unused = Vec::new();
            for machine in machines {
                if machine.cleanup(&processes) {
                    used.push(machine);
                } else {
                    unused.push(machine);
                }
            }
            if !unused.is_empty() {
                let ids: Vec<InstanceId> = unused.iter().map(|m| m.id().clone()).collect();
                tracing::info!(released = ids.len(), "releasing idle machines");
                ownership::release_ownership(self.cloud.as_ref(), &ids).await;
            }
            *self.machines.lock() = used;
            self.released.lock().extend(unused);
        }
        false
    }
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|arg| arg == flag).and_then(|i| args.get(i + 1)).map(String::as_str)
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
