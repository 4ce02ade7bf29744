// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for dispatcher specs.

pub use flo_adapters::{FakeCloud, FakeLauncher, FakeRemote, TagOutcome};
pub use flo_core::{FakeClock, Instance, InstanceHealth, JobStatus, OWNERSHIP_TAG};
pub use flo_engine::{DispatchError, Dispatcher, DispatcherConfig};
pub use std::sync::Arc;
pub use std::time::Duration;

/// A candidate instance tagged to match the default resource filter.
pub fn instance(id: &str, ip: &str, instance_type: &str) -> Instance {
    Instance::builder()
        .id(id)
        .private_ip(ip)
        .instance_type(instance_type)
        .tag("texttest", "1")
        .build()
}

/// A typical slave submission argv carrying the dispatcher address.
pub fn servaddr_args() -> Vec<String> {
    ["texttest", "-servaddr", "192.168.0.5:8765"].iter().map(|s| s.to_string()).collect()
}

/// Fake collaborators plus the config defaults the specs use.
pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub remote: Arc<FakeRemote>,
    pub launcher: Arc<FakeLauncher>,
    pub clock: FakeClock,
}

impl Harness {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            cloud: Arc::new(FakeCloud::with_instances(instances)),
            remote: Arc::new(FakeRemote::new()),
            launcher: Arc::new(FakeLauncher::with_first_pid(111)),
            clock: FakeClock::new(),
        }
    }

    pub fn mark_running(&self, ids: &[&str]) {
        for id in ids {
            self.cloud.set_health(*id, InstanceHealth::Ok);
        }
    }

    pub async fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_with_capacity(4).await
    }

    pub async fn dispatcher_with_capacity(&self, max_capacity: u32) -> Dispatcher {
        let config = DispatcherConfig::builder()
            .resource_filters(vec!["texttest".to_string()])
            .max_capacity(max_capacity)
            .user("tester")
            .build();
        Dispatcher::new(
            config,
            self.cloud.clone(),
            self.remote.clone(),
            self.launcher.clone(),
            &self.clock,
        )
        .await
        .expect("dispatcher construction")
    }
}

/// Poll until `cond` holds; panics after a bounded number of passes.
/// Under a paused tokio clock the sleeps auto-advance.
pub async fn wait_for(desc: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {desc}");
}

/// Wait until a job has its local pid recorded on the given dispatcher.
pub async fn wait_for_local_pid(dispatcher: &Dispatcher, job_id: &flo_core::SlaveJobId) {
    let machines = dispatcher.machines();
    let agent = machines
        .iter()
        .find(|m| m.has_job(job_id))
        .expect("job must be routed to a machine")
        .clone();
    let id = job_id.clone();
    wait_for("local pid", move || {
        agent.job_record(&id).map(|r| r.local_pid.is_some()).unwrap_or(false)
    })
    .await;
}
