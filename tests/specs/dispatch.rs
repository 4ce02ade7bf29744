// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Submission, status, and kill specs through a full dispatcher.

use crate::prelude::*;
use flo_adapters::RemoteCall;
use serial_test::serial;

fn single_large() -> Harness {
    let harness = Harness::new(vec![instance("i-a", "10.0.0.1", "m4.large")]);
    harness.mark_running(&["i-a"]);
    harness
}

#[tokio::test(start_paused = true)]
async fn submit_report_and_kill_a_running_job() {
    // S4: local pid 111 and remote pid 222 are reported, then the kill
    // signals the remote process explicitly over ssh.
    let harness = single_large();
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    assert_eq!(job_id.as_str(), "job0_10.0.0.1");
    wait_for_local_pid(&dispatcher, &job_id).await;
    dispatcher.set_remote_pid(&job_id, 222);
    assert_eq!(dispatcher.remote_test_machine(&job_id).as_deref(), Some("ec2-user@10.0.0.1"));

    let (killed, local_pid) = dispatcher.kill_remote_process(&job_id).await;

    assert!(killed);
    assert_eq!(local_pid, Some(111));
    let kill_call = RemoteCall::Run {
        host: "ec2-user@10.0.0.1".to_string(),
        args: ["python", "-c", "import os; os.kill(222, 15)"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    assert!(harness.remote.calls().contains(&kill_call));
    assert!(harness.launcher.killed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn kill_before_remote_pid_waits_then_kills_locally() {
    // S5: the remote pid never arrives; after the ten-second wait the
    // dispatcher falls back to killing the local helper.
    let harness = single_large();
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    wait_for_local_pid(&dispatcher, &job_id).await;

    let started = tokio::time::Instant::now();
    assert!(dispatcher.kill_job(&job_id).await);

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(harness.launcher.killed(), [111]);
}

#[tokio::test(start_paused = true)]
async fn full_agent_rolls_submissions_to_the_next_machine() {
    // S6: an agent with two cores takes two jobs; the third advances to
    // the next machine.
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-b", "10.0.0.2", "m4.large"),
    ]);
    harness.mark_running(&["i-a", "i-b"]);
    let dispatcher = harness.dispatcher().await;

    let ids = [
        dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission"),
        dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission"),
        dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission"),
    ];

    assert_eq!(ids[0].as_str(), "job0_10.0.0.1");
    assert_eq!(ids[1].as_str(), "job1_10.0.0.1");
    assert_eq!(ids[2].as_str(), "job0_10.0.0.2");

    // Job ids are unique across the whole run.
    let unique: std::collections::HashSet<&str> = ids.iter().map(|id| id.as_str()).collect();
    assert_eq!(unique.len(), ids.len());
}

#[tokio::test(start_paused = true)]
async fn jobs_report_the_synch_sentinel_until_submitted() {
    let harness = single_large();
    harness.remote.hold_copies();
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    wait_for("copy in flight", || harness.remote.pending_copies() > 0).await;

    let status = dispatcher.status_for_all_jobs().await;
    assert_eq!(
        status.get(&job_id),
        Some(&JobStatus::new("SYNCH", "Synchronizing data with ec2-user@10.0.0.1"))
    );

    harness.remote.finish_next_copy(Ok(()));
    wait_for_local_pid(&dispatcher, &job_id).await;
    harness.launcher.set_status(111, JobStatus::new("RUN", "running remotely"));

    let status = dispatcher.status_for_all_jobs().await;
    assert_eq!(status.get(&job_id), Some(&JobStatus::new("RUN", "running remotely")));
}

#[tokio::test(start_paused = true)]
async fn kill_during_synchronisation_fails_the_machine() {
    // A kill while the working tree is still copying terminates the
    // copy, fails the agent, and surfaces through the failure info.
    let harness = single_large();
    harness.remote.hold_copies();
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    wait_for("copy in flight", || harness.remote.pending_copies() > 0).await;

    let (killed, local_pid) = dispatcher.kill_remote_process(&job_id).await;

    assert!(killed);
    assert_eq!(local_pid, None);
    assert_eq!(
        dispatcher.job_failure_info(&job_id),
        "Terminated test during file synchronisation"
    );
    let status = dispatcher.status_for_all_jobs().await;
    assert!(status.is_empty());
}

#[tokio::test(start_paused = true)]
async fn released_machines_lose_their_tags_but_keep_their_history() {
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-b", "10.0.0.2", "m4.large"),
    ]);
    harness.mark_running(&["i-a", "i-b"]);
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    wait_for_local_pid(&dispatcher, &job_id).await;

    // The unused second machine is released by the status poll.
    dispatcher.status_for_all_jobs().await;
    assert_eq!(dispatcher.machines().len(), 1);
    assert_eq!(dispatcher.released_machines().len(), 1);
    assert_eq!(harness.cloud.tag_value(&"i-b".into(), OWNERSHIP_TAG), None);

    // The active machine keeps its claim until final cleanup.
    assert!(harness.cloud.tag_value(&"i-a".into(), OWNERSHIP_TAG).is_some());
    dispatcher.cleanup(true).await;
    assert_eq!(harness.cloud.tag_value(&"i-a".into(), OWNERSHIP_TAG), None);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn capturemock_replay_kills_locally_as_well() {
    std::env::set_var("CAPTUREMOCK_MODE", "0");
    let harness = single_large();
    let dispatcher = harness.dispatcher().await;

    let job_id = dispatcher.submit_slave_job(&servaddr_args()).await.expect("submission");
    wait_for_local_pid(&dispatcher, &job_id).await;
    dispatcher.set_remote_pid(&job_id, 222);

    assert!(dispatcher.kill_job(&job_id).await);
    assert_eq!(harness.launcher.killed(), [111]);
    std::env::remove_var("CAPTUREMOCK_MODE");
}
