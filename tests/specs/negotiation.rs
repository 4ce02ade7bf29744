// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ownership negotiation specs: capacity budgets, competing owners,
//! and race convergence, all through a full dispatcher.

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn three_instances_capacity_four_claims_the_larges() {
    // Two larges (2 cores each) and a medium: budget 4 claims the
    // larges and leaves the medium untouched.
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-b", "10.0.0.2", "m4.large"),
        instance("i-c", "10.0.0.3", "t2.medium"),
    ]);
    harness.mark_running(&["i-a", "i-b", "i-c"]);

    let dispatcher = harness.dispatcher().await;

    assert_eq!(dispatcher.capacity(), 4);
    assert!(dispatcher.other_owners().is_empty());
    let ids: Vec<String> =
        dispatcher.machines().iter().map(|m| m.id().to_string()).collect();
    assert_eq!(ids, ["i-a", "i-b"]);
    assert_eq!(harness.cloud.tag_value(&"i-c".into(), OWNERSHIP_TAG), None);
}

#[tokio::test(start_paused = true)]
async fn pre_owned_instance_falls_to_the_next_candidates() {
    let mut taken = instance("i-a", "10.0.0.1", "m4.large");
    taken.tags.insert(OWNERSHIP_TAG.to_string(), "alice_123".to_string());
    let harness = Harness::new(vec![
        taken,
        instance("i-b", "10.0.0.2", "m4.large"),
        instance("i-c", "10.0.0.3", "t2.medium"),
    ]);
    harness.mark_running(&["i-a", "i-b", "i-c"]);

    let dispatcher = harness.dispatcher().await;

    assert_eq!(dispatcher.capacity(), 3);
    assert_eq!(dispatcher.other_owners(), ["alice"]);
    let ids: Vec<String> =
        dispatcher.machines().iter().map(|m| m.id().to_string()).collect();
    assert_eq!(ids, ["i-b", "i-c"]);
}

#[tokio::test(start_paused = true)]
async fn lost_race_recovers_on_fallback_capacity() {
    // A competitor wins i-a during verification; the dispatcher
    // retreats onto i-d with the two cores it lost.
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-d", "10.0.0.4", "m4.large"),
    ]);
    harness.mark_running(&["i-a", "i-d"]);
    harness.cloud.set_tag_outcome("i-a", TagOutcome::Lost("bob_456".to_string()));

    let dispatcher = harness.dispatcher_with_capacity(2).await;

    let ids: Vec<String> =
        dispatcher.machines().iter().map(|m| m.id().to_string()).collect();
    assert_eq!(ids, ["i-d"]);
    assert!(dispatcher.other_owners().contains(&"bob".to_string()));
    assert_eq!(
        harness.cloud.tag_value(&"i-a".into(), OWNERSHIP_TAG),
        Some("bob_456".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn owned_machines_carry_our_tag_and_never_our_owner_list() {
    // Ownership exclusivity: what we own is tagged with our claim, and
    // no owned instance's user appears among the other owners.
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-b", "10.0.0.2", "m4.large"),
        instance("i-c", "10.0.0.3", "m4.large"),
    ]);
    harness.mark_running(&["i-a", "i-b", "i-c"]);
    harness.cloud.set_tag_outcome("i-b", TagOutcome::Lost("eve_9".to_string()));

    let dispatcher = harness.dispatcher_with_capacity(6).await;

    for machine in dispatcher.machines() {
        let tag = harness.cloud.tag_value(machine.id(), OWNERSHIP_TAG);
        assert_eq!(tag.as_deref().map(flo_core::OwnerClaim::user_of), Some("tester"));
    }
    assert_eq!(dispatcher.other_owners(), ["eve"]);
}

#[tokio::test(start_paused = true)]
async fn slow_registry_converges_within_the_verification_budget() {
    // The write is invisible for several re-reads; the verification
    // loop keeps going and still confirms the claim.
    let harness = Harness::new(vec![instance("i-a", "10.0.0.1", "m4.large")]);
    harness.mark_running(&["i-a"]);
    harness.cloud.set_tag_outcome("i-a", TagOutcome::Hidden(5));

    let dispatcher = harness.dispatcher().await;

    assert_eq!(dispatcher.capacity(), 2);
    assert_eq!(
        harness.cloud.tag_value(&"i-a".into(), OWNERSHIP_TAG).map(|v| v.starts_with("tester_")),
        Some(true)
    );
}

#[tokio::test(start_paused = true)]
async fn all_candidates_owned_elsewhere_means_zero_capacity() {
    let mut a = instance("i-a", "10.0.0.1", "m4.large");
    a.tags.insert(OWNERSHIP_TAG.to_string(), "zoe_1".to_string());
    let mut b = instance("i-b", "10.0.0.2", "m4.large");
    b.tags.insert(OWNERSHIP_TAG.to_string(), "adam_2".to_string());
    let harness = Harness::new(vec![a, b]);
    harness.mark_running(&["i-a", "i-b"]);

    let dispatcher = harness.dispatcher().await;

    assert_eq!(dispatcher.capacity(), 0);
    assert_eq!(dispatcher.other_owners(), ["adam", "zoe"]);
    assert!(matches!(
        dispatcher.submit_slave_job(&servaddr_args()).await,
        Err(DispatchError::NoMachines)
    ));
}

#[tokio::test(start_paused = true)]
async fn final_cleanup_twice_leaves_everything_untagged() {
    let harness = Harness::new(vec![
        instance("i-a", "10.0.0.1", "m4.large"),
        instance("i-b", "10.0.0.2", "m4.large"),
    ]);
    harness.mark_running(&["i-a", "i-b"]);
    let dispatcher = harness.dispatcher().await;

    dispatcher.cleanup(true).await;
    dispatcher.cleanup(true).await;

    for id in ["i-a", "i-b"] {
        assert_eq!(harness.cloud.tag_value(&id.into(), OWNERSHIP_TAG), None);
    }
}
