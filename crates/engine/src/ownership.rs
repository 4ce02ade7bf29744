// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ownership negotiation over instance tags.
//!
//! There is no compare-and-swap on cloud tags: two dispatchers can each
//! write a claim and each believe it stuck. The protocol here resolves
//! that without a lock — write the claim, then re-read until the
//! registry settles. Losers retreat voluntarily and retry on the
//! instances the capacity budget made them pass over, bounded by the
//! capacity they lost, so the total claimed across all dispatchers
//! converges on the configured maximum.

use flo_adapters::CloudApi;
use flo_core::{Instance, InstanceId, OwnerClaim, OWNERSHIP_TAG};
use std::collections::BTreeSet;
use std::time::Duration;

/// Verification passes before an unreadable claim is abandoned.
const VERIFY_PASSES: usize = 20;
/// Pause between verification passes.
const VERIFY_PAUSE: Duration = Duration::from_millis(100);

/// Outcome of an ownership negotiation.
#[derive(Debug, Default)]
pub struct Negotiation {
    /// Instances we own, in claim order.
    pub owned: Vec<Instance>,
    /// Users observed owning other candidates, sorted and deduplicated.
    pub other_owners: Vec<String>,
}

/// Claim exclusive use of a capacity-bounded subset of `instances`.
///
/// `instances` must be in discovery order (running first, larger
/// first); the claim pass walks them in order and stops tagging once
/// the summed core budget reaches `capacity_budget`.
pub async fn take_ownership(
    cloud: &dyn CloudApi,
    instances: &[Instance],
    capacity_budget: u32,
    claim: &OwnerClaim,
) -> Negotiation {
    let mut owned = Vec::new();
    let mut others = BTreeSet::new();
    let mut candidates = instances.to_vec();
    let mut budget = capacity_budget;

    loop {
        let (try_own, fallback) = claim_pass(cloud, &candidates, budget, claim, &mut others).await;
        if try_own.is_empty() {
            break;
        }
        let (won, lost_capacity) = verify_claims(cloud, &try_own, claim, &mut others).await;
        owned.extend(won);
        if lost_capacity == 0 {
            break;
        }
        // Retreat: competitors took some of our claims, so retry on the
        // instances the budget made us pass over, up to the capacity
        // we lost.
        tracing::info!(lost_capacity, fallback = fallback.len(), "claims lost, trying fallback instances");
        candidates = fallback;
        budget = lost_capacity;
    }

    Negotiation { owned, other_owners: others.into_iter().collect() }
}

/// Walk candidates in order, tagging free instances until the budget is
/// spent and collecting the rest as fallback.
async fn claim_pass(
    cloud: &dyn CloudApi,
    candidates: &[Instance],
    budget: u32,
    claim: &OwnerClaim,
    others: &mut BTreeSet<String>,
) -> (Vec<InstanceId>, Vec<Instance>) {
    let my_value = claim.value();
    let mut try_own = Vec::new();
    let mut fallback = Vec::new();
    let mut capacity = 0u32;

    for inst in candidates {
        if let Some(owner) = inst.owner_value() {
            others.insert(OwnerClaim::user_of(owner).to_string());
            continue;
        }
        if capacity < budget {
            if let Err(e) = cloud.add_tag(&inst.id, OWNERSHIP_TAG, &my_value).await {
                // Verification will observe the missing tag and drop it.
                tracing::warn!(instance = %inst.id, error = %e, "claim write failed");
            }
            try_own.push(inst.id.clone());
        } else {
            fallback.push(inst.clone());
        }
        capacity += inst.core_budget();
    }

    (try_own, fallback)
}

/// Re-read claimed tags until every claim is confirmed, lost, or the
/// pass budget runs out. Returns confirmed instances in claim order and
/// the summed core budget of lost claims.
async fn verify_claims(
    cloud: &dyn CloudApi,
    try_own: &[InstanceId],
    claim: &OwnerClaim,
    others: &mut BTreeSet<String>,
) -> (Vec<Instance>, u32) {
    let my_value = claim.value();
    let mut pending: Vec<InstanceId> = try_own.to_vec();
    let mut owned = Vec::new();
    let mut lost_capacity = 0u32;

    for _ in 0..VERIFY_PASSES {
        let fresh = match cloud.list_instances(Some(&pending)).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(error = %e, "claim verification read failed");
                break;
            }
        };
        pending = Vec::new();
        for inst in fresh {
            let owner = inst.owner_value().map(str::to_string);
            match owner.as_deref() {
                Some(value) if value == my_value => owned.push(inst),
                Some(value) => {
                    // Somebody else grabbed it first; we drop it.
                    others.insert(OwnerClaim::user_of(value).to_string());
                    lost_capacity += inst.core_budget();
                }
                None => pending.push(inst.id),
            }
        }
        if pending.is_empty() {
            break;
        }
        tokio::time::sleep(VERIFY_PAUSE).await;
    }

    owned.sort_by_key(|inst| try_own.iter().position(|id| id == &inst.id).unwrap_or(usize::MAX));
    (owned, lost_capacity)
}

/// Delete the ownership tag on each instance. Idempotent: an already
/// absent tag is not an error, and failures are swallowed so final
/// cleanup can always retry.
pub async fn release_ownership(cloud: &dyn CloudApi, ids: &[InstanceId]) {
    for id in ids {
        if let Err(e) = cloud.remove_tag(id, OWNERSHIP_TAG).await {
            tracing::debug!(instance = %id, error = %e, "tag removal failed during release");
        }
    }
}

#[cfg(test)]
#[path = "ownership_tests.rs"]
mod tests;
