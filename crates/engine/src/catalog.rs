// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance discovery.
//!
//! Enumerates cloud instances matching the configured tag filters and
//! classifies them as running or pending. Discovery never fails: cloud
//! trouble is logged once and reported as an empty catalog, which the
//! dispatcher treats as zero capacity.

use flo_adapters::{CloudApi, CloudError};
use flo_core::{Instance, InstanceId, TagFilter};
use std::cmp::Reverse;
use std::collections::HashSet;

/// Result of instance discovery.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Matching instances, running first, larger first, then by IP.
    pub instances: Vec<Instance>,
    /// Ids of instances whose status is `ok` or `initializing`.
    pub running: HashSet<InstanceId>,
}

/// Enumerate instances satisfying every tag filter.
pub async fn discover(cloud: &dyn CloudApi, filters: &[TagFilter]) -> Discovery {
    let all = match cloud.list_instances(None).await {
        Ok(instances) => instances,
        Err(CloudError::Unavailable(reason)) => {
            tracing::error!(
                %reason,
                "cannot run tests in the cloud: the cloud SDK is not installed"
            );
            return Discovery::default();
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                "failed to establish a connection to the cloud; \
                 make sure your credentials are available"
            );
            return Discovery::default();
        }
    };

    let mut instances: Vec<Instance> = all
        .into_iter()
        .filter(|inst| filters.iter().all(|f| f.matches(&inst.tags)))
        .collect();
    if instances.is_empty() {
        tracing::error!(
            filters = %join_filters(filters),
            "no cloud instances found matching the resource filters"
        );
        return Discovery::default();
    }

    let ids: Vec<InstanceId> = instances.iter().map(|inst| inst.id.clone()).collect();
    let health = match cloud.instance_health(&ids).await {
        Ok(health) => health,
        Err(e) => {
            tracing::error!(error = %e, "failed to query instance status");
            return Discovery::default();
        }
    };
    let running: HashSet<InstanceId> = health
        .into_iter()
        .filter(|(_, health)| health.is_running())
        .map(|(id, _)| id)
        .collect();

    // Running instances first so they absorb the capacity budget, then
    // larger instances, then IP for a stable order.
    instances.sort_by_key(|inst| {
        (!running.contains(&inst.id), Reverse(inst.core_budget_or(0)), inst.private_ip.clone())
    });

    Discovery { instances, running }
}

pub(crate) fn join_filters(filters: &[TagFilter]) -> String {
    filters.iter().map(TagFilter::as_str).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
