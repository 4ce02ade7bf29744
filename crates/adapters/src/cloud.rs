// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud SDK seam.
//!
//! The real SDK belongs to the embedding program; the engine only needs
//! the five operations below. Implementations are not required to be
//! usable concurrently — the dispatcher confines every cloud call to its
//! own task and never hands the handle to a machine agent.

use async_trait::async_trait;
use flo_core::{Instance, InstanceHealth, InstanceId};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from cloud API operations.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The SDK is not installed or cannot be loaded at all.
    #[error("cloud SDK unavailable: {0}")]
    Unavailable(String),
    /// The SDK loaded but credentials are missing or rejected.
    #[error("cloud authentication failed: {0}")]
    Auth(String),
    /// Any other API failure.
    #[error("cloud API error: {0}")]
    Api(String),
}

/// Operations the dispatcher needs from the cloud SDK.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// List instances, optionally restricted to the given ids.
    ///
    /// Returned tag mappings are fresh as of this call; the ownership
    /// negotiator relies on that for its verification re-reads.
    async fn list_instances(
        &self,
        ids: Option<&[InstanceId]>,
    ) -> Result<Vec<Instance>, CloudError>;

    /// Health of the given instances. Instances with no status report
    /// may be absent from the result.
    async fn instance_health(
        &self,
        ids: &[InstanceId],
    ) -> Result<HashMap<InstanceId, InstanceHealth>, CloudError>;

    /// Write a tag, overwriting any existing value.
    async fn add_tag(&self, id: &InstanceId, name: &str, value: &str) -> Result<(), CloudError>;

    /// Delete a tag. Deleting an absent tag is not an error.
    async fn remove_tag(&self, id: &InstanceId, name: &str) -> Result<(), CloudError>;

    /// Ask the cloud to start a stopped instance. Asynchronous on the
    /// cloud side: returns once the request is accepted, not once the
    /// instance is reachable.
    async fn start_instance(&self, id: &InstanceId) -> Result<(), CloudError>;
}
