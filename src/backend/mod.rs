//! Serving backend integration.
//!
//! The external serving backend owns one declarative deployment object per
//! live run. This module defines what canaria consumes from it:
//!
//! - [`ServingBackend`]: idempotent upsert and not-found-tolerant delete
//! - [`DelayedTaskQueue`]: schedule/cancel a deletion by job id
//!
//! and the [`Reconciler`] that turns run activations and deactivations into
//! calls against both. Adapters:
//!
//! - [`InMemoryBackend`] / [`InMemoryDelayedQueue`]: process-local, timer based
//! - `kube::KubeBackend` / `kube::KubeJobQueue`: KServe `InferenceService`
//!   objects and Kubernetes `Job`s (cargo feature `kube`)

pub mod memory;
pub mod reconciler;

#[cfg(feature = "kube")]
pub mod kube;

pub use memory::{InMemoryBackend, InMemoryDelayedQueue};
pub use reconciler::{
    adjust_bucket_path, deployment_identity, fit_name, removal_job_id, to_kebab_case, Reconciler,
    MAX_NAME_LEN,
};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// What an upsert did to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Patched,
}

/// Payload of a delayed removal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionTask {
    /// Deployment identity to delete.
    pub deployment: String,
}

/// Declarative deployment objects on the serving backend.
#[async_trait]
pub trait ServingBackend: Send + Sync {
    /// Create the deployment, or merge-patch its artifact path if it exists.
    async fn upsert(&self, deployment: &str, artifact_path: &str) -> Result<UpsertOutcome>;

    /// Delete the deployment. A missing deployment is not an error.
    async fn delete(&self, deployment: &str) -> Result<()>;
}

/// Deferred execution of deployment removals.
#[async_trait]
pub trait DelayedTaskQueue: Send + Sync {
    /// Schedule `task` to run after `delay`, replacing any job with the same id.
    async fn schedule_delayed(&self, job_id: &str, delay: Duration, task: DeletionTask) -> Result<()>;

    /// Cancel a pending job. Returns false if no such job was pending.
    async fn cancel_delayed(&self, job_id: &str) -> Result<bool>;
}

/// Side effects of a status transition on the serving side.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Make `run_id` servable from `artifact_location`.
    async fn activate(&self, run_id: &str, artifact_location: &str) -> Result<()>;

    /// Stop serving `run_id`.
    async fn deactivate(&self, run_id: &str) -> Result<()>;
}

/// Deployer for the in-process runtime: models are loaded by the serving
/// process itself, so there is nothing to deploy.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDeployer;

#[async_trait]
impl Deployer for LocalDeployer {
    async fn activate(&self, run_id: &str, _artifact_location: &str) -> Result<()> {
        debug!(run_id = %run_id, "Local runtime, nothing to deploy");
        Ok(())
    }

    async fn deactivate(&self, run_id: &str) -> Result<()> {
        debug!(run_id = %run_id, "Local runtime, nothing to undeploy");
        Ok(())
    }
}
