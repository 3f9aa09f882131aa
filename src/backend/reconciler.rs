//! Reconciliation of run activations against the serving backend.
//!
//! Activation is an upsert keyed by a deterministic deployment identity, so a
//! rebalance may re-activate an already live run without side effects beyond
//! re-pointing its artifact path. Deactivation never deletes directly: it
//! schedules a removal job delayed past the model cache TTL, so a replica still
//! holding a snapshot that lists the run keeps finding its deployment.

use super::{DelayedTaskQueue, DeletionTask, Deployer, ServingBackend, UpsertOutcome};
use crate::error::{CanariaError, Result};
use crate::resilience::with_deadline;
use async_trait::async_trait;
use metrics::counter;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Smallest allowed ratio between the removal delay and the cache TTL.
pub const MIN_DELAY_FACTOR: f64 = 1.5;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest name Kubernetes accepts for a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

const DIGEST_SUFFIX_LEN: usize = 8;

/// Converts `TitleCase` names to `title-case`.
///
/// A hyphen goes before every upper-case letter except the first character
/// unless one is already there, then the result is lower-cased and stripped
/// of whitespace.
pub fn to_kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    for (i, c) in name.chars().enumerate() {
        if c.is_whitespace() {
            continue;
        }
        if i > 0 && c.is_uppercase() && !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// Shortens `name` to [`MAX_NAME_LEN`], replacing the tail with a digest of
/// the full name so distinct long names stay distinct.
pub fn fit_name(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix: String = digest
        .iter()
        .take(DIGEST_SUFFIX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();

    let budget = MAX_NAME_LEN - DIGEST_SUFFIX_LEN - 1;
    let mut head = String::with_capacity(budget);
    for c in name.chars() {
        if head.len() + c.len_utf8() > budget {
            break;
        }
        head.push(c);
    }
    format!("{}-{}", head.trim_end_matches('-'), suffix)
}

/// Deployment identity of a run: `<model>-<run_id>` in kebab case.
pub fn deployment_identity(model_name: &str, run_id: &str) -> String {
    fit_name(to_kebab_case(&format!("{}-{}", model_name, run_id)))
}

/// Removal job id for a deployment: `remove-model-<deployment>`.
pub fn removal_job_id(deployment: &str) -> String {
    fit_name(format!("remove-model-{}", deployment))
}

/// Strips a leading `s3://` and then a leading `mlflow/` from an artifact URI.
///
/// The serving backend resolves paths relative to its storage bucket.
pub fn adjust_bucket_path(location: &str) -> &str {
    let path = location.strip_prefix("s3://").unwrap_or(location);
    path.strip_prefix("mlflow/").unwrap_or(path)
}

/// Bridges run activations to the serving backend.
pub struct Reconciler {
    model_name: String,
    backend: Arc<dyn ServingBackend>,
    queue: Arc<dyn DelayedTaskQueue>,
    removal_delay: Duration,
    timeout: Duration,
}

impl Reconciler {
    /// Create a reconciler whose removals are delayed by 1.5 x `cache_ttl`.
    pub fn new(
        model_name: impl Into<String>,
        backend: Arc<dyn ServingBackend>,
        queue: Arc<dyn DelayedTaskQueue>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            backend,
            queue,
            removal_delay: cache_ttl.mul_f64(MIN_DELAY_FACTOR),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Scale the removal delay. Factors below 1.5 are rejected.
    pub fn with_delay_factor(mut self, cache_ttl: Duration, factor: f64) -> Result<Self> {
        if !factor.is_finite() || factor < MIN_DELAY_FACTOR {
            return Err(CanariaError::InvalidConfig {
                field: "serving.removal_delay_factor".to_string(),
                reason: format!("must be at least {}, got {}", MIN_DELAY_FACTOR, factor),
            });
        }
        self.removal_delay = cache_ttl.mul_f64(factor);
        Ok(self)
    }

    /// Deadline applied to every backend and queue call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn removal_delay(&self) -> Duration {
        self.removal_delay
    }

    pub fn deployment_identity(&self, run_id: &str) -> String {
        deployment_identity(&self.model_name, run_id)
    }

    /// Id of the delayed removal job for a run.
    pub fn removal_job_id(&self, run_id: &str) -> String {
        removal_job_id(&self.deployment_identity(run_id))
    }

    /// Upsert the run's deployment, superseding any pending removal first.
    pub async fn activate(&self, run_id: &str, artifact_location: &str) -> Result<UpsertOutcome> {
        let deployment = self.deployment_identity(run_id);
        let path = adjust_bucket_path(artifact_location);

        self.cancel_removal(run_id).await?;

        let outcome = with_deadline(
            "backend.upsert",
            self.timeout,
            self.backend.upsert(&deployment, path),
        )
        .await?;

        counter!("canaria_backend_upserts_total").increment(1);
        info!(run_id = %run_id, deployment = %deployment, path = %path, ?outcome, "Activated deployment");
        Ok(outcome)
    }

    /// Schedule the run's deployment for removal after the removal delay.
    pub async fn deactivate(&self, run_id: &str) -> Result<()> {
        let deployment = self.deployment_identity(run_id);
        let job_id = self.removal_job_id(run_id);

        self.cancel_removal(run_id).await?;

        with_deadline(
            "backend.schedule_delayed",
            self.timeout,
            self.queue
                .schedule_delayed(&job_id, self.removal_delay, DeletionTask { deployment: deployment.clone() }),
        )
        .await?;

        counter!("canaria_backend_removals_scheduled_total").increment(1);
        info!(
            run_id = %run_id,
            deployment = %deployment,
            job_id = %job_id,
            delay_secs = self.removal_delay.as_secs_f64(),
            "Scheduled deployment removal"
        );
        Ok(())
    }

    /// Cancel a pending removal. Returns false if none was pending.
    pub async fn cancel_removal(&self, run_id: &str) -> Result<bool> {
        let job_id = self.removal_job_id(run_id);
        let cancelled = with_deadline(
            "backend.cancel_delayed",
            self.timeout,
            self.queue.cancel_delayed(&job_id),
        )
        .await?;
        if cancelled {
            info!(run_id = %run_id, job_id = %job_id, "Cancelled pending removal");
        } else {
            debug!(run_id = %run_id, job_id = %job_id, "No pending removal");
        }
        Ok(cancelled)
    }
}

#[async_trait]
impl Deployer for Reconciler {
    async fn activate(&self, run_id: &str, artifact_location: &str) -> Result<()> {
        Reconciler::activate(self, run_id, artifact_location).await.map(|_| ())
    }

    async fn deactivate(&self, run_id: &str) -> Result<()> {
        Reconciler::deactivate(self, run_id).await
    }
}
