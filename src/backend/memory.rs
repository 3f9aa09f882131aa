//! Process-local serving backend and delayed task queue.
//!
//! The queue runs each removal as a tokio timer task. Pending removals are lost
//! when the process exits, so this queue only suits tests and single-process
//! local setups; the Kubernetes queue persists its jobs in the cluster.

use super::{DelayedTaskQueue, DeletionTask, ServingBackend, UpsertOutcome};
use crate::error::{CanariaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-memory deployment objects keyed by deployment identity.
#[derive(Default)]
pub struct InMemoryBackend {
    deployments: Mutex<BTreeMap<String, String>>,
    creates: AtomicU64,
    patches: AtomicU64,
    deletes: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, deployment: &str) -> bool {
        self.deployments.lock().contains_key(deployment)
    }

    pub fn artifact_path(&self, deployment: &str) -> Option<String> {
        self.deployments.lock().get(deployment).cloned()
    }

    /// Snapshot of deployment identity to artifact path.
    pub fn deployments(&self) -> BTreeMap<String, String> {
        self.deployments.lock().clone()
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn patch_count(&self) -> u64 {
        self.patches.load(Ordering::Relaxed)
    }

    /// Number of deletions that removed an existing deployment.
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CanariaError::Backend("serving backend unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServingBackend for InMemoryBackend {
    async fn upsert(&self, deployment: &str, artifact_path: &str) -> Result<UpsertOutcome> {
        self.check_failing()?;

        let previous = self
            .deployments
            .lock()
            .insert(deployment.to_string(), artifact_path.to_string());
        match previous {
            Some(_) => {
                self.patches.fetch_add(1, Ordering::Relaxed);
                Ok(UpsertOutcome::Patched)
            }
            None => {
                self.creates.fetch_add(1, Ordering::Relaxed);
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn delete(&self, deployment: &str) -> Result<()> {
        self.check_failing()?;

        if self.deployments.lock().remove(deployment).is_some() {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            info!(deployment = %deployment, "Deleted deployment");
        } else {
            debug!(deployment = %deployment, "Deployment already gone");
        }
        Ok(())
    }
}

struct PendingJob {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timer-based delayed queue executing deletions against a backend.
pub struct InMemoryDelayedQueue {
    backend: Arc<dyn ServingBackend>,
    jobs: Arc<Mutex<HashMap<String, PendingJob>>>,
    generation: AtomicU64,
}

impl InMemoryDelayedQueue {
    pub fn new(backend: Arc<dyn ServingBackend>) -> Self {
        Self {
            backend,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_pending(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| !job.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|job| !job.handle.is_finished())
            .count()
    }
}

#[async_trait]
impl DelayedTaskQueue for InMemoryDelayedQueue {
    async fn schedule_delayed(&self, job_id: &str, delay: Duration, task: DeletionTask) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let backend = self.backend.clone();
        let jobs = self.jobs.clone();
        let id = job_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = backend.delete(&task.deployment).await {
                warn!(job_id = %id, deployment = %task.deployment, error = %e, "Delayed removal failed");
            }
            let mut jobs = jobs.lock();
            if jobs.get(&id).map(|job| job.generation) == Some(generation) {
                jobs.remove(&id);
            }
        });

        let previous = self
            .jobs
            .lock()
            .insert(job_id.to_string(), PendingJob { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
            debug!(job_id = %job_id, "Superseded pending job");
        }
        Ok(())
    }

    async fn cancel_delayed(&self, job_id: &str) -> Result<bool> {
        match self.jobs.lock().remove(job_id) {
            Some(job) if !job.handle.is_finished() => {
                job.handle.abort();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Drop for InMemoryDelayedQueue {
    fn drop(&mut self) {
        for (_, job) in self.jobs.lock().drain() {
            job.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(deployment: &str) -> DeletionTask {
        DeletionTask {
            deployment: deployment.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_then_patch() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.upsert("m-r1", "0/r1").await.unwrap(), UpsertOutcome::Created);
        assert_eq!(backend.upsert("m-r1", "0/r1-b").await.unwrap(), UpsertOutcome::Patched);
        assert_eq!(backend.artifact_path("m-r1").as_deref(), Some("0/r1-b"));
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.patch_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let backend = InMemoryBackend::new();
        backend.delete("never-deployed").await.unwrap();
        assert_eq!(backend.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = InMemoryBackend::new();
        backend.set_failing(true);
        assert!(matches!(backend.upsert("m", "p").await, Err(CanariaError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_after_delay() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.upsert("m-r1", "0/r1").await.unwrap();
        let queue = InMemoryDelayedQueue::new(backend.clone());

        queue.schedule_delayed("job", Duration::from_secs(10), task("m-r1")).await.unwrap();
        assert!(queue.is_pending("job"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(!backend.contains("m-r1"));
        assert!(!queue.is_pending("job"));
        assert!(!queue.cancel_delayed("job").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_deletion() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.upsert("m-r1", "0/r1").await.unwrap();
        let queue = InMemoryDelayedQueue::new(backend.clone());

        queue.schedule_delayed("job", Duration::from_secs(10), task("m-r1")).await.unwrap();
        assert!(queue.cancel_delayed("job").await.unwrap());

        tokio::time::sleep(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(backend.contains("m-r1"));
    }
}
