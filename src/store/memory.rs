//! In-memory metadata store.
//!
//! Process-local catalog with the same filtering and ordering semantics as the
//! tracking server adapter. Used by tests and by local development setups.

use super::{MetadataStore, SearchFilter};
use crate::error::{CanariaError, Result};
use crate::types::{ModelStatus, NewRun, Run, RunUpdate, SemanticVersion};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory run catalog.
pub struct InMemoryStore {
    runs: RwLock<Vec<Run>>,
    /// Number of successful create/update calls.
    writes: AtomicU64,
    /// Number of search calls.
    searches: AtomicU64,
    /// Orders seeded runs by completion time.
    sequence: AtomicU64,
    /// Artificial latency added to every call.
    latency: Mutex<Duration>,
    /// Extra latency added to updates only.
    update_latency: Mutex<Duration>,
    /// Runs whose updates fail.
    failing: Mutex<HashSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(Vec::new()),
            writes: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            latency: Mutex::new(Duration::ZERO),
            update_latency: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Inserts a run as-is. Does not count as a write.
    pub async fn insert(&self, run: Run) {
        let mut runs = self.runs.write().await;
        runs.retain(|r| r.run_id != run.run_id);
        runs.push(run);
    }

    /// Inserts a run with the given id, status and fraction. Later seeds complete later.
    pub async fn seed(
        &self,
        run_id: &str,
        version: SemanticVersion,
        status: ModelStatus,
        test_fraction: f64,
    ) -> Run {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) as i64;
        let run = Run {
            run_id: run_id.to_string(),
            version,
            submodel_name: None,
            status,
            test_fraction,
            immutable_metadata: BTreeMap::new(),
            mutable_metadata: BTreeMap::new(),
            artifact_location: format!("s3://mlflow/0/{}/artifacts", run_id),
            end_time: Some(Utc::now() + ChronoDuration::milliseconds(seq)),
        };
        self.insert(run.clone()).await;
        run
    }

    /// Adds latency to every subsequent call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Adds latency to every subsequent update, on top of the call latency.
    pub fn set_update_latency(&self, latency: Duration) {
        *self.update_latency.lock() = latency;
    }

    /// Makes every subsequent update of `run_id` fail.
    pub fn fail_updates_for(&self, run_id: &str) {
        self.failing.lock().insert(run_id.to_string());
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn search_count(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    /// Snapshot of every stored run.
    pub async fn all(&self) -> Vec<Run> {
        self.runs.read().await.clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<Run>> {
        self.simulate_latency().await;
        self.searches.fetch_add(1, Ordering::Relaxed);

        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        Ok(matching)
    }

    async fn create(&self, new_run: NewRun) -> Result<Run> {
        self.simulate_latency().await;

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run = Run {
            artifact_location: new_run
                .artifact_location
                .unwrap_or_else(|| format!("memory://runs/{}/artifacts", run_id)),
            run_id,
            version: new_run.version,
            submodel_name: new_run.submodel_name,
            status: ModelStatus::New,
            test_fraction: 0.0,
            immutable_metadata: new_run.immutable_metadata,
            mutable_metadata: new_run.mutable_metadata,
            end_time: Some(Utc::now()),
        };

        self.runs.write().await.push(run.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(run_id = %run.run_id, "Created run");
        Ok(run)
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        self.simulate_latency().await;
        let update_latency = *self.update_latency.lock();
        if !update_latency.is_zero() {
            tokio::time::sleep(update_latency).await;
        }

        if self.failing.lock().contains(run_id) {
            return Err(CanariaError::Store(format!("update of run {} rejected", run_id)));
        }

        let mut runs = self.runs.write().await;
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| CanariaError::NotFound(format!("Run {} not found", run_id)))?;

        if let Some(status) = update.status {
            run.status = status;
        }
        if let Some(fraction) = update.test_fraction {
            run.test_fraction = fraction;
        }
        for (key, value) in &update.mutable_metadata {
            run.mutable_metadata.insert(key.clone(), *value);
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_by_id(&self, run_id: &str) -> Result<Run> {
        self.simulate_latency().await;

        self.runs
            .read()
            .await
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| CanariaError::NotFound(format!("Run {} not found", run_id)))
    }
}
