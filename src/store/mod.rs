//! Metadata store client.
//!
//! The external run/experiment catalog is the single source of truth for run
//! status and traffic fractions. This module defines the interface canaria
//! consumes from it ([`MetadataStore`]), the typed filter used to scope queries
//! ([`SearchFilter`]), and adapters:
//!
//! - [`MlflowStore`]: MLflow tracking server over its REST API
//! - [`InMemoryStore`]: process-local catalog for tests and local development
//! - [`BoundedStore`]: decorator that puts a deadline on every call

pub mod memory;
pub mod mlflow;

pub use memory::InMemoryStore;
pub use mlflow::{ExperimentRef, MlflowStore};

use crate::error::Result;
use crate::resilience::with_deadline;
use crate::types::{ModelStatus, NewRun, Run, RunUpdate, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Parameter holding the submodel discriminator.
pub const PARAM_SUBMODEL: &str = "submodel_name";
/// Parameter holding the major version.
pub const PARAM_MAJOR: &str = "major_version";
/// Parameter holding the minor version.
pub const PARAM_MINOR: &str = "minor_version";
/// Parameter holding the micro version.
pub const PARAM_MICRO: &str = "micro_version";
/// Metric holding the encoded [`ModelStatus`].
pub const METRIC_STATUS: &str = "active_state";
/// Metric holding the traffic fraction.
pub const METRIC_FRACTION: &str = "test_fraction";

/// Scope plus an optional status restriction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub scope: Scope,
    pub status: Option<ModelStatus>,
}

impl SearchFilter {
    pub fn new(scope: Scope) -> Self {
        Self { scope, status: None }
    }

    pub fn with_status(mut self, status: ModelStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Returns true if the run satisfies this filter.
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        run.in_scope(&self.scope)
    }
}

/// Interface consumed from the external run/experiment catalog.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Finished runs matching the filter, newest completion time first.
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<Run>>;

    /// Registers a new run in status New with a zero fraction.
    async fn create(&self, run: NewRun) -> Result<Run>;

    /// Writes all fields of `update` as one record version.
    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<()>;

    /// Fails with `NotFound` if the run does not resolve.
    async fn get_by_id(&self, run_id: &str) -> Result<Run>;
}

#[async_trait]
impl<S: MetadataStore + ?Sized> MetadataStore for Arc<S> {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<Run>> {
        (**self).search(filter).await
    }

    async fn create(&self, run: NewRun) -> Result<Run> {
        (**self).create(run).await
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        (**self).update(run_id, update).await
    }

    async fn get_by_id(&self, run_id: &str) -> Result<Run> {
        (**self).get_by_id(run_id).await
    }
}

/// Lists runs in scope, optionally restricted to one status.
pub async fn list_runs(
    store: &dyn MetadataStore,
    scope: &Scope,
    status: Option<ModelStatus>,
) -> Result<Vec<Run>> {
    let mut filter = SearchFilter::new(scope.clone());
    filter.status = status;
    store.search(&filter).await
}

/// Lists runs in scope whose status is one of `statuses`, in the given status order.
///
/// A run id appears once even if the store moved it between queries.
pub async fn list_runs_in(
    store: &dyn MetadataStore,
    scope: &Scope,
    statuses: &[ModelStatus],
) -> Result<Vec<Run>> {
    let mut runs: Vec<Run> = Vec::new();
    for status in statuses {
        for run in list_runs(store, scope, Some(*status)).await? {
            if !runs.iter().any(|r| r.run_id == run.run_id) {
                runs.push(run);
            }
        }
    }
    Ok(runs)
}

/// Decorator putting a deadline on every store call.
pub struct BoundedStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: MetadataStore> BoundedStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: MetadataStore> MetadataStore for BoundedStore<S> {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<Run>> {
        with_deadline("store.search", self.timeout, self.inner.search(filter)).await
    }

    async fn create(&self, run: NewRun) -> Result<Run> {
        with_deadline("store.create", self.timeout, self.inner.create(run)).await
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        with_deadline("store.update", self.timeout, self.inner.update(run_id, update)).await
    }

    async fn get_by_id(&self, run_id: &str) -> Result<Run> {
        with_deadline("store.get_by_id", self.timeout, self.inner.get_by_id(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CanariaError;
    use crate::types::SemanticVersion;

    fn scope() -> Scope {
        Scope::new(SemanticVersion::new(0, 0, 1))
    }

    #[tokio::test]
    async fn test_list_runs_in_keeps_status_order() {
        let store = InMemoryStore::new();
        let a = store.seed("a", scope().version, ModelStatus::Canary, 0.0).await;
        let b = store.seed("b", scope().version, ModelStatus::Active, 1.0).await;
        store.seed("c", scope().version, ModelStatus::Disabled, 0.0).await;

        let runs = list_runs_in(&store, &scope(), &[ModelStatus::Active, ModelStatus::Canary])
            .await
            .unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec![b.run_id.as_str(), a.run_id.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_store_times_out() {
        let inner = InMemoryStore::new();
        inner.set_latency(Duration::from_secs(10));
        let store = BoundedStore::new(inner, Duration::from_millis(100));

        let err = store.get_by_id("missing").await.unwrap_err();
        assert!(matches!(err, CanariaError::UpstreamTimeout { .. }));
    }

    #[test]
    fn test_filter_matches_status() {
        let run = Run {
            run_id: "r1".into(),
            version: SemanticVersion::new(0, 0, 1),
            submodel_name: None,
            status: ModelStatus::New,
            test_fraction: 0.0,
            immutable_metadata: Default::default(),
            mutable_metadata: Default::default(),
            artifact_location: String::new(),
            end_time: None,
        };
        assert!(SearchFilter::new(scope()).matches(&run));
        assert!(SearchFilter::new(scope()).with_status(ModelStatus::New).matches(&run));
        assert!(!SearchFilter::new(scope()).with_status(ModelStatus::Active).matches(&run));
    }
}
