// Fixtures wiring the lifecycle against in-memory adapters

use async_trait::async_trait;
use canaria::backend::{InMemoryBackend, InMemoryDelayedQueue, Reconciler};
use canaria::lifecycle::{Rebalancer, StatusStateMachine};
use canaria::serving::{LinearModel, ModelRuntime, Predictor};
use canaria::store::{InMemoryStore, MetadataStore};
use canaria::types::{ModelStatus, Run, Scope, SemanticVersion};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const MODEL: &str = "FraudModel";
pub const VERSION: SemanticVersion = SemanticVersion::new(1, 2, 0);
pub const CACHE_TTL: Duration = Duration::from_secs(600);

/// Deployment identity the reconciler derives for `run_id`.
pub fn deployment(run_id: &str) -> String {
    canaria::backend::deployment_identity(MODEL, run_id)
}

/// Removal job id the reconciler derives for `run_id`.
pub fn removal_job(run_id: &str) -> String {
    format!("remove-model-{}", deployment(run_id))
}

/// Store, backend, delayed queue and lifecycle for one model family.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub backend: Arc<InMemoryBackend>,
    pub queue: Arc<InMemoryDelayedQueue>,
    pub reconciler: Arc<Reconciler>,
    pub machine: Arc<StatusStateMachine>,
    pub rebalancer: Rebalancer,
    pub scope: Scope,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(InMemoryBackend::new());
        let queue = Arc::new(InMemoryDelayedQueue::new(backend.clone()));
        let reconciler = Arc::new(Reconciler::new(MODEL, backend.clone(), queue.clone(), CACHE_TTL));
        let machine = Arc::new(
            StatusStateMachine::new(store.clone(), reconciler.clone()).with_default_submodel(MODEL),
        );
        let rebalancer = Rebalancer::new(machine.clone());

        Self {
            store,
            backend,
            queue,
            reconciler,
            machine,
            rebalancer,
            scope: Scope::new(VERSION).with_submodel(MODEL),
        }
    }

    /// Seeds a run of the harness scope. Later seeds complete later.
    pub async fn seed(&self, run_id: &str, status: ModelStatus, fraction: f64) -> Run {
        seed_run(&self.store, run_id, status, fraction).await
    }

    pub async fn run(&self, run_id: &str) -> Run {
        self.store.get_by_id(run_id).await.expect("run exists")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeds a run with the fixture model's submodel name.
pub async fn seed_run(store: &InMemoryStore, run_id: &str, status: ModelStatus, fraction: f64) -> Run {
    let mut run = store.seed(run_id, VERSION, status, fraction).await;
    run.submodel_name = Some(MODEL.to_string());
    store.insert(run.clone()).await;
    run
}

/// Writes a `model.json` linear model under `root/<run_id>`.
pub fn write_linear_model(root: &Path, run_id: &str, weights: &[f32], bias: f32) -> String {
    let dir = root.join(run_id);
    std::fs::create_dir_all(&dir).expect("create model dir");
    let model = LinearModel {
        weights: weights.to_vec(),
        bias,
    };
    std::fs::write(dir.join("model.json"), serde_json::to_vec(&model).unwrap()).expect("write model");
    dir.display().to_string()
}

/// Runtime answering a fixed value per run, `-1` for unknown runs.
#[derive(Default)]
pub struct TableRuntime {
    values: HashMap<String, f32>,
}

impl TableRuntime {
    pub fn new<'a>(values: impl IntoIterator<Item = (&'a str, f32)>) -> Self {
        Self {
            values: values.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}

#[async_trait]
impl ModelRuntime for TableRuntime {
    async fn resolve(&self, run: &Run) -> canaria::Result<Arc<dyn Predictor>> {
        let value = self.values.get(&run.run_id).copied().unwrap_or(-1.0);
        Ok(Arc::new(LinearModel {
            weights: Vec::new(),
            bias: value,
        }))
    }

    fn name(&self) -> &'static str {
        "table"
    }
}
