//! Inference entrypoint.
//!
//! Reads the active set of the configured model family through the model
//! cache, picks a run with the router, and returns the prediction together with
//! the metadata of the run that produced it.

use super::runtime::{ModelRuntime, Predictor};
use crate::cache::{Cacheable, ModelCache};
use crate::config::DeploymentMode;
use crate::error::{CanariaError, Result};
use crate::router::{Router, Weighted};
use crate::store::{list_runs, list_runs_in, MetadataStore};
use crate::types::{ModelStatus, Run, Scope};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache key of the weighted active set.
pub const KEY_MODELS: &str = "models";
/// Cache key of the single-model snapshot.
pub const KEY_SINGLE_MODEL: &str = "single_model";

/// Metadata of the run that answered a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub model_version: String,
    pub submodel_name: String,
    #[serde(default)]
    pub extra_metadata: Vec<ModelMetadata>,
}

impl ModelMetadata {
    fn from_run(run: &Run, default_submodel: &str) -> Self {
        Self {
            model_id: run.run_id.clone(),
            model_version: run.version.to_string(),
            submodel_name: run
                .submodel_name
                .clone()
                .unwrap_or_else(|| default_submodel.to_string()),
            extra_metadata: Vec::new(),
        }
    }
}

/// Response of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: f32,
    pub metadata: Vec<ModelMetadata>,
}

/// One servable run in a snapshot.
pub struct ServedModel {
    /// Run record with its fraction normalized across the snapshot.
    pub run: Run,
    predictor: Arc<dyn Predictor>,
}

impl ServedModel {
    pub fn new(run: Run, predictor: Arc<dyn Predictor>) -> Self {
        Self { run, predictor }
    }
}

impl Weighted for ServedModel {
    fn fraction(&self) -> f64 {
        self.run.test_fraction
    }

    fn label(&self) -> &str {
        &self.run.run_id
    }
}

/// Immutable snapshot of the servable runs, in selection order.
#[derive(Default)]
pub struct ActiveSet {
    pub models: Vec<ServedModel>,
}

impl ActiveSet {
    pub fn run_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.run.run_id.as_str()).collect()
    }

    /// Normalized fraction per run.
    pub fn fractions(&self) -> BTreeMap<String, f64> {
        self.models
            .iter()
            .map(|m| (m.run.run_id.clone(), m.run.test_fraction))
            .collect()
    }
}

impl Cacheable for ActiveSet {
    fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Scales the runs' fractions so they sum to one.
///
/// Fails with `UnhealthyState` when the runs carry no traffic at all.
pub fn renormalize(mut runs: Vec<Run>) -> Result<Vec<Run>> {
    if runs.is_empty() {
        return Ok(runs);
    }
    let total: f64 = runs.iter().map(|r| r.test_fraction.max(0.0)).sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(CanariaError::UnhealthyState(format!(
            "active runs carry a total fraction of {}",
            total
        )));
    }
    for run in &mut runs {
        run.test_fraction = run.test_fraction.max(0.0) / total;
    }
    Ok(runs)
}

/// Serves predictions for one model family.
pub struct InferenceService {
    store: Arc<dyn MetadataStore>,
    runtime: Arc<dyn ModelRuntime>,
    cache: ModelCache<ActiveSet>,
    router: Router,
    scope: Scope,
    mode: DeploymentMode,
    default_submodel: String,
}

impl InferenceService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        runtime: Arc<dyn ModelRuntime>,
        cache: ModelCache<ActiveSet>,
        scope: Scope,
        mode: DeploymentMode,
    ) -> Self {
        let default_submodel = scope.submodel_name.clone().unwrap_or_default();
        Self {
            store,
            runtime,
            cache,
            router: Router::new(),
            scope,
            mode,
            default_submodel,
        }
    }

    /// Replace the router, e.g. with a seeded one.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    fn cache_key(&self) -> &'static str {
        match self.mode {
            DeploymentMode::Single => KEY_SINGLE_MODEL,
            DeploymentMode::Weighted => KEY_MODELS,
        }
    }

    /// Current snapshot, from the cache or freshly fetched.
    pub async fn active_set(&self) -> Result<Arc<ActiveSet>> {
        self.cache
            .get_or_fetch(self.cache_key(), || self.fetch_active_set())
            .await
    }

    async fn fetch_active_set(&self) -> Result<ActiveSet> {
        let runs = match self.mode {
            DeploymentMode::Weighted => {
                let live = list_runs_in(
                    self.store.as_ref(),
                    &self.scope,
                    &[ModelStatus::Active, ModelStatus::Canary],
                )
                .await?;
                renormalize(live)?
            }
            DeploymentMode::Single => {
                let newest = list_runs(self.store.as_ref(), &self.scope, Some(ModelStatus::Active))
                    .await?
                    .into_iter()
                    .next();
                newest
                    .map(|mut run| {
                        run.test_fraction = 1.0;
                        vec![run]
                    })
                    .unwrap_or_default()
            }
        };

        let mut models = Vec::with_capacity(runs.len());
        for run in runs {
            let predictor = self.runtime.resolve(&run).await?;
            models.push(ServedModel::new(run, predictor));
        }

        let set = ActiveSet { models };
        info!(
            runtime = self.runtime.name(),
            mode = ?self.mode,
            runs = ?set.run_ids(),
            "Fetched active set"
        );
        Ok(set)
    }

    /// Routes one request and runs the chosen model.
    pub async fn predict(&self, input: &[f32]) -> Result<Prediction> {
        let set = self.active_set().await?;
        let model = self
            .router
            .select(&set.models)
            .ok_or_else(|| CanariaError::UnhealthyState("active set is empty".to_string()))?;

        debug!(run_id = %model.run.run_id, "Routing prediction");
        let outputs = model.predictor.predict(input).await.map_err(|e| {
            counter!("canaria_prediction_errors_total").increment(1);
            warn!(run_id = %model.run.run_id, error = %e, "Prediction failed");
            e
        })?;

        let value = outputs
            .first()
            .copied()
            .ok_or_else(|| CanariaError::Prediction("model returned no outputs".to_string()))?;

        counter!("canaria_predictions_total").increment(1);
        Ok(Prediction {
            value,
            metadata: vec![ModelMetadata::from_run(&model.run, &self.default_submodel)],
        })
    }

    /// True iff a non-empty active set can currently be obtained.
    pub async fn health(&self) -> bool {
        match self.active_set().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Health check failed");
                false
            }
        }
    }

    /// Drops the cached snapshot; the next read refetches.
    pub async fn reload(&self) -> bool {
        self.cache.invalidate_all().await;
        true
    }
}
