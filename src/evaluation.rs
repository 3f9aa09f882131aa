//! Evaluation-driven rebalancing.
//!
//! Scores the live runs of a scope and turns the scores into a weight map:
//! runs that are already Active keep weight 2, other runs get weight 1 when
//! their score clears the threshold and 0 otherwise. The map then goes through
//! a promote rebalance, so zero-weight runs end up Disabled.

use crate::error::Result;
use crate::lifecycle::{RebalanceMode, RebalanceReport, Rebalancer};
use crate::serving::runtime::ModelRuntime;
use crate::store::{list_runs_in, MetadataStore};
use crate::types::{ModelStatus, Run, RunId, Scope};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Score a candidate must exceed to receive traffic.
pub const DEFAULT_THRESHOLD: f64 = 0.95;

const ACTIVE_WEIGHT: f64 = 2.0;
const PASSING_WEIGHT: f64 = 1.0;

/// Scores one run, higher is better.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, run: &Run) -> Result<f64>;
}

/// Weight of a run given its status and, for non-Active runs, its score.
pub fn plan_weight(run: &Run, score: Option<f64>, threshold: f64) -> f64 {
    if run.status == ModelStatus::Active {
        return ACTIVE_WEIGHT;
    }
    match score {
        Some(s) if s > threshold => PASSING_WEIGHT,
        _ => 0.0,
    }
}

/// Binary accuracy over a labelled sample set.
///
/// A prediction of 0.5 or more counts as the positive class.
pub struct AccuracyScorer {
    runtime: Arc<dyn ModelRuntime>,
    samples: Vec<(Vec<f32>, f32)>,
}

impl AccuracyScorer {
    pub fn new(runtime: Arc<dyn ModelRuntime>, samples: Vec<(Vec<f32>, f32)>) -> Self {
        Self { runtime, samples }
    }
}

#[async_trait]
impl Scorer for AccuracyScorer {
    async fn score(&self, run: &Run) -> Result<f64> {
        if self.samples.is_empty() {
            return Ok(0.0);
        }
        let predictor = self.runtime.resolve(run).await?;
        let mut correct = 0usize;
        for (features, label) in &self.samples {
            let output = predictor.predict(features).await?;
            let predicted = match output.first() {
                Some(y) if *y >= 0.5 => 1.0,
                _ => 0.0,
            };
            if (predicted - label).abs() < f32::EPSILON {
                correct += 1;
            }
        }
        Ok(correct as f64 / self.samples.len() as f64)
    }
}

/// Scores the live runs of a scope and rebalances on the result.
pub struct Evaluator {
    store: Arc<dyn MetadataStore>,
    rebalancer: Arc<Rebalancer>,
    threshold: f64,
}

impl Evaluator {
    pub fn new(store: Arc<dyn MetadataStore>, rebalancer: Arc<Rebalancer>) -> Self {
        Self {
            store,
            rebalancer,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Weight map for the New, Active and Canary runs of `scope`.
    pub async fn plan(&self, scope: &Scope, scorer: &dyn Scorer) -> Result<BTreeMap<RunId, f64>> {
        let runs = list_runs_in(
            self.store.as_ref(),
            scope,
            &[ModelStatus::New, ModelStatus::Active, ModelStatus::Canary],
        )
        .await?;

        let scores = try_join_all(runs.iter().map(|run| async move {
            if run.status == ModelStatus::Active {
                Ok(None)
            } else {
                scorer.score(run).await.map(Some)
            }
        }))
        .await?;

        let mut weights = BTreeMap::new();
        for (run, score) in runs.iter().zip(scores) {
            let weight = plan_weight(run, score, self.threshold);
            debug!(run_id = %run.run_id, status = %run.status, ?score, weight, "Planned weight");
            weights.insert(run.run_id.clone(), weight);
        }
        Ok(weights)
    }

    /// Plans and applies a promote rebalance.
    pub async fn evaluate(&self, scope: &Scope, scorer: &dyn Scorer) -> Result<RebalanceReport> {
        let weights = self.plan(scope, scorer).await?;
        info!(version = %scope.version, weights = ?weights, "Applying evaluation");
        self.rebalancer
            .rebalance(&weights, scope, RebalanceMode::Promote)
            .await
    }
}
