//! Traffic rebalancing.
//!
//! A rebalance takes a run to weight map for one scope, normalizes it into
//! fractions, and reconciles every known run of the scope against it. Known
//! runs omitted from the map are disabled, so a caller must name every run it
//! wants to keep alive.
//!
//! Validation happens before the first write. Execution is per run and not
//! transactional: a failure partway through is reported with the runs that
//! succeeded and the runs that failed.

use super::state_machine::StatusStateMachine;
use crate::error::{CanariaError, Result};
use crate::store::list_runs_in;
use crate::types::{ModelStatus, Run, RunId, Scope};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Which runs a rebalance considers known, and what survivors become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "status")]
pub enum RebalanceMode {
    /// Known set is New, Active and Canary; survivors become Active.
    Promote,
    /// Known set is one live status; survivors keep it.
    Cohort(ModelStatus),
}

impl RebalanceMode {
    fn known_statuses(&self) -> Vec<ModelStatus> {
        match self {
            RebalanceMode::Promote => vec![ModelStatus::New, ModelStatus::Active, ModelStatus::Canary],
            RebalanceMode::Cohort(status) => vec![*status],
        }
    }
}

/// What happened to one run during a rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: ModelStatus,
    pub test_fraction: f64,
    /// Whether the status write reached the store. `None` when the write
    /// timed out and its effect is unknown.
    pub committed: Option<bool>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-run results of one rebalance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub outcomes: Vec<RunOutcome>,
}

impl RebalanceReport {
    pub fn succeeded(&self) -> Vec<&RunOutcome> {
        self.outcomes.iter().filter(|o| o.is_success()).collect()
    }

    pub fn failed(&self) -> Vec<&RunOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success()).collect()
    }

    pub fn outcome(&self, run_id: &str) -> Option<&RunOutcome> {
        self.outcomes.iter().find(|o| o.run_id == run_id)
    }

    /// Written fraction per run.
    pub fn fractions(&self) -> BTreeMap<RunId, f64> {
        self.outcomes
            .iter()
            .map(|o| (o.run_id.clone(), o.test_fraction))
            .collect()
    }
}

/// Divides each weight by the total.
///
/// Fails with `InvalidWeight` on a negative or non-finite weight, or when the
/// total is not strictly positive.
pub fn normalize_fractions(weights: &BTreeMap<RunId, f64>) -> Result<BTreeMap<RunId, f64>> {
    if let Some((run_id, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(CanariaError::InvalidWeight(format!(
            "weight {} for run {} must be a finite non-negative number",
            w, run_id
        )));
    }

    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return Err(CanariaError::InvalidWeight(format!(
            "total weight must be strictly positive, got {}",
            total
        )));
    }

    Ok(weights.iter().map(|(k, w)| (k.clone(), w / total)).collect())
}

/// Rebalances traffic fractions within a scope.
pub struct Rebalancer {
    machine: Arc<StatusStateMachine>,
}

impl Rebalancer {
    pub fn new(machine: Arc<StatusStateMachine>) -> Self {
        Self { machine }
    }

    /// Applies `weights` to every known run of `scope`.
    ///
    /// An empty map drains the scope: every known run is disabled.
    pub async fn rebalance(
        &self,
        weights: &BTreeMap<RunId, f64>,
        scope: &Scope,
        mode: RebalanceMode,
    ) -> Result<RebalanceReport> {
        let result = self.run(weights, scope, mode).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(CanariaError::PartialRebalance(_)) => "partial",
            Err(e) if e.is_validation() => "rejected",
            Err(_) => "failed",
        };
        counter!("canaria_rebalances_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run(
        &self,
        weights: &BTreeMap<RunId, f64>,
        scope: &Scope,
        mode: RebalanceMode,
    ) -> Result<RebalanceReport> {
        if let RebalanceMode::Cohort(status) = mode {
            if !status.is_live() {
                return Err(CanariaError::InvalidWeight(format!(
                    "cohort rebalance must target active or canary runs, not {}",
                    status
                )));
            }
        }

        let fractions = if weights.is_empty() {
            BTreeMap::new()
        } else {
            normalize_fractions(weights)?
        };

        let known = list_runs_in(self.machine.store().as_ref(), scope, &mode.known_statuses()).await?;
        let known_ids: BTreeSet<&str> = known.iter().map(|r| r.run_id.as_str()).collect();

        let unknown: Vec<String> = fractions
            .keys()
            .filter(|id| !known_ids.contains(id.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            warn!(runs = ?unknown, version = %scope.version, "Rebalance references runs outside the scope");
            return Err(CanariaError::UnknownRun(unknown));
        }

        info!(
            version = %scope.version,
            submodel = ?scope.submodel_name,
            ?mode,
            requested = fractions.len(),
            known = known.len(),
            "Rebalancing"
        );

        let (kept, omitted): (Vec<Run>, Vec<Run>) = known
            .into_iter()
            .partition(|r| fractions.contains_key(&r.run_id));

        let mut report = RebalanceReport::default();
        for run in omitted {
            report.outcomes.push(self.step(run, ModelStatus::Disabled, 0.0).await);
        }
        for run in kept {
            let fraction = fractions.get(&run.run_id).copied().unwrap_or(0.0);
            let outcome = if fraction <= 0.0 {
                self.step(run, ModelStatus::Disabled, 0.0).await
            } else {
                let status = match mode {
                    RebalanceMode::Promote => ModelStatus::Active,
                    RebalanceMode::Cohort(_) => run.status,
                };
                self.step(run, status, fraction).await
            };
            report.outcomes.push(outcome);
        }

        if report.failed().is_empty() {
            info!(runs = report.outcomes.len(), "Rebalance applied");
            Ok(report)
        } else {
            warn!(
                succeeded = report.succeeded().len(),
                failed = report.failed().len(),
                "Rebalance partially applied"
            );
            Err(CanariaError::PartialRebalance(Box::new(report)))
        }
    }

    async fn step(&self, run: Run, status: ModelStatus, fraction: f64) -> RunOutcome {
        let run_id = run.run_id.clone();
        match self.machine.apply(run, status, fraction).await {
            Ok(run) => RunOutcome {
                run_id,
                status: run.status,
                test_fraction: run.test_fraction,
                committed: Some(true),
                error: None,
            },
            Err(e) => RunOutcome {
                run_id,
                status,
                test_fraction: fraction,
                committed: match &e {
                    CanariaError::DeploymentFailed { .. } => Some(true),
                    CanariaError::UpstreamTimeout { .. } => None,
                    _ => Some(false),
                },
                error: Some(e.to_string()),
            },
        }
    }
}
