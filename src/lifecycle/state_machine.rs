//! Run status state machine.
//!
//! All four statuses are mutually reachable. Every transition is one combined
//! store write of status and fraction, followed by the serving side effect for
//! transitions that start or stop traffic. A failed side effect never reverts
//! the committed write: the stored status stays the source of truth and the
//! transition can be replayed, since every backend operation is idempotent.

use crate::backend::Deployer;
use crate::error::{CanariaError, Result};
use crate::store::MetadataStore;
use crate::types::{ModelStatus, NewRun, Run, RunUpdate};
use metrics::counter;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Serving side effect implied by a target status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SideEffect {
    Activate,
    Deactivate,
    None,
}

impl SideEffect {
    pub(crate) fn for_status(status: ModelStatus) -> Self {
        match status {
            ModelStatus::Active | ModelStatus::Canary => SideEffect::Activate,
            ModelStatus::Disabled => SideEffect::Deactivate,
            ModelStatus::New => SideEffect::None,
        }
    }
}

/// Authoritative lifecycle operations on single runs.
pub struct StatusStateMachine {
    store: Arc<dyn MetadataStore>,
    deployer: Arc<dyn Deployer>,
    default_submodel: Option<String>,
}

impl StatusStateMachine {
    pub fn new(store: Arc<dyn MetadataStore>, deployer: Arc<dyn Deployer>) -> Self {
        Self {
            store,
            deployer,
            default_submodel: None,
        }
    }

    /// Submodel name given to registered runs that do not carry one.
    pub fn with_default_submodel(mut self, name: impl Into<String>) -> Self {
        self.default_submodel = Some(name.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Registers a run in status New with a zero fraction.
    pub async fn register(&self, mut new_run: NewRun) -> Result<Run> {
        if new_run.submodel_name.is_none() {
            new_run.submodel_name = self.default_submodel.clone();
        }
        let run = self.store.create(new_run).await?;
        counter!("canaria_runs_registered_total").increment(1);
        info!(
            run_id = %run.run_id,
            version = %run.version,
            submodel = ?run.submodel_name,
            "Registered run"
        );
        Ok(run)
    }

    /// Writes a new status and, if given, a new fraction for a run.
    ///
    /// Disabled runs always carry a zero fraction. Fails with `NotFound` if the
    /// run does not resolve. Does not touch the serving backend.
    pub async fn transition(
        &self,
        run_id: &str,
        status: ModelStatus,
        test_fraction: Option<f64>,
    ) -> Result<Run> {
        let run = self.store.get_by_id(run_id).await?;
        self.write(run, status, test_fraction).await
    }

    /// Active at fraction 1.0, then deploy.
    pub async fn enable(&self, run_id: &str) -> Result<Run> {
        self.transition_and_deploy(run_id, ModelStatus::Active, 1.0).await
    }

    /// Disabled at fraction 0.0, then schedule undeployment.
    pub async fn disable(&self, run_id: &str) -> Result<Run> {
        self.transition_and_deploy(run_id, ModelStatus::Disabled, 0.0).await
    }

    /// Canary at fraction 0.0, then deploy. The fraction is set by a rebalance.
    pub async fn canary(&self, run_id: &str) -> Result<Run> {
        self.transition_and_deploy(run_id, ModelStatus::Canary, 0.0).await
    }

    async fn transition_and_deploy(
        &self,
        run_id: &str,
        status: ModelStatus,
        test_fraction: f64,
    ) -> Result<Run> {
        let run = self.store.get_by_id(run_id).await?;
        self.apply(run, status, test_fraction).await
    }

    /// Writes status and fraction for an already resolved run, then runs the
    /// serving side effect for the new status.
    pub(crate) async fn apply(&self, run: Run, status: ModelStatus, test_fraction: f64) -> Result<Run> {
        let run = self.write(run, status, Some(test_fraction)).await?;
        self.deploy(&run, SideEffect::for_status(status)).await?;
        Ok(run)
    }

    async fn write(&self, mut run: Run, status: ModelStatus, test_fraction: Option<f64>) -> Result<Run> {
        let test_fraction = match (status, test_fraction) {
            (ModelStatus::Disabled, Some(f)) if f != 0.0 => {
                warn!(run_id = %run.run_id, fraction = f, "Disabled runs carry no traffic, writing 0");
                Some(0.0)
            }
            (ModelStatus::Disabled, None) => Some(0.0),
            (_, Some(f)) if !f.is_finite() || !(0.0..=1.0).contains(&f) => {
                return Err(CanariaError::InvalidWeight(format!(
                    "fraction {} for run {} is outside [0, 1]",
                    f, run.run_id
                )));
            }
            (_, f) => f,
        };

        self.store
            .update(&run.run_id, &RunUpdate::status(status, test_fraction))
            .await?;

        let previous = run.status;
        run.status = status;
        if let Some(f) = test_fraction {
            run.test_fraction = f;
        }

        counter!("canaria_transitions_total", "status" => status.as_str()).increment(1);
        info!(
            run_id = %run.run_id,
            from = %previous,
            to = %status,
            fraction = run.test_fraction,
            "Run transitioned"
        );
        Ok(run)
    }

    async fn deploy(&self, run: &Run, effect: SideEffect) -> Result<()> {
        let result = match effect {
            SideEffect::Activate => self.deployer.activate(&run.run_id, &run.artifact_location).await,
            SideEffect::Deactivate => self.deployer.deactivate(&run.run_id).await,
            SideEffect::None => Ok(()),
        };

        result.map_err(|e| {
            counter!("canaria_deployment_failures_total").increment(1);
            error!(run_id = %run.run_id, status = %run.status, error = %e, "Serving backend call failed, status kept");
            CanariaError::DeploymentFailed {
                run_id: run.run_id.clone(),
                reason: e.to_string(),
            }
        })
    }
}
