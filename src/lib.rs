//! canaria - lifecycle management and weighted traffic routing for trained
//! model runs.
//!
//! Runs of one model family live in an external metadata store. canaria moves
//! them through a status lifecycle, splits traffic across the live ones, keeps
//! the serving backend's deployments in step, and serves predictions by
//! routing each request to one live run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HTTP: /predict /health /reload | /admin/* | CLI            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serving: ModelCache -> Router -> ModelRuntime              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lifecycle: StatusStateMachine | Rebalancer | Evaluator     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Adapters: MetadataStore | ServingBackend | DelayedQueue    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use canaria::config::CanariaConfig;
//!
//! #[tokio::main]
//! async fn main() -> canaria::Result<()> {
//!     let config = CanariaConfig::development();
//!     canaria::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod backend;
pub mod cache;
pub mod cli;
pub mod evaluation;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod router;
pub mod serving;
pub mod shutdown;
pub mod store;

pub use error::{CanariaError, Result};

use backend::{Deployer, LocalDeployer};
use cache::ModelCache;
use config::{CanariaConfig, RuntimeKind};
use lifecycle::{Rebalancer, StatusStateMachine};
use metrics_exporter_prometheus::PrometheusHandle;
use serving::{AppState, InferenceService, JsonModelLoader, LocalModel, ModelRuntime, RemoteModel};
use shutdown::ShutdownCoordinator;
use std::sync::Arc;
use store::{BoundedStore, ExperimentRef, MetadataStore, MlflowStore};
use tokio::net::TcpListener;
use tracing::info;
use types::Scope;

/// The wired components of one model family.
pub struct Canaria {
    config: CanariaConfig,
    scope: Scope,
    store: Arc<dyn MetadataStore>,
    machine: Arc<StatusStateMachine>,
    rebalancer: Arc<Rebalancer>,
    runtime: Arc<dyn ModelRuntime>,
}

impl Canaria {
    /// Build every component from configuration.
    pub async fn connect(config: CanariaConfig) -> Result<Self> {
        let store = MlflowStore::new(
            &config.store.tracking_uri,
            ExperimentRef::Name(config.model.experiment.clone()),
            config.store.timeout,
        )?;
        let store: Arc<dyn MetadataStore> = Arc::new(BoundedStore::new(store, config.store.timeout));
        let deployer = build_deployer(&config).await?;
        let runtime = build_runtime(&config)?;
        Self::from_parts(config, store, deployer, runtime)
    }

    /// Wire already constructed adapters.
    pub fn from_parts(
        config: CanariaConfig,
        store: Arc<dyn MetadataStore>,
        deployer: Arc<dyn Deployer>,
        runtime: Arc<dyn ModelRuntime>,
    ) -> Result<Self> {
        let scope = config.model.scope()?;
        let machine = Arc::new(
            StatusStateMachine::new(store.clone(), deployer)
                .with_default_submodel(config.model.submodel_name()),
        );
        let rebalancer = Arc::new(Rebalancer::new(machine.clone()));

        Ok(Self {
            config,
            scope,
            store,
            machine,
            rebalancer,
            runtime,
        })
    }

    pub fn config(&self) -> &CanariaConfig {
        &self.config
    }

    /// Runs this process manages and serves.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn machine(&self) -> &Arc<StatusStateMachine> {
        &self.machine
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    /// A fresh inference service with its own model cache.
    pub fn inference_service(&self) -> InferenceService {
        InferenceService::new(
            self.store.clone(),
            self.runtime.clone(),
            ModelCache::new(self.config.cache.ttl, self.config.cache.capacity),
            self.scope.clone(),
            self.config.model.deployment_mode,
        )
    }

    /// The HTTP application.
    pub fn app(&self, metrics: Option<PrometheusHandle>) -> axum::Router {
        let state = AppState {
            service: Arc::new(self.inference_service()),
            machine: self.machine.clone(),
            rebalancer: self.rebalancer.clone(),
            scope: self.scope.clone(),
        };
        serving::router(state, metrics)
    }
}

/// The serving deployer for the configured runtime.
///
/// The local runtime loads models in-process and deploys nothing.
async fn build_deployer(config: &CanariaConfig) -> Result<Arc<dyn Deployer>> {
    match config.serving.runtime {
        RuntimeKind::Local => Ok(Arc::new(LocalDeployer)),
        RuntimeKind::Remote => build_remote_deployer(config).await,
    }
}

#[cfg(feature = "kube")]
async fn build_remote_deployer(config: &CanariaConfig) -> Result<Arc<dyn Deployer>> {
    use backend::kube::{KubeBackend, KubeJobQueue};
    use backend::Reconciler;

    let client = ::kube::Client::try_default().await?;
    let backend = Arc::new(KubeBackend::new(client.clone(), &config.serving));
    let queue = Arc::new(KubeJobQueue::new(client, &config.serving));
    let reconciler = Reconciler::new(&config.model.name, backend, queue, config.cache.ttl)
        .with_delay_factor(config.cache.ttl, config.serving.removal_delay_factor)?
        .with_timeout(config.serving.timeout);

    info!(
        namespace = %config.serving.namespace(),
        removal_delay_secs = reconciler.removal_delay().as_secs(),
        "Using Kubernetes serving backend"
    );
    Ok(Arc::new(reconciler))
}

#[cfg(not(feature = "kube"))]
async fn build_remote_deployer(_config: &CanariaConfig) -> Result<Arc<dyn Deployer>> {
    Err(CanariaError::Config(
        "remote runtime requires the kube feature".to_string(),
    ))
}

fn build_runtime(config: &CanariaConfig) -> Result<Arc<dyn ModelRuntime>> {
    match config.serving.runtime {
        RuntimeKind::Local => Ok(Arc::new(LocalModel::new(Arc::new(JsonModelLoader::new())))),
        RuntimeKind::Remote => Ok(Arc::new(RemoteModel::new(
            &config.serving.inference_url,
            config.model.name.clone(),
            config.serving.input_name.clone(),
            config.serving.timeout,
        )?)),
    }
}

/// Run the serving process until SIGTERM or SIGINT.
pub async fn run(config: CanariaConfig) -> Result<()> {
    config.validate()?;
    let metrics = observability::install_metrics(&config.observability)?;
    let canaria = Canaria::connect(config).await?;

    let coordinator = ShutdownCoordinator::new();
    tokio::spawn(coordinator.clone().listen_for_signals());
    serve(&canaria, metrics, coordinator).await
}

/// Serve the HTTP application until `coordinator` fires.
pub async fn serve(
    canaria: &Canaria,
    metrics: Option<PrometheusHandle>,
    coordinator: ShutdownCoordinator,
) -> Result<()> {
    let addr = canaria.config.server.bind_addr;
    let listener = TcpListener::bind(addr).await?;
    info!(
        addr = %addr,
        model = %canaria.config.model.name,
        version = %canaria.scope.version,
        mode = ?canaria.config.model.deployment_mode,
        runtime = canaria.runtime.name(),
        "Serving"
    );

    axum::serve(listener, canaria.app(metrics))
        .with_graceful_shutdown(async move { coordinator.wait_for_shutdown().await })
        .await
        .map_err(|e| CanariaError::Network(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_runtime_deploys_nothing() {
        let config = CanariaConfig::development();
        assert!(build_deployer(&config).await.is_ok());
    }

    #[cfg(not(feature = "kube"))]
    #[tokio::test]
    async fn test_remote_runtime_needs_kube_backend() {
        let mut config = CanariaConfig::development();
        config.serving.runtime = RuntimeKind::Remote;
        let err = build_deployer(&config).await.err().unwrap();
        assert!(matches!(err, CanariaError::Config(_)));
    }
}
