//! Logging and metrics setup.

use crate::config::ObservabilityConfig;
use crate::error::{CanariaError, Result};
use crate::types::ModelStatus;
use ::tracing::info;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| CanariaError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| CanariaError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Install the Prometheus recorder, if metrics are enabled.
///
/// The handle renders the exposition text served on `/metrics`.
pub fn install_metrics(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    if !config.metrics_enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CanariaError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();
    info!("Prometheus recorder installed");
    Ok(Some(handle))
}

/// Register the metrics exported before their first event.
fn register_metrics() {
    for status in ModelStatus::ALL {
        counter!("canaria_transitions_total", "status" => status.as_str()).absolute(0);
    }
    counter!("canaria_runs_registered_total").absolute(0);
    counter!("canaria_cache_hits_total").absolute(0);
    counter!("canaria_cache_misses_total").absolute(0);
    counter!("canaria_predictions_total").absolute(0);
    counter!("canaria_prediction_errors_total").absolute(0);
    counter!("canaria_backend_upserts_total").absolute(0);
    counter!("canaria_backend_removals_scheduled_total").absolute(0);
    counter!("canaria_deployment_failures_total").absolute(0);
}
