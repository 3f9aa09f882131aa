//! canaria CLI - Main entry point.

use anyhow::Context;
use canaria::cli::{Cli, Commands};
use canaria::config::CanariaConfig;
use canaria::evaluation::{AccuracyScorer, Evaluator};
use canaria::lifecycle::RebalanceMode;
use canaria::store::list_runs;
use canaria::types::{NewRun, SemanticVersion};
use canaria::Canaria;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Deserialize)]
struct Sample {
    features: Vec<f32>,
    label: f32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => CanariaConfig::from_file(path)?,
        None => CanariaConfig::default(),
    };
    config.apply_env()?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    canaria::observability::init(&config.observability)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(addr) = bind {
                config.server.bind_addr = addr.parse().context("invalid bind address")?;
            }
            canaria::run(config).await?;
        }

        Commands::Register {
            artifact,
            version,
            submodel,
            params,
            metrics,
        } => {
            let app = Canaria::connect(config).await?;
            let version: SemanticVersion = match version {
                Some(v) => v.parse()?,
                None => app.scope().version,
            };
            let mut run = NewRun::new(version).with_artifact(artifact);
            if let Some(name) = submodel {
                run = run.with_submodel(name);
            }
            for (key, value) in params {
                run = run.with_immutable(key, value);
            }
            for (key, value) in metrics {
                run = run.with_mutable(key, value);
            }
            print_json(&app.machine().register(run).await?)?;
        }

        Commands::List { status } => {
            let app = Canaria::connect(config).await?;
            let runs = list_runs(app.store().as_ref(), app.scope(), status).await?;
            print_json(&runs)?;
        }

        Commands::Enable { run_id } => {
            let app = Canaria::connect(config).await?;
            print_json(&app.machine().enable(&run_id).await?)?;
        }

        Commands::Disable { run_id } => {
            let app = Canaria::connect(config).await?;
            print_json(&app.machine().disable(&run_id).await?)?;
        }

        Commands::Canary { run_id } => {
            let app = Canaria::connect(config).await?;
            print_json(&app.machine().canary(&run_id).await?)?;
        }

        Commands::Rebalance { weights, cohort } => {
            let app = Canaria::connect(config).await?;
            let weights: BTreeMap<String, f64> = weights.into_iter().collect();
            let mode = match cohort {
                Some(status) => RebalanceMode::Cohort(status),
                None => RebalanceMode::Promote,
            };
            let report = app.rebalancer().rebalance(&weights, app.scope(), mode).await?;
            print_json(&report)?;
        }

        Commands::Evaluate { samples, threshold } => {
            let app = Canaria::connect(config).await?;
            let samples = load_samples(&samples)?;
            let scorer = AccuracyScorer::new(app.runtime().clone(), samples);
            let evaluator = Evaluator::new(app.store().clone(), app.rebalancer().clone())
                .with_threshold(threshold);
            let report = evaluator.evaluate(app.scope(), &scorer).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn load_samples(path: &Path) -> anyhow::Result<Vec<(Vec<f32>, f32)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read samples from {}", path.display()))?;
    let samples: Vec<Sample> = serde_json::from_str(&content).context("invalid samples file")?;
    Ok(samples.into_iter().map(|s| (s.features, s.label)).collect())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
