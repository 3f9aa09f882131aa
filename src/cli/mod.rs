//! Command-line interface for canaria.

use crate::types::ModelStatus;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// canaria - lifecycle and canary routing for trained model runs.
#[derive(Parser)]
#[command(name = "canaria")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANARIA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "CANARIA_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the inference and admin HTTP server
    Serve {
        /// Bind address, overrides the configuration
        #[arg(long)]
        bind: Option<String>,
    },

    /// Register a new run in status New
    Register {
        /// Artifact location of the run
        #[arg(long)]
        artifact: String,

        /// Semantic version, defaults to the configured model version
        #[arg(long)]
        version: Option<String>,

        /// Submodel name, defaults to the configured one
        #[arg(long)]
        submodel: Option<String>,

        /// Immutable metadata (format: key=value), repeatable
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,

        /// Mutable numeric metadata (format: key=value), repeatable
        #[arg(long = "metric", value_parser = parse_key_number)]
        metrics: Vec<(String, f64)>,
    },

    /// List runs of the configured scope, newest first
    List {
        /// Only runs in this status
        #[arg(long)]
        status: Option<ModelStatus>,
    },

    /// Set a run Active at fraction 1.0 and deploy it
    Enable { run_id: String },

    /// Disable a run and schedule its undeployment
    Disable { run_id: String },

    /// Put a run in Canary and deploy it
    Canary { run_id: String },

    /// Rebalance traffic across the configured scope
    Rebalance {
        /// Run weight (format: run_id=weight), repeatable. None drains the scope.
        #[arg(long = "weight", value_parser = parse_key_number)]
        weights: Vec<(String, f64)>,

        /// Only rebalance runs in this live status, keeping it
        #[arg(long)]
        cohort: Option<ModelStatus>,
    },

    /// Score live runs on a labelled sample file and rebalance on the result
    Evaluate {
        /// JSON file of `[{"features": [..], "label": 0|1}]`
        #[arg(long)]
        samples: PathBuf,

        /// Score a candidate must exceed
        #[arg(long, default_value_t = crate::evaluation::DEFAULT_THRESHOLD)]
        threshold: f64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parses `key=value`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Parses `key=number`.
pub fn parse_key_number(s: &str) -> Result<(String, f64), String> {
    let (key, value) = parse_key_value(s)?;
    let number = value
        .parse::<f64>()
        .map_err(|_| format!("'{}' is not a number", value))?;
    Ok((key, number))
}
