//! Core type definitions for canaria.
//!
//! This module contains the typed run record that replaces the store's tabular
//! rows, together with the semantic version and status types used to scope
//! every query to one logical model family.
//!
//! # Key Types
//!
//! - [`Run`]: One trained/logged model instance
//! - [`ModelStatus`]: Lifecycle status (New, Active, Canary, Disabled)
//! - [`SemanticVersion`]: `(major, minor, micro)` triple
//! - [`Scope`]: Which runs a query or rebalance may touch
//!
//! # Examples
//!
//! ```rust
//! use canaria::types::{ModelStatus, Scope, SemanticVersion};
//!
//! let version: SemanticVersion = "1.4".parse().unwrap();
//! assert_eq!(version, SemanticVersion::new(1, 4, 0));
//!
//! let scope = Scope::new(version)
//!     .with_submodel("ranker")
//!     .with_immutable("region", "eu");
//! assert_eq!(scope.submodel_name.as_deref(), Some("ranker"));
//!
//! assert!(ModelStatus::Canary.is_live());
//! assert_eq!(ModelStatus::from_metric(3.0), Some(ModelStatus::Disabled));
//! ```

use crate::error::{CanariaError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque run identifier assigned by the metadata store.
pub type RunId = String;

/// Semantic version of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
}

impl SemanticVersion {
    pub const fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self { major, minor, micro }
    }
}

impl From<(u64, u64, u64)> for SemanticVersion {
    fn from((major, minor, micro): (u64, u64, u64)) -> Self {
        Self::new(major, minor, micro)
    }
}

impl FromStr for SemanticVersion {
    type Err = CanariaError;

    /// Parses `major[.minor[.micro]]`, with an optional leading `v`.
    ///
    /// Missing components default to zero. A trailing pre-release or local
    /// suffix on the last component (`1.2.3rc1`, `1.2.3+abc`) is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(CanariaError::InvalidVersion("empty version".to_string()));
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() > 3 {
            return Err(CanariaError::InvalidVersion(format!(
                "{}: expected at most three components",
                s
            )));
        }

        let mut numbers = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            let is_last = i == parts.len() - 1;
            let digits: &str = if is_last {
                let end = part
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(part.len());
                &part[..end]
            } else {
                part
            };
            numbers[i] = digits.parse().map_err(|_| {
                CanariaError::InvalidVersion(format!("{}: component '{}' is not a number", s, part))
            })?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Production status of a run.
///
/// Any status may move to any other; movement only happens through an
/// explicit transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Registered, not serving traffic.
    New,
    /// Serving its test fraction of traffic.
    Active,
    /// Deployed and eligible for traffic, fraction set by a rebalance.
    Canary,
    /// Never receives traffic.
    Disabled,
}

impl ModelStatus {
    pub const ALL: [ModelStatus; 4] = [
        ModelStatus::New,
        ModelStatus::Active,
        ModelStatus::Canary,
        ModelStatus::Disabled,
    ];

    /// Numeric encoding stored in the `active_state` metric.
    pub fn as_metric(&self) -> f64 {
        match self {
            ModelStatus::New => 0.0,
            ModelStatus::Active => 1.0,
            ModelStatus::Canary => 2.0,
            ModelStatus::Disabled => 3.0,
        }
    }

    /// Decodes the `active_state` metric.
    pub fn from_metric(value: f64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| (s.as_metric() - value).abs() < f64::EPSILON)
    }

    /// Returns true if runs in this status may receive traffic.
    pub fn is_live(&self) -> bool {
        matches!(self, ModelStatus::Active | ModelStatus::Canary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::New => "new",
            ModelStatus::Active => "active",
            ModelStatus::Canary => "canary",
            ModelStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = CanariaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(ModelStatus::New),
            "active" => Ok(ModelStatus::Active),
            "canary" => Ok(ModelStatus::Canary),
            "disabled" => Ok(ModelStatus::Disabled),
            other => Err(CanariaError::Config(format!("unknown model status: {}", other))),
        }
    }
}

/// One trained/logged model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub version: SemanticVersion,
    pub submodel_name: Option<String>,
    pub status: ModelStatus,
    pub test_fraction: f64,
    /// Exact-match filter keys, set once at creation.
    #[serde(default)]
    pub immutable_metadata: BTreeMap<String, String>,
    /// Numeric metadata that may change over time.
    #[serde(default)]
    pub mutable_metadata: BTreeMap<String, f64>,
    /// URI of the persisted model payload.
    pub artifact_location: String,
    /// Completion time, used for newest-first ordering.
    pub end_time: Option<DateTime<Utc>>,
}

impl Run {
    /// Returns true if the run belongs to the given scope.
    pub fn in_scope(&self, scope: &Scope) -> bool {
        if self.version != scope.version {
            return false;
        }
        if let Some(ref submodel) = scope.submodel_name {
            if self.submodel_name.as_ref() != Some(submodel) {
                return false;
            }
        }
        let immutable_ok = scope
            .immutable_metadata
            .iter()
            .all(|(k, v)| self.immutable_metadata.get(k) == Some(v));
        let mutable_ok = scope
            .mutable_metadata
            .iter()
            .all(|(k, v)| self.mutable_metadata.get(k) == Some(v));
        immutable_ok && mutable_ok
    }

    /// Fraction of traffic this run may receive; zero unless the run is live.
    pub fn effective_fraction(&self) -> f64 {
        if self.status.is_live() {
            self.test_fraction
        } else {
            0.0
        }
    }
}

/// Which runs a query or rebalance may touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub version: SemanticVersion,
    pub submodel_name: Option<String>,
    #[serde(default)]
    pub immutable_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub mutable_metadata: BTreeMap<String, f64>,
}

impl Scope {
    pub fn new(version: SemanticVersion) -> Self {
        Self {
            version,
            submodel_name: None,
            immutable_metadata: BTreeMap::new(),
            mutable_metadata: BTreeMap::new(),
        }
    }

    pub fn with_submodel(mut self, name: impl Into<String>) -> Self {
        self.submodel_name = Some(name.into());
        self
    }

    pub fn with_immutable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.immutable_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_mutable(mut self, key: impl Into<String>, value: f64) -> Self {
        self.mutable_metadata.insert(key.into(), value);
        self
    }
}

/// Fields written by a single combined store update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: Option<ModelStatus>,
    pub test_fraction: Option<f64>,
    #[serde(default)]
    pub mutable_metadata: BTreeMap<String, f64>,
}

impl RunUpdate {
    pub fn status(status: ModelStatus, test_fraction: Option<f64>) -> Self {
        Self {
            status: Some(status),
            test_fraction,
            mutable_metadata: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.test_fraction.is_none() && self.mutable_metadata.is_empty()
    }
}

/// A run about to be registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub version: SemanticVersion,
    pub submodel_name: Option<String>,
    #[serde(default)]
    pub immutable_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub mutable_metadata: BTreeMap<String, f64>,
    /// Where the payload was persisted; stores that assign their own
    /// artifact location ignore it.
    pub artifact_location: Option<String>,
}

impl NewRun {
    pub fn new(version: SemanticVersion) -> Self {
        Self {
            version,
            submodel_name: None,
            immutable_metadata: BTreeMap::new(),
            mutable_metadata: BTreeMap::new(),
            artifact_location: None,
        }
    }

    pub fn with_submodel(mut self, name: impl Into<String>) -> Self {
        self.submodel_name = Some(name.into());
        self
    }

    pub fn with_artifact(mut self, location: impl Into<String>) -> Self {
        self.artifact_location = Some(location.into());
        self
    }

    pub fn with_immutable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.immutable_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_mutable(mut self, key: impl Into<String>, value: f64) -> Self {
        self.mutable_metadata.insert(key.into(), value);
        self
    }
}
