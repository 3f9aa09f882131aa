//! Configuration module for canaria.

use crate::error::{CanariaError, Result};
use crate::types::{Scope, SemanticVersion};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Serving runtime flag.
pub const ENV_USE_SERVING_RUNTIME: &str = "CANARIA_USE_SERVING_RUNTIME";
/// Deployment environment, appended to the serving namespace.
pub const ENV_ENVIRONMENT: &str = "CANARIA_ENVIRONMENT";
/// Metadata store tracking URI.
pub const ENV_TRACKING_URI: &str = "CANARIA_TRACKING_URI";

/// Main configuration for canaria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanariaConfig {
    /// Model family configuration.
    #[serde(default)]
    pub model: ModelConfig,
    /// Model cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Serving runtime and backend configuration.
    #[serde(default)]
    pub serving: ServingConfig,
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl CanariaConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CanariaError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CanariaError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `CANARIA_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_USE_SERVING_RUNTIME) {
            self.serving.runtime = if parse_bool(&value)? {
                RuntimeKind::Remote
            } else {
                RuntimeKind::Local
            };
        }
        if let Some(env) = lookup(ENV_ENVIRONMENT) {
            self.serving.environment = Some(env);
        }
        if let Some(uri) = lookup(ENV_TRACKING_URI) {
            self.store.tracking_uri = uri;
        }
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.model.name.trim().is_empty() {
            return Err(CanariaError::InvalidConfig {
                field: "model.name".to_string(),
                reason: "Model name must not be empty".to_string(),
            });
        }

        self.model.semantic_version()?;

        if self.cache.ttl.is_zero() {
            return Err(CanariaError::InvalidConfig {
                field: "cache.ttl".to_string(),
                reason: "Cache TTL must be non-zero".to_string(),
            });
        }

        if self.cache.capacity == 0 {
            return Err(CanariaError::InvalidConfig {
                field: "cache.capacity".to_string(),
                reason: "Cache capacity must be non-zero".to_string(),
            });
        }

        if !self.serving.removal_delay_factor.is_finite() || self.serving.removal_delay_factor < 1.5 {
            return Err(CanariaError::InvalidConfig {
                field: "serving.removal_delay_factor".to_string(),
                reason: "Removal delay must be at least 1.5 times the cache TTL".to_string(),
            });
        }

        if self.serving.runtime == RuntimeKind::Remote && self.serving.inference_url.is_empty() {
            return Err(CanariaError::InvalidConfig {
                field: "serving.inference_url".to_string(),
                reason: "Remote runtime requires an inference URL".to_string(),
            });
        }

        if self.serving.runtime == RuntimeKind::Remote && !cfg!(feature = "kube") {
            return Err(CanariaError::InvalidConfig {
                field: "serving.runtime".to_string(),
                reason: "Remote runtime requires the kube feature".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            model: ModelConfig {
                name: "dev-model".to_string(),
                version: "0.0.1".to_string(),
                experiment: "dev-model".to_string(),
                submodel: None,
                deployment_mode: DeploymentMode::Weighted,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(10),
                capacity: 10,
            },
            store: StoreConfig {
                tracking_uri: "http://127.0.0.1:5000".to_string(),
                timeout: Duration::from_secs(5),
            },
            serving: ServingConfig {
                runtime: RuntimeKind::Local,
                environment: Some("dev".to_string()),
                ..ServingConfig::default()
            },
            server: ServerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
        }
    }
}

/// Parses the truthy and falsy spellings accepted by the environment flags.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
        other => Err(CanariaError::Config(format!("invalid truth value: {}", other))),
    }
}

/// How the serving process answers requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Newest Active run only.
    Single,
    /// Weighted-random across the active and canary runs.
    #[default]
    Weighted,
}

/// Model family configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family name, used in deployment identities.
    pub name: String,
    /// Semantic version served by this process.
    pub version: String,
    /// Experiment holding the family's runs.
    pub experiment: String,
    /// Submodel discriminator; defaults to the model name.
    #[serde(default)]
    pub submodel: Option<String>,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
}

impl ModelConfig {
    pub fn semantic_version(&self) -> Result<SemanticVersion> {
        self.version.parse()
    }

    /// Submodel name, falling back to the model name.
    pub fn submodel_name(&self) -> &str {
        self.submodel.as_deref().unwrap_or(&self.name)
    }

    /// Scope of the runs this process serves.
    pub fn scope(&self) -> Result<Scope> {
        Ok(Scope::new(self.semantic_version()?).with_submodel(self.submodel_name()))
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "model".to_string(),
            version: "0.0.1".to_string(),
            experiment: "model".to_string(),
            submodel: None,
            deployment_mode: DeploymentMode::Weighted,
        }
    }
}

/// Model cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: crate::cache::DEFAULT_TTL,
            capacity: crate::cache::DEFAULT_CAPACITY,
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Tracking server base URI.
    pub tracking_uri: String,
    /// Deadline for each store call.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tracking_uri: "http://mlflow:5000".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Where models are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Artifacts are loaded in-process.
    #[default]
    Local,
    /// Inference is delegated to the serving backend.
    Remote,
}

/// Serving runtime and backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    pub runtime: RuntimeKind,
    /// Base URL of the backend's inference endpoint.
    pub inference_url: String,
    /// Name of the single input tensor.
    pub input_name: String,
    /// Deadline for each backend call.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Namespace prefix; the environment is appended.
    pub namespace_prefix: String,
    #[serde(default)]
    pub environment: Option<String>,
    /// Serving runtime that hosts the models.
    pub runtime_name: String,
    /// Storage secret key used to fetch artifacts.
    pub storage_key: String,
    pub model_format: String,
    /// Image of the removal job's delay container.
    pub delay_image: String,
    /// Image of the removal job's delete container.
    pub removal_image: String,
    pub service_account: String,
    /// Removal delay as a multiple of the cache TTL.
    pub removal_delay_factor: f64,
}

impl ServingConfig {
    /// `<prefix>-<environment>`, or the bare prefix without an environment.
    pub fn namespace(&self) -> String {
        match self.environment.as_deref() {
            Some(env) if !env.is_empty() => format!("{}-{}", self.namespace_prefix, env),
            _ => self.namespace_prefix.clone(),
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Local,
            inference_url: "http://modelmesh-serving:8008".to_string(),
            input_name: "dense_input".to_string(),
            timeout: Duration::from_secs(10),
            namespace_prefix: "canaria".to_string(),
            environment: None,
            runtime_name: "canaria".to_string(),
            storage_key: "aws-connection-my-storage".to_string(),
            model_format: "onnx".to_string(),
            delay_image: "registry.access.redhat.com/ubi9/ubi-minimal".to_string(),
            removal_image: "bitnami/kubectl:latest".to_string(),
            service_account: "model-controller".to_string(),
            removal_delay_factor: 1.5,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the serving app.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Expose Prometheus metrics on `/metrics`.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CanariaConfig::default();
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.serving.runtime, RuntimeKind::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = CanariaConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.serving.namespace(), "canaria-dev");
    }

    #[test]
    fn test_parse_bool() {
        for v in ["y", "YES", "t", "True", "on", "1"] {
            assert!(parse_bool(v).unwrap());
        }
        for v in ["n", "no", "F", "false", "OFF", "0"] {
            assert!(!parse_bool(v).unwrap());
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_USE_SERVING_RUNTIME, "true"),
            (ENV_ENVIRONMENT, "prod"),
            (ENV_TRACKING_URI, "http://tracking:5000"),
        ]);
        let mut config = CanariaConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.serving.runtime, RuntimeKind::Remote);
        assert_eq!(config.serving.namespace(), "canaria-prod");
        assert_eq!(config.store.tracking_uri, "http://tracking:5000");
    }

    #[test]
    fn test_bad_env_flag() {
        let mut config = CanariaConfig::default();
        let err = config.apply_overrides(|k| (k == ENV_USE_SERVING_RUNTIME).then(|| "sometimes".to_string()));
        assert!(matches!(err, Err(CanariaError::Config(_))));
    }

    #[test]
    fn test_validate_delay_factor() {
        let mut config = CanariaConfig::default();
        config.serving.removal_delay_factor = 1.0;
        assert!(matches!(config.validate(), Err(CanariaError::InvalidConfig { .. })));
    }

    #[test]
    fn test_validate_remote_runtime_feature() {
        let mut config = CanariaConfig::default();
        config.serving.runtime = RuntimeKind::Remote;
        config.serving.inference_url = "http://modelmesh:8008".to_string();
        let result = config.validate();
        if cfg!(feature = "kube") {
            assert!(result.is_ok());
        } else {
            assert!(matches!(
                result,
                Err(CanariaError::InvalidConfig { ref field, .. }) if field == "serving.runtime"
            ));
        }
    }

    #[test]
    fn test_validate_version() {
        let mut config = CanariaConfig::default();
        config.model.version = "one.two".to_string();
        assert!(matches!(config.validate(), Err(CanariaError::InvalidVersion(_))));
    }

    #[test]
    fn test_model_scope() {
        let model = ModelConfig {
            name: "fraud".to_string(),
            version: "1.2".to_string(),
            ..ModelConfig::default()
        };
        let scope = model.scope().unwrap();
        assert_eq!(scope.version, SemanticVersion::new(1, 2, 0));
        assert_eq!(scope.submodel_name.as_deref(), Some("fraud"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "model": {{"name": "fraud", "version": "1.0.0", "experiment": "fraud", "deployment_mode": "single"}},
                "cache": {{"ttl": "10m", "capacity": 4}},
                "serving": {{
                    "runtime": "remote",
                    "inference_url": "http://modelmesh-serving:8008",
                    "input_name": "dense_input",
                    "timeout": "5s",
                    "namespace_prefix": "fraud",
                    "environment": "staging",
                    "runtime_name": "fraud",
                    "storage_key": "aws-connection-my-storage",
                    "model_format": "onnx",
                    "delay_image": "busybox",
                    "removal_image": "bitnami/kubectl",
                    "service_account": "model-controller",
                    "removal_delay_factor": 2.0
                }}
            }}"#
        )
        .unwrap();

        let config = CanariaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.deployment_mode, DeploymentMode::Single);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.serving.namespace(), "fraud-staging");
        assert_eq!(config.serving.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(humantime_serde::parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(humantime_serde::parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(humantime_serde::parse_duration("soon").is_err());
    }
}
