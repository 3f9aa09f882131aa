//! Model runtimes.
//!
//! A runtime turns a run into something that can answer predictions. The
//! runtime is picked once from configuration:
//!
//! - [`LocalModel`]: loads the artifact into the serving process through a
//!   [`ModelLoader`]
//! - [`RemoteModel`]: forwards to the serving backend's KServe v2 endpoint for
//!   the run's deployment

use crate::backend::deployment_identity;
use crate::error::{http_error, CanariaError, Result};
use crate::types::Run;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Answers predictions for one run.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, input: &[f32]) -> Result<Vec<f32>>;
}

/// Resolves a run into a predictor.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn resolve(&self, run: &Run) -> Result<Arc<dyn Predictor>>;

    fn name(&self) -> &'static str;
}

/// Deserializes a run's artifact into an in-process predictor.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, artifact_location: &str) -> Result<Arc<dyn Predictor>>;
}

/// In-process runtime.
pub struct LocalModel {
    loader: Arc<dyn ModelLoader>,
}

impl LocalModel {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self { loader }
    }
}

#[async_trait]
impl ModelRuntime for LocalModel {
    async fn resolve(&self, run: &Run) -> Result<Arc<dyn Predictor>> {
        let predictor = self.loader.load(&run.artifact_location).await?;
        info!(run_id = %run.run_id, location = %run.artifact_location, "Loaded model");
        Ok(predictor)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Linear model `y = w . x + b`, the artifact format of [`JsonModelLoader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f32>,
    #[serde(default)]
    pub bias: f32,
}

#[async_trait]
impl Predictor for LinearModel {
    async fn predict(&self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.weights.len() {
            return Err(CanariaError::Prediction(format!(
                "expected {} features, got {}",
                self.weights.len(),
                input.len()
            )));
        }
        let y = self.weights.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + self.bias;
        Ok(vec![y])
    }
}

/// Loads `model.json` from a local artifact directory.
#[derive(Debug, Clone, Default)]
pub struct JsonModelLoader {
    /// Prefix for relative artifact locations.
    root: Option<PathBuf>,
}

impl JsonModelLoader {
    pub const FILE_NAME: &'static str = "model.json";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn model_path(&self, artifact_location: &str) -> PathBuf {
        let location = artifact_location
            .strip_prefix("file://")
            .unwrap_or(artifact_location);
        let path = match &self.root {
            Some(root) => root.join(location.trim_start_matches('/')),
            None => PathBuf::from(location),
        };
        path.join(Self::FILE_NAME)
    }
}

#[async_trait]
impl ModelLoader for JsonModelLoader {
    async fn load(&self, artifact_location: &str) -> Result<Arc<dyn Predictor>> {
        let path = self.model_path(artifact_location);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            CanariaError::Prediction(format!("cannot read model at {}: {}", path.display(), e))
        })?;
        let model: LinearModel = serde_json::from_slice(&bytes)?;
        debug!(path = %path.display(), features = model.weights.len(), "Parsed linear model");
        Ok(Arc::new(model))
    }
}

/// Remote runtime calling the serving backend's inference endpoint.
pub struct RemoteModel {
    client: Client,
    base_url: String,
    model_name: String,
    input_name: String,
    timeout: Duration,
}

impl RemoteModel {
    pub fn new(
        base_url: &str,
        model_name: impl Into<String>,
        input_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CanariaError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_name: model_name.into(),
            input_name: input_name.into(),
            timeout,
        })
    }
}

#[async_trait]
impl ModelRuntime for RemoteModel {
    async fn resolve(&self, run: &Run) -> Result<Arc<dyn Predictor>> {
        let deployment = deployment_identity(&self.model_name, &run.run_id);
        Ok(Arc::new(RemotePredictor {
            client: self.client.clone(),
            url: format!("{}/v2/models/{}/infer", self.base_url, deployment),
            input_name: self.input_name.clone(),
            timeout: self.timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct InferRequest<'a> {
    pub(crate) inputs: Vec<InferTensor<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InferTensor<'a> {
    pub(crate) name: &'a str,
    pub(crate) shape: [usize; 2],
    pub(crate) datatype: &'static str,
    pub(crate) data: &'a [f32],
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    outputs: Vec<OutputTensor>,
}

#[derive(Debug, Deserialize)]
struct OutputTensor {
    data: Vec<f32>,
}

/// KServe v2 client for one deployment.
struct RemotePredictor {
    client: Client,
    url: String,
    input_name: String,
    timeout: Duration,
}

#[async_trait]
impl Predictor for RemotePredictor {
    async fn predict(&self, input: &[f32]) -> Result<Vec<f32>> {
        let body = InferRequest {
            inputs: vec![InferTensor {
                name: &self.input_name,
                shape: [1, input.len()],
                datatype: "FP32",
                data: input,
            }],
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(e, "inference", self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CanariaError::Prediction(format!("{} returned {}: {}", self.url, status, text)));
        }

        let parsed: InferResponse = resp
            .json()
            .await
            .map_err(|e| http_error(e, "inference", self.timeout))?;
        parsed
            .outputs
            .into_iter()
            .next()
            .map(|o| o.data)
            .ok_or_else(|| CanariaError::Prediction("inference response has no outputs".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_linear_model() {
        let model = LinearModel {
            weights: vec![0.5, 2.0],
            bias: 1.0,
        };
        assert_eq!(model.predict(&[2.0, 1.0]).await.unwrap(), vec![4.0]);
        assert!(matches!(model.predict(&[1.0]).await, Err(CanariaError::Prediction(_))));
    }

    #[tokio::test]
    async fn test_json_loader() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("0/r1/artifacts");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("model.json"), r#"{"weights": [1.0, 1.0], "bias": 0.5}"#).unwrap();

        let loader = JsonModelLoader::with_root(dir.path());
        let model = loader.load("0/r1/artifacts").await.unwrap();
        assert_eq!(model.predict(&[1.0, 2.0]).await.unwrap(), vec![3.5]);

        let absolute = JsonModelLoader::new();
        let location = format!("file://{}", run_dir.display());
        assert!(absolute.load(&location).await.is_ok());
    }

    #[tokio::test]
    async fn test_json_loader_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = JsonModelLoader::with_root(dir.path());
        assert!(matches!(loader.load("nope").await, Err(CanariaError::Prediction(_))));
    }

    #[test]
    fn test_infer_request_shape() {
        let data = [0.1f32, 0.2, 0.3];
        let body = InferRequest {
            inputs: vec![InferTensor {
                name: "dense_input",
                shape: [1, data.len()],
                datatype: "FP32",
                data: &data,
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["inputs"][0]["name"], "dense_input");
        assert_eq!(json["inputs"][0]["shape"], serde_json::json!([1, 3]));
        assert_eq!(json["inputs"][0]["datatype"], "FP32");
    }

    #[tokio::test]
    async fn test_remote_resolves_deployment_url() {
        let runtime = RemoteModel::new(
            "http://modelmesh-serving:8008/",
            "FraudModel",
            "dense_input",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(runtime.name(), "remote");
        assert_eq!(
            format!("{}/v2/models/{}/infer", runtime.base_url, deployment_identity(&runtime.model_name, "r1")),
            "http://modelmesh-serving:8008/v2/models/fraud-model-r1/infer"
        );
    }
}
