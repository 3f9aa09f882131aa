//! MLflow tracking server adapter.
//!
//! Runs are stored as MLflow runs inside one experiment. Immutable fields are
//! params, mutable fields are metrics:
//!
//! | field                | MLflow key                      |
//! |----------------------|---------------------------------|
//! | submodel name        | `params.submodel_name`          |
//! | semantic version     | `params.{major,minor,micro}_version` |
//! | status               | `metrics.active_state`          |
//! | traffic fraction     | `metrics.test_fraction`         |
//! | immutable metadata   | any other param                 |
//! | mutable metadata     | any other metric                |

use super::{
    MetadataStore, SearchFilter, METRIC_FRACTION, METRIC_STATUS, PARAM_MAJOR, PARAM_MICRO,
    PARAM_MINOR, PARAM_SUBMODEL,
};
use crate::error::{http_error, CanariaError, Result};
use crate::types::{ModelStatus, NewRun, Run, RunUpdate, SemanticVersion};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const API_PREFIX: &str = "/api/2.0/mlflow";
const MAX_RESULTS: u32 = 1000;

/// Which experiment holds the model family's runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentRef {
    Id(String),
    Name(String),
}

/// MLflow REST client.
pub struct MlflowStore {
    client: Client,
    base_url: String,
    experiment: ExperimentRef,
    experiment_id: OnceCell<String>,
    timeout: Duration,
}

impl MlflowStore {
    /// Create a new client against a tracking server.
    pub fn new(tracking_uri: &str, experiment: ExperimentRef, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("canaria/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CanariaError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: tracking_uri.trim_end_matches('/').to_string(),
            experiment,
            experiment_id: OnceCell::new(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    /// Resolves the experiment id once; a missing experiment is `NotFound`.
    async fn experiment_id(&self) -> Result<&str> {
        let id = self
            .experiment_id
            .get_or_try_init(|| self.resolve_experiment())
            .await?;
        Ok(id.as_str())
    }

    async fn resolve_experiment(&self) -> Result<String> {
        match &self.experiment {
            ExperimentRef::Id(id) => Ok(id.clone()),
            ExperimentRef::Name(name) => {
                let resp: GetExperimentResponse = self
                    .get("/experiments/get-by-name", &[("experiment_name", name.as_str())])
                    .await?;
                info!(experiment = %name, id = %resp.experiment.experiment_id, "Resolved experiment");
                Ok(resp.experiment.experiment_id)
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| http_error(e, path, self.timeout))?;
        self.handle_response(path, resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| http_error(e, path, self.timeout))?;
        self.handle_response(path, resp).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, path: &str, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(|e| http_error(e, path, self.timeout));
        }

        let body = resp.text().await.unwrap_or_default();
        let error: Option<ApiError> = serde_json::from_str(&body).ok();
        let message = error
            .as_ref()
            .map(|e| format!("{}: {}", e.error_code, e.message))
            .unwrap_or(body);

        let not_found = status == StatusCode::NOT_FOUND
            || error.map(|e| e.error_code == "RESOURCE_DOES_NOT_EXIST").unwrap_or(false);
        if not_found {
            Err(CanariaError::NotFound(message))
        } else {
            Err(CanariaError::Store(format!("{} returned {}: {}", path, status, message)))
        }
    }

    async fn log_batch(&self, run_id: &str, params: Vec<Param>, metrics: Vec<Metric>) -> Result<()> {
        if params.is_empty() && metrics.is_empty() {
            return Ok(());
        }
        let body = LogBatchRequest {
            run_id: run_id.to_string(),
            params,
            metrics,
        };
        let _: serde_json::Value = self.post("/runs/log-batch", &body).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MlflowStore {
    async fn search(&self, filter: &SearchFilter) -> Result<Vec<Run>> {
        let experiment_id = self.experiment_id().await?.to_string();
        let filter_string = build_filter_string(filter);
        debug!(filter = %filter_string, "Searching runs");

        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let body = SearchRunsRequest {
                experiment_ids: vec![experiment_id.clone()],
                filter: filter_string.clone(),
                run_view_type: "ACTIVE_ONLY",
                max_results: MAX_RESULTS,
                order_by: vec!["attributes.end_time DESC".to_string()],
                page_token: page_token.take(),
            };
            let resp: SearchRunsResponse = self.post("/runs/search", &body).await?;
            for run in resp.runs {
                runs.push(run.into_run()?);
            }
            match resp.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(runs)
    }

    async fn create(&self, new_run: NewRun) -> Result<Run> {
        let experiment_id = self.experiment_id().await?.to_string();
        let now = Utc::now().timestamp_millis();

        let created: CreateRunResponse = self
            .post(
                "/runs/create",
                &serde_json::json!({ "experiment_id": experiment_id, "start_time": now }),
            )
            .await?;
        let run_id = created.run.info.run_id;

        let mut params = vec![
            Param::new(PARAM_MAJOR, new_run.version.major.to_string()),
            Param::new(PARAM_MINOR, new_run.version.minor.to_string()),
            Param::new(PARAM_MICRO, new_run.version.micro.to_string()),
        ];
        if let Some(ref submodel) = new_run.submodel_name {
            params.push(Param::new(PARAM_SUBMODEL, submodel.clone()));
        }
        params.extend(new_run.immutable_metadata.into_iter().map(|(k, v)| Param::new(k, v)));

        let mut metrics = vec![
            Metric::new(METRIC_STATUS, ModelStatus::New.as_metric(), now),
            Metric::new(METRIC_FRACTION, 0.0, now),
        ];
        metrics.extend(new_run.mutable_metadata.into_iter().map(|(k, v)| Metric::new(k, v, now)));

        self.log_batch(&run_id, params, metrics).await?;

        let _: serde_json::Value = self
            .post(
                "/runs/update",
                &serde_json::json!({
                    "run_id": run_id,
                    "status": "FINISHED",
                    "end_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;

        info!(run_id = %run_id, "Registered run");
        self.get_by_id(&run_id).await
    }

    async fn update(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        // Logging to a run that does not exist is a NotFound from the server.
        let now = Utc::now().timestamp_millis();
        let mut metrics = Vec::new();
        if let Some(status) = update.status {
            metrics.push(Metric::new(METRIC_STATUS, status.as_metric(), now));
        }
        if let Some(fraction) = update.test_fraction {
            metrics.push(Metric::new(METRIC_FRACTION, fraction, now));
        }
        for (key, value) in &update.mutable_metadata {
            metrics.push(Metric::new(key.clone(), *value, now));
        }
        self.log_batch(run_id, Vec::new(), metrics).await
    }

    async fn get_by_id(&self, run_id: &str) -> Result<Run> {
        let resp: GetRunResponse = self.get("/runs/get", &[("run_id", run_id)]).await?;
        resp.run.into_run()
    }
}

/// Translates a typed filter into the MLflow search filter language.
pub fn build_filter_string(filter: &SearchFilter) -> String {
    let scope = &filter.scope;
    let mut clauses = vec![
        "attributes.status = 'FINISHED'".to_string(),
        param_clause(PARAM_MAJOR, &scope.version.major.to_string()),
        param_clause(PARAM_MINOR, &scope.version.minor.to_string()),
        param_clause(PARAM_MICRO, &scope.version.micro.to_string()),
    ];

    if let Some(status) = filter.status {
        clauses.push(metric_clause(METRIC_STATUS, status.as_metric()));
    }
    if let Some(ref submodel) = scope.submodel_name {
        clauses.push(param_clause(PARAM_SUBMODEL, submodel));
    }
    for (key, value) in &scope.immutable_metadata {
        clauses.push(param_clause(key, value));
    }
    for (key, value) in &scope.mutable_metadata {
        clauses.push(metric_clause(key, *value));
    }

    clauses.join(" and ")
}

fn param_clause(key: &str, value: &str) -> String {
    format!("params.{} = \"{}\"", key, value.replace('"', "\\\""))
}

fn metric_clause(key: &str, value: f64) -> String {
    format!("metrics.{} = {}", key, value)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Serialize)]
struct SearchRunsRequest {
    experiment_ids: Vec<String>,
    filter: String,
    run_view_type: &'static str,
    max_results: u32,
    order_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<MlflowRun>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: MlflowRun,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: MlflowRun,
}

#[derive(Debug, Serialize)]
struct LogBatchRequest {
    run_id: String,
    params: Vec<Param>,
    metrics: Vec<Metric>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Param {
    key: String,
    value: String,
}

impl Param {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Metric {
    key: String,
    value: f64,
    #[serde(default, deserialize_with = "de_int64")]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "de_int64")]
    step: Option<i64>,
}

impl Metric {
    fn new(key: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: Some(timestamp),
            step: Some(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MlflowRun {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
    #[serde(default)]
    artifact_uri: String,
    #[serde(default, deserialize_with = "de_int64")]
    end_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RunData {
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    params: Vec<Param>,
}

/// The REST API renders int64 fields either as numbers or as strings.
fn de_int64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_i64()),
        Some(serde_json::Value::String(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!("invalid int64: {}", other))),
    }
}

impl MlflowRun {
    fn into_run(self) -> Result<Run> {
        let run_id = self.info.run_id;
        let mut params: BTreeMap<String, String> =
            self.data.params.into_iter().map(|p| (p.key, p.value)).collect();
        let mut metrics: BTreeMap<String, f64> =
            self.data.metrics.into_iter().map(|m| (m.key, m.value)).collect();

        let mut version_part = |key: &str| -> Result<u64> {
            let raw = params.remove(key).ok_or_else(|| {
                CanariaError::Store(format!("run {} has no {} param", run_id, key))
            })?;
            raw.parse().map_err(|_| {
                CanariaError::InvalidVersion(format!("run {}: {} = {}", run_id, key, raw))
            })
        };
        let version = SemanticVersion::new(
            version_part(PARAM_MAJOR)?,
            version_part(PARAM_MINOR)?,
            version_part(PARAM_MICRO)?,
        );

        let status = match metrics.remove(METRIC_STATUS) {
            Some(value) => ModelStatus::from_metric(value).ok_or_else(|| {
                CanariaError::Store(format!("run {} has unknown active_state {}", run_id, value))
            })?,
            None => ModelStatus::New,
        };
        let test_fraction = metrics.remove(METRIC_FRACTION).unwrap_or(0.0);
        let submodel_name = params.remove(PARAM_SUBMODEL);
        let end_time: Option<DateTime<Utc>> = self
            .info
            .end_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Run {
            run_id,
            version,
            submodel_name,
            status,
            test_fraction,
            immutable_metadata: params,
            mutable_metadata: metrics,
            artifact_location: self.info.artifact_uri,
            end_time,
        })
    }
}
