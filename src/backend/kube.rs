//! Kubernetes serving backend.
//!
//! Deployments are KServe `InferenceService` objects served by ModelMesh.
//! Delayed removals are Kubernetes `Job`s: an init container sleeps for the
//! delay, then the main container deletes the `InferenceService`. The job lives
//! in the cluster, so a pending removal survives restarts of the process that
//! scheduled it.

use super::{DelayedTaskQueue, DeletionTask, ServingBackend, UpsertOutcome};
use crate::config::ServingConfig;
use crate::error::{CanariaError, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const KSERVE_GROUP: &str = "serving.kserve.io";
const KSERVE_VERSION: &str = "v1beta1";
const KSERVE_KIND: &str = "InferenceService";
const FIELD_MANAGER: &str = "canaria";

/// Retries of a failed removal pod.
const JOB_BACKOFF_LIMIT: i32 = 3;
/// Finished removal jobs are garbage-collected after 20 minutes.
const JOB_TTL_AFTER_FINISHED: i32 = 1200;

fn inference_service_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(KSERVE_GROUP, KSERVE_VERSION, KSERVE_KIND))
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// `InferenceService` objects in one namespace.
pub struct KubeBackend {
    api: Api<DynamicObject>,
    resource: ApiResource,
    namespace: String,
    runtime: String,
    storage_key: String,
    model_format: String,
}

impl KubeBackend {
    pub fn new(client: Client, config: &ServingConfig) -> Self {
        let resource = inference_service_resource();
        let namespace = config.namespace();
        Self {
            api: Api::namespaced_with(client, &namespace, &resource),
            resource,
            namespace,
            runtime: config.runtime_name.clone(),
            storage_key: config.storage_key.clone(),
            model_format: config.model_format.clone(),
        }
    }

    /// Builds the full `InferenceService` object for a deployment.
    fn build_object(&self, deployment: &str, artifact_path: &str) -> DynamicObject {
        let mut object = DynamicObject::new(deployment, &self.resource)
            .within(&self.namespace)
            .data(serde_json::json!({
                "spec": {
                    "predictor": {
                        "model": {
                            "modelFormat": { "name": self.model_format, "version": "1" },
                            "runtime": self.runtime,
                            "storage": {
                                "key": self.storage_key,
                                "path": artifact_path,
                            },
                        },
                    },
                },
            }));
        object.metadata.annotations = Some(BTreeMap::from([
            ("serving.kserve.io/deploymentMode".to_string(), "ModelMesh".to_string()),
            ("openshift.io/display-name".to_string(), deployment.to_string()),
        ]));
        object.metadata.labels = Some(BTreeMap::from([(
            "opendatahub.io/dashboard".to_string(),
            "true".to_string(),
        )]));
        object
    }
}

#[async_trait]
impl ServingBackend for KubeBackend {
    async fn upsert(&self, deployment: &str, artifact_path: &str) -> Result<UpsertOutcome> {
        match self.api.get_opt(deployment).await? {
            Some(_) => {
                let patch = serde_json::json!({
                    "spec": { "predictor": { "model": { "storage": { "path": artifact_path } } } }
                });
                self.api
                    .patch(deployment, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                debug!(deployment = %deployment, "Patched InferenceService");
                Ok(UpsertOutcome::Patched)
            }
            None => {
                let object = self.build_object(deployment, artifact_path);
                self.api.create(&PostParams::default(), &object).await?;
                info!(deployment = %deployment, namespace = %self.namespace, "Created InferenceService");
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn delete(&self, deployment: &str) -> Result<()> {
        match self.api.delete(deployment, &DeleteParams::default()).await {
            Ok(_) => {
                info!(deployment = %deployment, "Deleted InferenceService");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(deployment = %deployment, "InferenceService already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Delayed removals as Kubernetes `Job`s.
pub struct KubeJobQueue {
    api: Api<Job>,
    namespace: String,
    delay_image: String,
    removal_image: String,
    service_account: String,
}

impl KubeJobQueue {
    pub fn new(client: Client, config: &ServingConfig) -> Self {
        let namespace = config.namespace();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            delay_image: config.delay_image.clone(),
            removal_image: config.removal_image.clone(),
            service_account: config.service_account.clone(),
        }
    }

    fn build_job(&self, job_id: &str, delay: Duration, task: &DeletionTask) -> Job {
        let delay_secs = delay.as_secs_f64();
        let labels = BTreeMap::from([
            ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
            ("canaria/deployment".to_string(), task.deployment.clone()),
        ]);

        let delay = Container {
            name: "delay".to_string(),
            image: Some(self.delay_image.clone()),
            command: Some(vec!["/bin/sh".to_string()]),
            args: Some(vec![
                "-ec".to_string(),
                format!("echo sleeping for {0} seconds; sleep {0}", delay_secs),
            ]),
            ..Default::default()
        };

        let remove = Container {
            name: "remove-model".to_string(),
            image: Some(self.removal_image.clone()),
            command: Some(vec!["kubectl".to_string()]),
            args: Some(vec![
                "delete".to_string(),
                "inferenceservices.serving.kserve.io".to_string(),
                task.deployment.clone(),
                "--namespace".to_string(),
                self.namespace.clone(),
                "--ignore-not-found".to_string(),
            ]),
            ..Default::default()
        };

        Job {
            metadata: ObjectMeta {
                name: Some(job_id.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(JOB_BACKOFF_LIMIT),
                ttl_seconds_after_finished: Some(JOB_TTL_AFTER_FINISHED),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.service_account.clone()),
                        restart_policy: Some("Never".to_string()),
                        init_containers: Some(vec![delay]),
                        containers: vec![remove],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DelayedTaskQueue for KubeJobQueue {
    async fn schedule_delayed(&self, job_id: &str, delay: Duration, task: DeletionTask) -> Result<()> {
        self.cancel_delayed(job_id).await?;

        let job = self.build_job(job_id, delay, &task);
        self.api.create(&PostParams::default(), &job).await.map_err(|e| {
            CanariaError::Backend(format!("failed to create removal job {}: {}", job_id, e))
        })?;
        info!(job_id = %job_id, deployment = %task.deployment, "Created removal job");
        Ok(())
    }

    async fn cancel_delayed(&self, job_id: &str) -> Result<bool> {
        let pending = match self.api.get_opt(job_id).await? {
            Some(job) => job
                .status
                .map(|s| s.completion_time.is_none() && s.failed.unwrap_or(0) <= JOB_BACKOFF_LIMIT)
                .unwrap_or(true),
            None => return Ok(false),
        };

        match self.api.delete(job_id, &DeleteParams::background()).await {
            Ok(_) => Ok(pending),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
