//! Cluster access of the ExtendedJob controllers
//!
//! Everything the controllers read or write goes through [`JobKubeClient`]
//! and [`PodLogReader`] so reconcile logic runs against mocks in tests.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubebosh_common::crd::{ExtendedJob, ExtendedJobStatus, TriggerStrategy, LABEL_EJOB_NAME};
use kubebosh_common::error::{is_kube_conflict, is_kube_not_found};
use kubebosh_common::kube_utils::FIELD_MANAGER;

use crate::JobError;

/// Annotation set on a Job once its output has been written
pub const ANNOTATION_OUTPUT_PERSISTED: &str = "kubebosh.dev/output-persisted";

/// Kubernetes operations of the ExtendedJob controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobKubeClient: Send + Sync {
    /// Create a Job; returns false when it already exists
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<bool, JobError>;

    /// Get an ExtendedJob by name
    async fn get_extended_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ExtendedJob>, JobError>;

    /// Set the trigger strategy of an ExtendedJob
    async fn patch_trigger_strategy(
        &self,
        namespace: &str,
        name: &str,
        strategy: TriggerStrategy,
    ) -> Result<(), JobError>;

    /// Replace the status of an ExtendedJob
    async fn patch_extended_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtendedJobStatus,
    ) -> Result<(), JobError>;

    /// Pods created by a Job
    async fn list_job_pods(&self, namespace: &str, job: &str) -> Result<Vec<Pod>, JobError>;

    /// Record on the Job that its output was written
    async fn mark_output_persisted(&self, namespace: &str, job: &str) -> Result<(), JobError>;

    /// Delete a Job, together with its pods when `with_pods` is set
    async fn delete_job(&self, namespace: &str, name: &str, with_pods: bool)
        -> Result<(), JobError>;
}

/// Reads container logs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLogReader: Send + Sync {
    /// Full log of one container of a pod
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, JobError>;
}

/// Real Kubernetes client implementation
pub struct JobKubeClientImpl {
    client: Client,
}

impl JobKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobKubeClient for JobKubeClientImpl {
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<bool, JobError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(true),
            Err(e) if is_kube_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_extended_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ExtendedJob>, JobError> {
        let api: Api<ExtendedJob> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ejob) => Ok(Some(ejob)),
            Err(e) if is_kube_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_trigger_strategy(
        &self,
        namespace: &str,
        name: &str,
        strategy: TriggerStrategy,
    ) -> Result<(), JobError> {
        let api: Api<ExtendedJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "trigger": { "strategy": strategy } } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_extended_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtendedJobStatus,
    ) -> Result<(), JobError> {
        let api: Api<ExtendedJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_job_pods(&self, namespace: &str, job: &str) -> Result<Vec<Pod>, JobError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("job-name={job}"));
        Ok(api.list(&params).await?.items)
    }

    async fn mark_output_persisted(&self, namespace: &str, job: &str) -> Result<(), JobError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { ANNOTATION_OUTPUT_PERSISTED: "true" } }
        });
        api.patch(job, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        with_pods: bool,
    ) -> Result<(), JobError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = if with_pods {
            DeleteParams::background()
        } else {
            DeleteParams::orphan()
        };
        match api.delete(name, &params).await {
            Ok(_) => {
                debug!(job = %name, with_pods, "deleted job");
                Ok(())
            }
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pod log reader backed by the API server
pub struct KubePodLogReader {
    client: Client,
}

impl KubePodLogReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLogReader for KubePodLogReader {
    async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, JobError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        Ok(api.logs(pod, &params).await?)
    }
}

/// Name of the ExtendedJob that created a Job, from its labels
pub fn owning_extended_job(job: &Job) -> Option<&str> {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_EJOB_NAME))
        .map(String::as_str)
}
