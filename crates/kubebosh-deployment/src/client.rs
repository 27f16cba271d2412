//! Cluster access of the BoshDeployment controller

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use kubebosh_common::crd::{BoshDeployment, BoshDeploymentStatus};
use kubebosh_common::kube_utils::{ApplyBatch, FIELD_MANAGER};
use kubebosh_common::registry::{ResourceKind, ResourceRegistry};
use kubebosh_manifest::converter::KubeResources;

use crate::DeploymentError;

/// Kubernetes operations of the BoshDeployment controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentKubeClient: Send + Sync {
    /// Replace the status of a BoshDeployment
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BoshDeploymentStatus,
    ) -> Result<(), DeploymentError>;

    /// Server-side apply converted resources, returning how many were applied
    async fn apply_resources(
        &self,
        namespace: &str,
        resources: &KubeResources,
    ) -> Result<usize, DeploymentError>;
}

/// Real Kubernetes client implementation
pub struct DeploymentKubeClientImpl {
    client: Client,
    registry: Arc<ResourceRegistry>,
}

impl DeploymentKubeClientImpl {
    pub fn new(client: Client, registry: Arc<ResourceRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl DeploymentKubeClient for DeploymentKubeClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BoshDeploymentStatus,
    ) -> Result<(), DeploymentError> {
        let api: Api<BoshDeployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn apply_resources(
        &self,
        namespace: &str,
        resources: &KubeResources,
    ) -> Result<usize, DeploymentError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        // Layer 1: Services, so workload DNS exists when pods start
        let service_ar = self.registry.get(ResourceKind::Service);
        let mut services = ApplyBatch::new(self.client.clone(), namespace, &params);
        for svc in &resources.services {
            services.push("Service", &svc.name_any(), svc, &service_ar)?;
        }
        let mut applied = services.run("services").await?;

        // Layer 2: workloads
        let sts_ar = self.registry.get(ResourceKind::StatefulSet);
        let ejob_ar = self.registry.get(ResourceKind::ExtendedJob);
        let mut workloads = ApplyBatch::new(self.client.clone(), namespace, &params);
        for sts in &resources.stateful_sets {
            workloads.push("StatefulSet", &sts.name_any(), sts, &sts_ar)?;
        }
        for ejob in &resources.extended_jobs {
            workloads.push("ExtendedJob", &ejob.name_any(), ejob, &ejob_ar)?;
        }
        applied += workloads.run("workloads").await?;
        Ok(applied)
    }
}
