//! Shared context of the BoshDeployment controller

use std::sync::Arc;

use kube::Client;

use kubebosh_common::config::OperatorConfig;
use kubebosh_common::config_source::KubeConfigSource;
use kubebosh_common::events::{EventPublisher, KubeEventPublisher};
use kubebosh_common::registry::ResourceRegistry;
use kubebosh_common::versioned_secret::{KubeSecretBackend, VersionedSecretStore};

use crate::client::{DeploymentKubeClient, DeploymentKubeClientImpl};
use crate::pipeline::Pipeline;

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "kubebosh-deployment-controller";

pub struct DeploymentContext {
    pub kube: Arc<dyn DeploymentKubeClient>,
    pub pipeline: Pipeline,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
}

impl DeploymentContext {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        registry: Arc<ResourceRegistry>,
    ) -> Self {
        let kube: Arc<dyn DeploymentKubeClient> =
            Arc::new(DeploymentKubeClientImpl::new(client.clone(), registry));
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        let secrets = VersionedSecretStore::new(Arc::new(KubeSecretBackend::new(client.clone())));
        let pipeline = Pipeline::new(
            Arc::new(KubeConfigSource::new(client)),
            secrets,
            kube.clone(),
            events.clone(),
        )
        .with_operator_image(config.operator_image.clone());
        Self {
            kube,
            pipeline,
            events,
            config,
        }
    }
}
