//! Shared context of the ExtendedJob controllers

use std::sync::Arc;

use kube::Client;

use kubebosh_common::config::OperatorConfig;
use kubebosh_common::config_source::{ConfigSource, KubeConfigSource};
use kubebosh_common::events::{EventPublisher, KubeEventPublisher};
use kubebosh_common::versioned_secret::{KubeSecretBackend, VersionedSecretStore};

use crate::client::{JobKubeClient, JobKubeClientImpl, KubePodLogReader, PodLogReader};

/// Controller name reported on Events
pub const CONTROLLER_NAME: &str = "kubebosh-extendedjob-controller";

pub struct JobContext {
    pub kube: Arc<dyn JobKubeClient>,
    pub logs: Arc<dyn PodLogReader>,
    pub secrets: VersionedSecretStore,
    pub configs: Arc<dyn ConfigSource>,
    pub events: Arc<dyn EventPublisher>,
    pub config: Arc<OperatorConfig>,
}

impl JobContext {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self {
            kube: Arc::new(JobKubeClientImpl::new(client.clone())),
            logs: Arc::new(KubePodLogReader::new(client.clone())),
            secrets: VersionedSecretStore::new(Arc::new(KubeSecretBackend::new(client.clone()))),
            configs: Arc::new(KubeConfigSource::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config,
        }
    }

    /// Context over mocks and in-memory stores
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn JobKubeClient>,
        logs: Arc<dyn PodLogReader>,
        secrets: VersionedSecretStore,
    ) -> Self {
        Self {
            kube,
            logs,
            secrets,
            configs: Arc::new(kubebosh_common::testing::InMemoryConfigSource::default()),
            events: Arc::new(kubebosh_common::events::NoopEventPublisher),
            config: Arc::new(OperatorConfig::for_testing()),
        }
    }
}
