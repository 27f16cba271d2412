//! Read access to the ConfigMaps and Secrets that hold manifests and ops files

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::ConfigKind;
use crate::error::is_kube_not_found;
use crate::kube_utils::secret_string_data;
use crate::Error;

/// The data of a ConfigMap or Secret together with its resourceVersion
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigObject {
    /// String data (Secret data decoded)
    pub data: BTreeMap<String, String>,
    /// resourceVersion at read time
    pub resource_version: String,
}

/// Key/value configuration store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch an object, `Ok(None)` when it does not exist
    async fn fetch(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigObject>, Error>;
}

/// ConfigSource backed by the Kubernetes API
pub struct KubeConfigSource {
    client: Client,
}

impl KubeConfigSource {
    /// Create a new source for the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigSource for KubeConfigSource {
    async fn fetch(
        &self,
        kind: ConfigKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigObject>, Error> {
        match kind {
            ConfigKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                match api.get(name).await {
                    Ok(cm) => Ok(Some(ConfigObject {
                        resource_version: cm.metadata.resource_version.unwrap_or_default(),
                        data: cm.data.unwrap_or_default(),
                    })),
                    Err(e) if is_kube_not_found(&e) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            ConfigKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                match api.get(name).await {
                    Ok(secret) => Ok(Some(ConfigObject {
                        data: secret_string_data(&secret)?,
                        resource_version: secret.metadata.resource_version.unwrap_or_default(),
                    })),
                    Err(e) if is_kube_not_found(&e) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}
