//! Which ConfigMaps and Secrets an object depends on, and routing of
//! change notifications to the objects that depend on them

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, Secret};

use crate::crd::{BoshDeploymentSpec, ConfigKind};
use crate::names;
use crate::versioned_secret::{LABEL_DEPLOYMENT_NAME, LABEL_SECRET_KIND};

/// An object whose spec references ConfigMaps or Secrets
#[derive(Clone, Copy, Debug)]
pub enum ReferencingObject<'a> {
    /// A BoshDeployment: manifest and ops references
    Deployment(&'a BoshDeploymentSpec),
    /// The pod template of an ExtendedJob
    JobTemplate(&'a PodSpec),
    /// The pod template of a long-running workload
    WorkloadTemplate(&'a PodSpec),
}

impl ReferencingObject<'_> {
    /// Every ConfigMap and Secret name the object references
    pub fn referenced_config_names(&self) -> ReferencedNames {
        match self {
            Self::Deployment(spec) => {
                let mut names = ReferencedNames::default();
                for r in spec.references() {
                    if let Some(kind) = r.kind() {
                        names.insert(kind, &r.ref_);
                    }
                }
                names
            }
            Self::JobTemplate(pod) | Self::WorkloadTemplate(pod) => pod_references(pod),
        }
    }
}

/// ConfigMap and Secret names referenced by an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencedNames {
    /// Referenced ConfigMap names
    pub config_maps: BTreeSet<String>,
    /// Referenced Secret names
    pub secrets: BTreeSet<String>,
}

impl ReferencedNames {
    /// Record a reference
    pub fn insert(&mut self, kind: ConfigKind, name: &str) {
        match kind {
            ConfigKind::ConfigMap => self.config_maps.insert(name.to_string()),
            ConfigKind::Secret => self.secrets.insert(name.to_string()),
        };
    }

    /// Names referenced of one kind
    pub fn of_kind(&self, kind: ConfigKind) -> &BTreeSet<String> {
        match kind {
            ConfigKind::ConfigMap => &self.config_maps,
            ConfigKind::Secret => &self.secrets,
        }
    }

    /// Whether `name` is referenced, directly or as another version of the
    /// same versioned secret
    pub fn references(&self, kind: ConfigKind, name: &str) -> bool {
        let names = self.of_kind(kind);
        if names.contains(name) {
            return true;
        }
        match names::prefix_of(name) {
            Some(prefix) => names
                .iter()
                .any(|n| n == prefix || names::prefix_of(n) == Some(prefix)),
            None => false,
        }
    }
}

fn pod_references(pod: &PodSpec) -> ReferencedNames {
    let mut names = ReferencedNames::default();

    for volume in pod.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            names.insert(ConfigKind::ConfigMap, &cm.name);
        }
        if let Some(secret) = volume.secret.as_ref().and_then(|s| s.secret_name.as_deref()) {
            names.insert(ConfigKind::Secret, secret);
        }
        for source in volume
            .projected
            .iter()
            .flat_map(|p| p.sources.iter().flatten())
        {
            if let Some(cm) = &source.config_map {
                names.insert(ConfigKind::ConfigMap, &cm.name);
            }
            if let Some(secret) = &source.secret {
                names.insert(ConfigKind::Secret, &secret.name);
            }
        }
    }

    let containers = pod
        .init_containers
        .iter()
        .flatten()
        .chain(pod.containers.iter());
    for container in containers {
        container_references(container, &mut names);
    }

    names
}

fn container_references(container: &Container, names: &mut ReferencedNames) {
    for env_from in container.env_from.iter().flatten() {
        if let Some(cm) = &env_from.config_map_ref {
            names.insert(ConfigKind::ConfigMap, &cm.name);
        }
        if let Some(secret) = &env_from.secret_ref {
            names.insert(ConfigKind::Secret, &secret.name);
        }
    }
    for source in container
        .env
        .iter()
        .flatten()
        .filter_map(|e| e.value_from.as_ref())
    {
        if let Some(cm) = &source.config_map_key_ref {
            names.insert(ConfigKind::ConfigMap, &cm.name);
        }
        if let Some(secret) = &source.secret_key_ref {
            names.insert(ConfigKind::Secret, &secret.name);
        }
    }
}

// =============================================================================
// Change events
// =============================================================================

/// A ConfigMap or Secret was created or updated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Object kind
    pub kind: ConfigKind,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// resourceVersion after the change
    pub resource_version: Option<String>,
    /// Deployment the object was generated for, if any
    pub deployment: Option<String>,
    /// Secret kind label of operator-written secrets
    pub secret_kind: Option<String>,
}

impl ChangeEvent {
    fn from_parts(
        kind: ConfigKind,
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Option<Self> {
        let label = |key: &str| {
            meta.labels
                .as_ref()
                .and_then(|l: &BTreeMap<String, String>| l.get(key))
                .cloned()
        };
        Some(Self {
            kind,
            name: meta.name.clone()?,
            namespace: meta.namespace.clone()?,
            resource_version: meta.resource_version.clone(),
            deployment: label(LABEL_DEPLOYMENT_NAME),
            secret_kind: label(LABEL_SECRET_KIND),
        })
    }

    /// Event for a ConfigMap
    pub fn from_config_map(cm: &ConfigMap) -> Option<Self> {
        Self::from_parts(ConfigKind::ConfigMap, &cm.metadata)
    }

    /// Event for a Secret
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        Self::from_parts(ConfigKind::Secret, &secret.metadata)
    }

    /// Whether an object in `namespace` with the given references is affected
    pub fn affects(&self, namespace: &str, references: &ReferencedNames) -> bool {
        self.namespace == namespace && references.references(self.kind, &self.name)
    }

    /// Whether this is the prefix-versioned form of a secret name
    pub fn versioned_prefix(&self) -> Option<&str> {
        names::prefix_of(&self.name)
    }
}
