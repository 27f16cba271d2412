//! Explicit registry of the resource types the operator writes
//!
//! Built once at startup and shared by `Arc` with every controller that
//! applies objects, so API group/version/plural lookups come from a single
//! value instead of process-global state.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::discovery::ApiResource;

use crate::crd::{BoshDeployment, ExtendedJob};

/// Resource kinds written or read by the controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 Service
    Service,
    /// v1 Secret
    Secret,
    /// v1 Pod
    Pod,
    /// batch/v1 Job
    Job,
    /// kubebosh.dev ExtendedJob
    ExtendedJob,
    /// kubebosh.dev BoshDeployment
    BoshDeployment,
}

/// All ResourceKind variants for iteration.
pub const ALL_RESOURCE_KINDS: &[ResourceKind] = &[
    ResourceKind::StatefulSet,
    ResourceKind::Service,
    ResourceKind::Secret,
    ResourceKind::Pod,
    ResourceKind::Job,
    ResourceKind::ExtendedJob,
    ResourceKind::BoshDeployment,
];

impl ResourceKind {
    fn api_resource(&self) -> ApiResource {
        match self {
            Self::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::Secret => ApiResource::erase::<Secret>(&()),
            Self::Pod => ApiResource::erase::<Pod>(&()),
            Self::Job => ApiResource::erase::<Job>(&()),
            Self::ExtendedJob => ApiResource::erase::<ExtendedJob>(&()),
            Self::BoshDeployment => ApiResource::erase::<BoshDeployment>(&()),
        }
    }
}

/// API resources by kind
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    entries: HashMap<ResourceKind, ApiResource>,
}

impl ResourceRegistry {
    /// Build the registry for every known kind
    pub fn new() -> Self {
        let entries = ALL_RESOURCE_KINDS
            .iter()
            .map(|k| (*k, k.api_resource()))
            .collect();
        Self { entries }
    }

    /// ApiResource of a kind
    pub fn get(&self, kind: ResourceKind) -> ApiResource {
        self.entries
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.api_resource())
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
