//! Kubernetes Event recording for the kubebosh controllers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason string (e.g. "ManifestResolved")
    /// * `action` - What action was taken (e.g. "Reconcile")
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    // Deployment pipeline
    /// Manifest fetched and ops applied
    pub const MANIFEST_RESOLVED: &str = "ManifestResolved";
    /// Variable secrets generated
    pub const VARIABLES_GENERATED: &str = "VariablesGenerated";
    /// Variables interpolated into the desired manifest
    pub const VARIABLES_INTERPOLATED: &str = "VariablesInterpolated";
    /// Desired manifest converted into workloads
    pub const RESOURCES_CONVERTED: &str = "ResourcesConverted";
    /// Workloads applied to the cluster
    pub const RESOURCES_APPLIED: &str = "ResourcesApplied";
    /// A pipeline stage failed
    pub const STAGE_FAILED: &str = "StageFailed";

    // ExtendedJob lifecycle
    /// A Job was created from an ExtendedJob
    pub const JOB_TRIGGERED: &str = "JobTriggered";
    /// Container output is being persisted
    pub const PERSISTING_OUTPUT: &str = "PersistingOutput";
    /// Persisting container output failed
    pub const OUTPUT_FAILED: &str = "OutputFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a Job from an ExtendedJob
    pub const TRIGGER: &str = "Trigger";
    /// Writing job output
    pub const PERSIST: &str = "Persist";
}
