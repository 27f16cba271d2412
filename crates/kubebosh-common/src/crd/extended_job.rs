//! ExtendedJob CRD types
//!
//! An `ExtendedJob` wraps a pod template that runs to completion. The trigger
//! strategy decides when a `batch/v1` Job is created from it, and the optional
//! output policy persists each container's JSON output as a Secret.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label set to `true` on every Job created from an ExtendedJob
pub const LABEL_EXTENDED_JOB: &str = "kubebosh.dev/extendedjob";

/// Label on a Job and its pods naming the owning ExtendedJob
pub const LABEL_EJOB_NAME: &str = "kubebosh.dev/ejob-name";

/// Label on an output secret naming the Job run that produced it
pub const LABEL_JOB_NAME: &str = "kubebosh.dev/job-name";

/// Pod template label that requests pod deletion after a successful run
pub const LABEL_DELETE: &str = "delete";

/// Value of [`LABEL_DELETE`] that enables pod deletion
pub const DELETE_POD: &str = "pod";

// =============================================================================
// Trigger
// =============================================================================

/// When an ExtendedJob creates its Job
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStrategy {
    /// Never runs on its own; switch to `now` to run it
    #[default]
    Manual,
    /// Run once, then revert to `manual`
    Now,
    /// Run once on creation, then switch to `done`
    Once,
    /// Terminal state of `once`; never runs again
    Done,
}

impl TriggerStrategy {
    /// Strategy to persist after the Job for this strategy has been created
    ///
    /// `None` means the strategy does not create a Job at all.
    pub fn after_run(self) -> Option<Self> {
        match self {
            Self::Now => Some(Self::Manual),
            Self::Once => Some(Self::Done),
            Self::Manual | Self::Done => None,
        }
    }

    /// Auto errands run without user action
    pub fn is_auto_errand(self) -> bool {
        matches!(self, Self::Once | Self::Done)
    }
}

impl std::fmt::Display for TriggerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Now => write!(f, "now"),
            Self::Once => write!(f, "once"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Trigger configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Trigger {
    /// Trigger strategy
    #[serde(default)]
    pub strategy: TriggerStrategy,
}

// =============================================================================
// Output
// =============================================================================

/// How to persist the output of a finished Job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    /// Secret name is `<namePrefix><container name>`
    pub name_prefix: String,

    /// Output encoding, only `json` is understood
    #[serde(default = "default_output_type")]
    pub output_type: String,

    /// Labels added to every output secret
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_labels: BTreeMap<String, String>,

    /// Persist output even when the Job failed
    #[serde(default)]
    pub write_on_failure: bool,

    /// Write a new secret version per run instead of overwriting one secret
    #[serde(default)]
    pub versioned: bool,
}

fn default_output_type() -> String {
    "json".to_string()
}

impl Output {
    /// Name of the output secret for one container
    pub fn secret_name(&self, container: &str) -> String {
        format!("{}{}", self.name_prefix, container)
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A pod template run to completion on demand or once
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubebosh.dev",
    version = "v1alpha1",
    kind = "ExtendedJob",
    plural = "extendedjobs",
    shortname = "ejob",
    namespaced,
    status = "ExtendedJobStatus",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.trigger.strategy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedJobSpec {
    /// When to run
    #[serde(default)]
    pub trigger: Trigger,

    /// Pod template of the Job
    pub template: PodTemplateSpec,

    /// Output persistence policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,

    /// Re-run when a referenced ConfigMap or Secret changes
    #[serde(default)]
    pub update_on_config_change: bool,
}

/// Observed state of an ExtendedJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedJobStatus {
    /// RFC 3339 timestamp of the last Job creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<String>,

    /// Whether the last Job succeeded
    #[serde(default)]
    pub succeeded: bool,

    /// Number of Jobs created so far
    #[serde(default)]
    pub runs: u32,

    /// Digest over the referenced ConfigMaps and Secrets at the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
}
