//! BoshDeployment CRD types
//!
//! A `BoshDeployment` points at a BOSH manifest and an ordered list of ops
//! files stored in ConfigMaps or Secrets. The status records how far the
//! pipeline has progressed and which input versions it last observed.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Config references
// =============================================================================

/// Kind of object a manifest or ops file lives in
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    /// A ConfigMap
    ConfigMap,
    /// A Secret
    Secret,
}

impl ConfigKind {
    /// Parse the `type` field of a reference
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "configmap" => Some(Self::ConfigMap),
            "secret" => Some(Self::Secret),
            _ => None,
        }
    }

    /// Kubernetes kind name
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
        }
    }
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigMap => write!(f, "configmap"),
            Self::Secret => write!(f, "secret"),
        }
    }
}

/// Reference to a manifest or ops document
///
/// `type` is kept as a free string so unsupported values reach the
/// admission webhook and get a descriptive denial.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigReference {
    /// Object kind: `configmap` or `secret`
    #[serde(rename = "type")]
    pub type_: String,
    /// Name of the referenced object
    #[serde(rename = "ref")]
    pub ref_: String,
}

impl ConfigReference {
    /// Reference a ConfigMap
    pub fn config_map(name: impl Into<String>) -> Self {
        Self {
            type_: ConfigKind::ConfigMap.to_string(),
            ref_: name.into(),
        }
    }

    /// Reference a Secret
    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            type_: ConfigKind::Secret.to_string(),
            ref_: name.into(),
        }
    }

    /// The parsed kind, `None` when `type` is unsupported
    pub fn kind(&self) -> Option<ConfigKind> {
        ConfigKind::parse(&self.type_)
    }

    /// Check the reference is usable, describing the problem otherwise
    pub fn validate(&self, field: &str) -> Result<ConfigKind, String> {
        if self.ref_.trim().is_empty() {
            return Err(format!("{field}: ref must not be empty"));
        }
        self.kind().ok_or_else(|| {
            format!(
                "{field}: unsupported type '{}', expected 'configmap' or 'secret'",
                self.type_
            )
        })
    }

    /// Key under which the resolved resourceVersion is tracked in status
    pub fn input_key(&self) -> String {
        format!("{}/{}", self.type_, self.ref_)
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Reconcile state of a deployment
///
/// Phases are ordered: a run only moves forward, and a spec change sends
/// the deployment back to `SpecObserved`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum DeploymentPhase {
    /// Spec seen, manifest not yet resolved
    #[default]
    SpecObserved,
    /// Manifest resolved and ops applied
    OpsApplied,
    /// Variable material generated
    VariablesGenerated,
    /// Variables interpolated into the desired manifest
    VariablesInterpolated,
    /// Desired manifest converted into workload resources
    ResourcesConverted,
    /// Workload resources applied to the cluster
    Applied,
}

impl DeploymentPhase {
    /// Every phase in pipeline order
    pub const ALL: [DeploymentPhase; 6] = [
        Self::SpecObserved,
        Self::OpsApplied,
        Self::VariablesGenerated,
        Self::VariablesInterpolated,
        Self::ResourcesConverted,
        Self::Applied,
    ];

    /// The phase the pipeline moves to after this one completes
    pub fn next(self) -> Option<Self> {
        match self {
            Self::SpecObserved => Some(Self::OpsApplied),
            Self::OpsApplied => Some(Self::VariablesGenerated),
            Self::VariablesGenerated => Some(Self::VariablesInterpolated),
            Self::VariablesInterpolated => Some(Self::ResourcesConverted),
            Self::ResourcesConverted => Some(Self::Applied),
            Self::Applied => None,
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpecObserved => write!(f, "SpecObserved"),
            Self::OpsApplied => write!(f, "OpsApplied"),
            Self::VariablesGenerated => write!(f, "VariablesGenerated"),
            Self::VariablesInterpolated => write!(f, "VariablesInterpolated"),
            Self::ResourcesConverted => write!(f, "ResourcesConverted"),
            Self::Applied => write!(f, "Applied"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A BOSH deployment manifest to run on the cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubebosh.dev",
    version = "v1alpha1",
    kind = "BoshDeployment",
    plural = "boshdeployments",
    shortname = "bdpl",
    namespaced,
    status = "BoshDeploymentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BoshDeploymentSpec {
    /// Where the base manifest lives
    pub manifest: ConfigReference,

    /// Ops files applied to the manifest, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<ConfigReference>,
}

impl BoshDeploymentSpec {
    /// Manifest and ops references in resolution order
    pub fn references(&self) -> impl Iterator<Item = &ConfigReference> {
        std::iter::once(&self.manifest).chain(self.ops.iter())
    }

    /// Validate every reference, collecting one message per problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if let Err(e) = self.manifest.validate("spec.manifest") {
            problems.push(e);
        }
        for (i, op) in self.ops.iter().enumerate() {
            if let Err(e) = op.validate(&format!("spec.ops[{i}]")) {
                problems.push(e);
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Observed state of a BoshDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoshDeploymentStatus {
    /// Last phase the pipeline completed
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Generation of the spec the status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// resourceVersion of each referenced manifest/ops object at last resolve
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// Version of the `with-ops` artifact the later stages were built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_ops_version: Option<u64>,

    /// Version of the `desired-manifest` artifact the workloads were built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_manifest_version: Option<u64>,

    /// Digest over the resourceVersions of the generated variable secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_versions: Option<String>,

    /// Digest of the last workload set applied to the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_digest: Option<String>,

    /// Human-readable description of the last outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Stage that failed on the last run, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_stage: Option<DeploymentPhase>,
}
