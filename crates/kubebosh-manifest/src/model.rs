//! BOSH deployment manifest types
//!
//! Unknown keys are kept in `extra` maps so a manifest survives a
//! parse/serialize round trip through the stage artifacts unchanged.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Probe;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bpm::BpmConfig;
use crate::{ManifestError, Result};

/// Reserved property sub-tree holding container metadata
pub const CONTAINERIZATION_KEY: &str = "bosh_containerization";

// =============================================================================
// Manifest
// =============================================================================

/// A BOSH deployment manifest
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<Release>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stemcells: Vec<Stemcell>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_groups: Vec<InstanceGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Build a manifest from a parsed document
    ///
    /// An empty document (`---`) is an empty manifest.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(ManifestError::schema)
    }

    /// Parse a manifest from YAML text
    pub fn from_yaml(source_name: &str, text: &str) -> Result<Self> {
        let value = kubebosh_common::yaml::parse_yaml(text)
            .map_err(|e| ManifestError::parse(source_name, e))?;
        Self::from_value(value)
    }

    /// The manifest as a document
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(ManifestError::schema)
    }

    /// Serialize as YAML with sorted keys
    pub fn to_yaml(&self) -> Result<String> {
        kubebosh_common::yaml::to_yaml_string(&self.to_value()?).map_err(ManifestError::schema)
    }

    pub fn instance_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|ig| ig.name == name)
    }

    pub fn release(&self, name: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.name == name)
    }

    /// The deployment-level stemcell, matched by alias when one is given
    pub fn stemcell(&self, alias: Option<&str>) -> Option<&Stemcell> {
        match alias {
            Some(alias) => self.stemcells.iter().find(|s| s.alias == alias),
            None => self.stemcells.first(),
        }
    }
}

/// Versions written as bare numbers (`version: 36`) parse as YAML numbers
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a version string, got {other}"
        ))),
    }
}

/// A release providing job packages
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Release {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell: Option<ReleaseStemcell>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stemcell override on a release
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ReleaseStemcell {
    pub os: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
}

/// A deployment-level stemcell
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Stemcell {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// Instance groups and jobs
// =============================================================================

/// How an instance group runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Long-running, realized as a StatefulSet
    #[default]
    Service,
    /// One-shot, realized as an ExtendedJob
    Errand,
}

fn default_instances() -> u32 {
    1
}

/// A group of co-located jobs deployed as one workload
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InstanceGroup {
    pub name: String,
    /// Replicas per availability zone
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azs: Vec<String>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceGroup {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Zone names; a group without zones runs in one unnamed zone
    pub fn zones(&self) -> Vec<&str> {
        if self.azs.is_empty() {
            vec![""]
        } else {
            self.azs.iter().map(String::as_str).collect()
        }
    }

    /// Global index of the pod with the given ordinal in the given zone
    pub fn instance_index(&self, ordinal: u32, az_index: usize) -> usize {
        ordinal as usize * self.zones().len() + az_index
    }
}

/// A job of an instance group
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub release: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    /// Links consumed by this job, keyed by link name
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub consumes: Map<String, Value>,
    /// Links provided by this job, keyed by link name
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provides: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// The parsed container metadata sub-tree
    pub fn containerization(&self) -> Result<BoshContainerization> {
        match self.properties.get(CONTAINERIZATION_KEY) {
            None | Some(Value::Null) => Ok(BoshContainerization::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ManifestError::schema(format!(
                    "job '{}': invalid {CONTAINERIZATION_KEY}: {e}",
                    self.name
                ))
            }),
        }
    }

    /// Replace the container metadata sub-tree
    pub fn set_containerization(&mut self, value: &BoshContainerization) -> Result<()> {
        let value = serde_json::to_value(value).map_err(ManifestError::schema)?;
        self.properties
            .insert(CONTAINERIZATION_KEY.to_string(), value);
        Ok(())
    }

    /// Properties without the reserved container metadata
    pub fn user_properties(&self) -> Map<String, Value> {
        let mut props = self.properties.clone();
        props.remove(CONTAINERIZATION_KEY);
        props
    }
}

// =============================================================================
// Container metadata
// =============================================================================

/// The `bosh_containerization` property sub-tree
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct BoshContainerization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumes: BTreeMap<String, JobLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<JobInstance>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<BpmConfig>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// A port a job listens on
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Port {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub internal: i32,
}

/// Runtime hints for a job's containers
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    /// Probes keyed by job or process name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub healthcheck: BTreeMap<String, HealthCheck>,
    /// Run the errand once on creation instead of on demand
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_errand: bool,
}

/// Readiness and liveness probes of one container
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,
}

/// A resolved link as seen by the consuming job
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct JobLink {
    #[serde(default)]
    pub instances: Vec<JobInstance>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// One materialized replica of a job
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobInstance {
    pub address: String,
    #[serde(default)]
    pub az: String,
    pub id: String,
    pub index: usize,
    /// Ordinal of the pod within its zone
    #[serde(default)]
    pub instance: u32,
    pub name: String,
    #[serde(default)]
    pub bootstrap: bool,
}

// =============================================================================
// Variables
// =============================================================================

/// A variable the deployment generates
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VariableOptions>,
}

/// Kind of generated material
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Password,
    Rsa,
    Ssh,
    Certificate,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Password => "password",
            Self::Rsa => "rsa",
            Self::Ssh => "ssh",
            Self::Certificate => "certificate",
        };
        write!(f, "{s}")
    }
}

/// Certificate options
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VariableOptions {
    #[serde(default)]
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,
    #[serde(default)]
    pub is_ca: bool,
    /// Name of the variable holding the signing CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_key_usage: Vec<ExtendedKeyUsage>,
}

/// Extended key usages a certificate variable may request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedKeyUsage {
    ClientAuth,
    ServerAuth,
}
