//! BPM process configuration
//!
//! A job describes how its processes start under
//! `bosh_containerization.bpm`. Each process becomes a run container; a
//! `pre_start` hook becomes an init container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::InstanceGroup;
use crate::{ManifestError, Result};

/// Processes of one job
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct BpmConfig {
    #[serde(default)]
    pub processes: Vec<BpmProcess>,
}

/// A supervised process
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct BpmProcess {
    pub name: String,
    pub executable: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
}

/// Lifecycle hooks of a process
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_start: Option<String>,
}

impl Hooks {
    fn is_empty(&self) -> bool {
        self.pre_start.is_none()
    }
}

impl BpmConfig {
    /// The first pre-start hook declared by any process
    pub fn pre_start(&self) -> Option<&str> {
        self.processes
            .iter()
            .find_map(|p| p.hooks.pre_start.as_deref())
    }
}

/// BPM configs of an instance group's jobs, keyed by job name
pub fn instance_group_configs(ig: &InstanceGroup) -> Result<BTreeMap<String, BpmConfig>> {
    let mut configs = BTreeMap::new();
    for job in &ig.jobs {
        if let Some(bpm) = job.containerization()?.bpm {
            configs.insert(job.name.clone(), bpm);
        }
    }
    Ok(configs)
}

/// Serialize configs into the content of the BPM artifact
pub fn to_yaml(configs: &BTreeMap<String, BpmConfig>) -> Result<String> {
    let value = serde_json::to_value(configs).map_err(ManifestError::schema)?;
    kubebosh_common::yaml::to_yaml_string(&value).map_err(ManifestError::schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Manifest;

    const MANIFEST: &str = r#"
name: cf
instance_groups:
- name: api
  jobs:
  - name: cloud_controller_ng
    release: capi
    properties:
      bosh_containerization:
        bpm:
          processes:
          - name: cloud_controller_ng
            executable: /var/vcap/jobs/cloud_controller_ng/bin/cc
            args: [--config, /var/vcap/jobs/cloud_controller_ng/config/cc.yml]
            env:
              RACK_ENV: production
            hooks:
              pre_start: /var/vcap/jobs/cloud_controller_ng/bin/pre-start
          - name: local_worker
            executable: /var/vcap/jobs/cloud_controller_ng/bin/worker
  - name: route_registrar
    release: routing
"#;

    #[test]
    fn collects_configs_of_jobs_that_declare_them() {
        let manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        let configs = instance_group_configs(&manifest.instance_groups[0]).unwrap();
        assert_eq!(configs.len(), 1);
        let cc = &configs["cloud_controller_ng"];
        assert_eq!(cc.processes.len(), 2);
        assert_eq!(cc.processes[0].env["RACK_ENV"], "production");
        assert_eq!(
            cc.pre_start(),
            Some("/var/vcap/jobs/cloud_controller_ng/bin/pre-start")
        );
        assert!(cc.processes[1].hooks.pre_start.is_none());
    }

    #[test]
    fn artifact_is_stable() {
        let manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        let configs = instance_group_configs(&manifest.instance_groups[0]).unwrap();
        assert_eq!(to_yaml(&configs).unwrap(), to_yaml(&configs).unwrap());
        assert!(to_yaml(&configs).unwrap().contains("local_worker"));
    }
}
