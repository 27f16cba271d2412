//! Manifest to Kubernetes conversion
//!
//! Service instance groups become StatefulSets (one per zone when more than
//! one zone is declared) plus Services. Errands become ExtendedJobs without
//! Services. Every name and the pod layout are pure functions of the
//! manifest, so converting the same manifest twice yields identical objects.

pub mod containers;
pub mod instances;
pub mod services;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use kubebosh_common::config::DEFAULT_OPERATOR_IMAGE;
use kubebosh_common::crd::{ExtendedJob, ExtendedJobSpec, Trigger, TriggerStrategy};
use kubebosh_common::meta::ResourceMeta;
use kubebosh_common::{names, LABEL_AZ_INDEX, LABEL_DEPLOYMENT_NAME, LABEL_INSTANCE_GROUP_NAME};

use crate::model::{InstanceGroup, Lifecycle, Manifest};
use crate::{bpm, ManifestError, Result};

pub use containers::{PodBuilder, SpecIndexSource};
pub use instances::{
    instance_service_name, job_instances, resolved_properties, stateful_set_name,
};
pub use services::instance_group_services;

/// Per-instance-group artifacts persisted before conversion
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceGroupArtifacts {
    pub instance_group: String,
    /// Resolved properties manifest as YAML
    pub properties: String,
    /// BPM configs of the group's jobs as YAML
    pub bpm: String,
}

/// Everything a converted manifest consists of
#[derive(Clone, Debug, Default)]
pub struct KubeResources {
    pub stateful_sets: Vec<StatefulSet>,
    pub extended_jobs: Vec<ExtendedJob>,
    pub services: Vec<Service>,
    /// Names of the secrets holding generated variables
    pub variables: Vec<String>,
}

impl KubeResources {
    /// Number of workload and Service objects
    pub fn len(&self) -> usize {
        self.stateful_sets.len() + self.extended_jobs.len() + self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts one deployment manifest
pub struct Converter<'a> {
    manifest: &'a Manifest,
    namespace: &'a str,
    operator_image: &'a str,
    owner: Option<OwnerReference>,
}

impl<'a> Converter<'a> {
    pub fn new(manifest: &'a Manifest, namespace: &'a str) -> Self {
        Self {
            manifest,
            namespace,
            operator_image: DEFAULT_OPERATOR_IMAGE,
            owner: None,
        }
    }

    /// Image running the template renderer
    pub fn with_operator_image(mut self, image: &'a str) -> Self {
        self.operator_image = image;
        self
    }

    /// Owner reference set on every generated object
    pub fn with_owner(mut self, owner: Option<OwnerReference>) -> Self {
        self.owner = owner;
        self
    }

    fn deployment(&self) -> &str {
        &self.manifest.name
    }

    /// Resolved properties and BPM configs of every instance group
    pub fn artifacts(&self) -> Result<Vec<InstanceGroupArtifacts>> {
        self.manifest
            .instance_groups
            .iter()
            .map(|ig| {
                let properties = resolved_properties(self.manifest, self.namespace, ig)?;
                let configs = bpm::instance_group_configs(ig)?;
                Ok(InstanceGroupArtifacts {
                    instance_group: ig.name.clone(),
                    properties: properties.to_yaml()?,
                    bpm: bpm::to_yaml(&configs)?,
                })
            })
            .collect()
    }

    /// Convert the manifest
    ///
    /// `resolved_versions` maps each instance group to the version of its
    /// persisted resolved-properties secret, which the pods mount.
    pub fn convert(&self, resolved_versions: &BTreeMap<String, u64>) -> Result<KubeResources> {
        let mut resources = KubeResources {
            variables: self
                .manifest
                .variables
                .iter()
                .map(|v| names::variable_secret_name(self.deployment(), &v.name))
                .collect(),
            ..Default::default()
        };

        for ig in &self.manifest.instance_groups {
            let version = resolved_versions.get(&ig.name).ok_or_else(|| {
                ManifestError::conversion(format!(
                    "no resolved properties for instance group '{}'",
                    ig.name
                ))
            })?;
            let resolved_secret = names::versioned_name(
                &names::ig_resolved_prefix(self.deployment(), &ig.name),
                *version,
            );

            match ig.lifecycle {
                Lifecycle::Service => {
                    resources
                        .stateful_sets
                        .extend(self.stateful_sets(ig, &resolved_secret)?);
                    resources.services.extend(instance_group_services(
                        self.deployment(),
                        self.namespace,
                        ig,
                        self.owner.as_ref(),
                    )?);
                }
                Lifecycle::Errand => {
                    resources
                        .extended_jobs
                        .push(self.extended_job(ig, &resolved_secret)?);
                }
            }
        }
        Ok(resources)
    }

    fn labels(&self, ig: &InstanceGroup, az_index: usize) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_DEPLOYMENT_NAME.to_string(), self.deployment().to_string()),
            (LABEL_INSTANCE_GROUP_NAME.to_string(), names::sanitize_label(&ig.name)),
            (LABEL_AZ_INDEX.to_string(), az_index.to_string()),
        ])
    }

    fn stateful_sets(&self, ig: &InstanceGroup, resolved_secret: &str) -> Result<Vec<StatefulSet>> {
        let zones = ig.zones();
        let headless = names::instance_group_workload_name(self.deployment(), &ig.name);
        let pods = PodBuilder::new(self.manifest, self.operator_image);
        let replicas = i32::try_from(ig.instances).map_err(|_| {
            ManifestError::conversion(format!(
                "instance group '{}' has {} instances, more than a StatefulSet allows",
                ig.name, ig.instances
            ))
        })?;

        let mut sets = Vec::with_capacity(zones.len());
        for az_index in 0..zones.len() {
            let name = stateful_set_name(self.deployment(), ig, az_index);
            let labels = self.labels(ig, az_index);
            let pod_spec =
                pods.pod_spec(ig, az_index, resolved_secret, SpecIndexSource::PodOrdinal)?;

            let meta = ResourceMeta::new(name, self.namespace)
                .with_labels(labels.clone())
                .with_owner(self.owner.clone());
            sets.push(StatefulSet {
                metadata: meta.to_object_meta(),
                spec: Some(StatefulSetSpec {
                    replicas: Some(replicas),
                    service_name: headless.clone().into(),
                    selector: LabelSelector {
                        match_labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(pod_spec),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        Ok(sets)
    }

    fn extended_job(&self, ig: &InstanceGroup, resolved_secret: &str) -> Result<ExtendedJob> {
        let auto_errand = match ig.jobs.first() {
            Some(job) => job.containerization()?.run.auto_errand,
            None => false,
        };
        let strategy = if auto_errand {
            TriggerStrategy::Once
        } else {
            TriggerStrategy::Manual
        };

        let labels = self.labels(ig, 0);
        let mut pod_spec = PodBuilder::new(self.manifest, self.operator_image).pod_spec(
            ig,
            0,
            resolved_secret,
            SpecIndexSource::Fixed,
        )?;
        pod_spec.restart_policy = Some("Never".to_string());

        let name = names::instance_group_workload_name(self.deployment(), &ig.name);
        let mut ejob = ExtendedJob::new(
            &name,
            ExtendedJobSpec {
                trigger: Trigger { strategy },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                output: None,
                update_on_config_change: true,
            },
        );
        ejob.metadata = ResourceMeta::new(name, self.namespace)
            .with_labels(labels)
            .with_owner(self.owner.clone())
            .to_object_meta();
        Ok(ejob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: nats-deployment
releases:
- name: nats
  version: 26
  url: docker.io/cfcontainerization
stemcells:
- alias: default
  os: opensuse-42.3
  version: 30.g9c91e77-30.80-7.0.0_257.gb97ced55
instance_groups:
- name: nats
  instances: 1
  jobs:
  - name: nats
    release: nats
    properties:
      nats:
        user: admin
        password: ((nats_password))
      bosh_containerization:
        ports:
        - name: nats
          protocol: TCP
          internal: 4222
- name: smoke-tests
  lifecycle: errand
  jobs:
  - name: smoke
    release: nats
    properties:
      bosh_containerization:
        run:
          auto_errand: true
variables:
- name: nats_password
  type: password
"#;

    fn manifest() -> Manifest {
        Manifest::from_yaml("test", MANIFEST).unwrap()
    }

    fn versions() -> BTreeMap<String, u64> {
        BTreeMap::from([("nats".to_string(), 1), ("smoke-tests".to_string(), 2)])
    }

    #[test]
    fn port_4222_yields_headless_and_instance_service() {
        let m = manifest();
        let resources = Converter::new(&m, "default").convert(&versions()).unwrap();
        assert_eq!(resources.services.len(), 2);

        let instance = &resources.services[0];
        assert_eq!(instance.metadata.name.as_deref(), Some("nats-deployment-nats-0"));
        let headless = &resources.services[1];
        assert_eq!(headless.metadata.name.as_deref(), Some("nats-deployment-nats"));
        assert_eq!(
            headless.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("None")
        );

        for service in &resources.services {
            let ports = service.spec.as_ref().unwrap().ports.clone().unwrap();
            assert_eq!(ports.len(), 1);
            assert_eq!(ports[0].name.as_deref(), Some("nats"));
            assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
            assert_eq!(ports[0].port, 4222);
        }
    }

    #[test]
    fn service_group_becomes_stateful_set() {
        let m = manifest();
        let resources = Converter::new(&m, "default")
            .with_operator_image("kubebosh/operator:dev")
            .convert(&versions())
            .unwrap();
        assert_eq!(resources.stateful_sets.len(), 1);

        let sts = &resources.stateful_sets[0];
        assert_eq!(sts.metadata.name.as_deref(), Some("nats-deployment-nats"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[2].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("nats-deployment.ig-resolved.nats-v1")
        );
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()[LABEL_INSTANCE_GROUP_NAME],
            "nats"
        );
    }

    #[test]
    fn one_stateful_set_per_zone() {
        let mut m = manifest();
        m.instance_groups[0].azs = vec!["z1".into(), "z2".into()];
        let resources = Converter::new(&m, "default").convert(&versions()).unwrap();
        let names: Vec<_> = resources
            .stateful_sets
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["nats-deployment-nats-z0", "nats-deployment-nats-z1"]);
        // two per-instance services plus the headless one
        assert_eq!(resources.services.len(), 3);
    }

    #[test]
    fn instance_count_beyond_replica_range_is_a_conversion_error() {
        let mut m = manifest();
        m.instance_groups[0].instances = u32::MAX;
        let err = Converter::new(&m, "default")
            .convert(&versions())
            .unwrap_err();
        assert!(matches!(err, ManifestError::Conversion { .. }));
        assert!(err.to_string().contains("instance group 'nats'"), "{err}");
    }

    #[test]
    fn errand_becomes_extended_job() {
        let m = manifest();
        let resources = Converter::new(&m, "default").convert(&versions()).unwrap();
        assert_eq!(resources.extended_jobs.len(), 1);

        let ejob = &resources.extended_jobs[0];
        assert_eq!(ejob.metadata.name.as_deref(), Some("nats-deployment-smoke-tests"));
        assert_eq!(ejob.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(ejob.spec.trigger.strategy, TriggerStrategy::Once);
        assert!(ejob.spec.update_on_config_change);
        let pod = ejob.spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert!(resources
            .services
            .iter()
            .all(|s| !s.metadata.name.as_deref().unwrap().contains("smoke")));
    }

    #[test]
    fn errand_without_auto_flag_is_manual() {
        let mut m = manifest();
        m.instance_groups[1].jobs[0].properties.clear();
        let resources = Converter::new(&m, "default").convert(&versions()).unwrap();
        assert_eq!(
            resources.extended_jobs[0].spec.trigger.strategy,
            TriggerStrategy::Manual
        );
    }

    #[test]
    fn variables_are_listed_by_secret_name() {
        let m = manifest();
        let resources = Converter::new(&m, "default").convert(&versions()).unwrap();
        assert_eq!(resources.variables, vec!["nats-deployment.var-nats-password"]);
    }

    #[test]
    fn missing_resolved_version_is_a_conversion_error() {
        let m = manifest();
        let err = Converter::new(&m, "default")
            .convert(&BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ManifestError::Conversion { .. }));
    }

    #[test]
    fn conversion_is_deterministic() {
        let m = manifest();
        let converter = Converter::new(&m, "default");
        let a = converter.convert(&versions()).unwrap();
        let b = converter.convert(&versions()).unwrap();
        assert_eq!(
            serde_json::to_string(&a.stateful_sets).unwrap(),
            serde_json::to_string(&b.stateful_sets).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&a.extended_jobs).unwrap(),
            serde_json::to_string(&b.extended_jobs).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&a.services).unwrap(),
            serde_json::to_string(&b.services).unwrap()
        );
        assert_eq!(converter.artifacts().unwrap(), converter.artifacts().unwrap());
    }

    #[test]
    fn artifacts_cover_every_instance_group() {
        let m = manifest();
        let artifacts = Converter::new(&m, "default").artifacts().unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].instance_group, "nats");
        assert!(artifacts[0]
            .properties
            .contains("nats-deployment-nats-0.default.svc.cluster.local"));
    }
}
