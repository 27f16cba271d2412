//! Pod spec of an instance group
//!
//! Init containers run in this order:
//! 1. `spec-copier-<job>` copies the job specs out of each release image
//! 2. `renderer-<ig>` renders all job templates into `jobs-dir`
//! 3. `bpm-pre-start-<job>` runs BPM pre-start hooks
//!
//! Run containers come from BPM processes, or one per job without BPM.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    SecretVolumeSource, Volume, VolumeMount,
};

use kubebosh_common::{names, LABEL_POD_ORDINAL};

use crate::model::{InstanceGroup, Manifest};
use crate::{Result, PROPERTIES_ARTIFACT_KEY};

/// Volume shared by the spec copiers and the renderer
pub const VOLUME_RENDERING_DATA: &str = "rendering-data";
/// Mount path of [`VOLUME_RENDERING_DATA`]
pub const RENDERING_DATA_PATH: &str = "/var/vcap/all-releases";

/// Volume holding the rendered jobs
pub const VOLUME_JOBS_DIR: &str = "jobs-dir";
/// Mount path of [`VOLUME_JOBS_DIR`]
pub const JOBS_DIR_PATH: &str = "/var/vcap/jobs";

/// Volume holding the instance group's resolved properties
pub const VOLUME_IG_RESOLVED: &str = "ig-resolved";
/// Parent of the resolved-properties mount path
pub const RESOLVED_PROPERTIES_PATH: &str = "/var/run/secrets/resolved-properties";

/// Where release images keep their job specs
pub const RELEASE_JOBS_SRC: &str = "/var/vcap/jobs-src";

const DUMB_INIT: [&str; 2] = ["/usr/bin/dumb-init", "--"];

/// Mount path of an instance group's resolved properties
pub fn resolved_properties_dir(instance_group: &str) -> String {
    format!("{RESOLVED_PROPERTIES_PATH}/{instance_group}")
}

/// Directory a job's spec is copied to, relative to `jobs_dir`
pub fn job_spec_dir(jobs_dir: &str, release: &str, job: &str) -> String {
    format!("{jobs_dir}/jobs-src/{release}/{job}")
}

fn mount(name: &str, path: impl Into<String>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.into(),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Where the renderer reads the pod's spec index from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecIndexSource {
    /// StatefulSet pods read their ordinal label
    PodOrdinal,
    /// Errand pods always render index 0
    Fixed,
}

/// Builds pod specs for the instance groups of one manifest
pub struct PodBuilder<'a> {
    manifest: &'a Manifest,
    operator_image: &'a str,
}

impl<'a> PodBuilder<'a> {
    pub fn new(manifest: &'a Manifest, operator_image: &'a str) -> Self {
        Self {
            manifest,
            operator_image,
        }
    }

    /// Pod spec of `ig` pods in zone `az_index`
    ///
    /// `resolved_secret` is the versioned secret holding the resolved
    /// properties, so new properties roll the pods.
    pub fn pod_spec(
        &self,
        ig: &InstanceGroup,
        az_index: usize,
        resolved_secret: &str,
        spec_index: SpecIndexSource,
    ) -> Result<PodSpec> {
        let mut init_containers = self.spec_copiers(ig)?;
        init_containers.push(self.renderer(ig, az_index, spec_index));
        init_containers.extend(self.pre_start_hooks(ig)?);

        Ok(PodSpec {
            init_containers: Some(init_containers),
            containers: self.run_containers(ig)?,
            volumes: Some(volumes(resolved_secret)),
            ..Default::default()
        })
    }

    fn spec_copiers(&self, ig: &InstanceGroup) -> Result<Vec<Container>> {
        ig.jobs
            .iter()
            .map(|job| {
                let image = self.manifest.release_image(&ig.name, &job.name)?;
                let target = job_spec_dir(RENDERING_DATA_PATH, &job.release, "");
                let script = format!(
                    "mkdir -p {target} && cp -ar {RELEASE_JOBS_SRC}/{job} {target}",
                    job = job.name,
                );
                Ok(Container {
                    name: names::dns_label(&["spec-copier", &job.name]),
                    image: Some(image),
                    command: Some(strings(&["bash", "-c", &script])),
                    volume_mounts: Some(vec![mount(VOLUME_RENDERING_DATA, RENDERING_DATA_PATH)]),
                    ..Default::default()
                })
            })
            .collect()
    }

    fn renderer(
        &self,
        ig: &InstanceGroup,
        az_index: usize,
        spec_index: SpecIndexSource,
    ) -> Container {
        let resolved_dir = resolved_properties_dir(&ig.name);
        let spec_index_env = match spec_index {
            SpecIndexSource::PodOrdinal => env_from_field(
                "SPEC_INDEX",
                &format!("metadata.labels['{LABEL_POD_ORDINAL}']"),
            ),
            SpecIndexSource::Fixed => env("SPEC_INDEX", "0"),
        };
        Container {
            name: names::dns_label(&["renderer", &ig.name]),
            image: Some(self.operator_image.to_string()),
            command: Some(strings(&DUMB_INIT)),
            args: Some(strings(&["kubebosh-operator", "util", "template-render"])),
            env: Some(vec![
                env("INSTANCE_GROUP_NAME", ig.name.clone()),
                env(
                    "BOSH_MANIFEST_PATH",
                    format!("{resolved_dir}/{PROPERTIES_ARTIFACT_KEY}"),
                ),
                env("JOBS_DIR", RENDERING_DATA_PATH),
                env("OUTPUT_DIR", JOBS_DIR_PATH),
                env_from_field("DEPLOYMENT_NAMESPACE", "metadata.namespace"),
                spec_index_env,
                env("AZ_INDEX", az_index.to_string()),
            ]),
            volume_mounts: Some(vec![
                mount(VOLUME_RENDERING_DATA, RENDERING_DATA_PATH),
                mount(VOLUME_JOBS_DIR, JOBS_DIR_PATH),
                VolumeMount {
                    read_only: Some(true),
                    ..mount(VOLUME_IG_RESOLVED, resolved_dir)
                },
            ]),
            ..Default::default()
        }
    }

    fn pre_start_hooks(&self, ig: &InstanceGroup) -> Result<Vec<Container>> {
        let mut hooks = Vec::new();
        for job in &ig.jobs {
            let Some(bpm) = job.containerization()?.bpm else {
                continue;
            };
            let Some(hook) = bpm.pre_start() else {
                continue;
            };
            hooks.push(Container {
                name: names::dns_label(&["bpm-pre-start", &job.name]),
                image: Some(self.manifest.release_image(&ig.name, &job.name)?),
                command: Some(strings(&DUMB_INIT)),
                args: Some(strings(&["/bin/sh", "-xc", hook])),
                volume_mounts: Some(job_mounts()),
                ..Default::default()
            });
        }
        Ok(hooks)
    }

    fn run_containers(&self, ig: &InstanceGroup) -> Result<Vec<Container>> {
        let mut containers = Vec::new();
        for job in &ig.jobs {
            let image = self.manifest.release_image(&ig.name, &job.name)?;
            let containerization = job.containerization()?;
            let healthcheck = &containerization.run.healthcheck;

            let processes = containerization
                .bpm
                .map(|bpm| bpm.processes)
                .unwrap_or_default();

            if processes.is_empty() {
                let probes = healthcheck.get(&job.name);
                containers.push(Container {
                    name: names::dns_label(&[&job.name]),
                    image: Some(image),
                    volume_mounts: Some(job_mounts()),
                    readiness_probe: probes.and_then(|p| p.readiness.clone()),
                    liveness_probe: probes.and_then(|p| p.liveness.clone()),
                    ..Default::default()
                });
                continue;
            }

            for process in processes {
                let name = if process.name == job.name {
                    names::dns_label(&[&job.name])
                } else {
                    names::dns_label(&[&job.name, &process.name])
                };
                let probes = healthcheck.get(&process.name);
                let env: Vec<EnvVar> = process.env.iter().map(|(k, v)| env(k, v.clone())).collect();
                containers.push(Container {
                    name,
                    image: Some(image.clone()),
                    command: Some(vec![process.executable.clone()]),
                    args: (!process.args.is_empty()).then(|| process.args.clone()),
                    env: (!env.is_empty()).then_some(env),
                    working_dir: process.workdir.clone(),
                    volume_mounts: Some(job_mounts()),
                    readiness_probe: probes.and_then(|p| p.readiness.clone()),
                    liveness_probe: probes.and_then(|p| p.liveness.clone()),
                    ..Default::default()
                });
            }
        }
        Ok(containers)
    }
}

fn job_mounts() -> Vec<VolumeMount> {
    vec![
        mount(VOLUME_RENDERING_DATA, RENDERING_DATA_PATH),
        mount(VOLUME_JOBS_DIR, JOBS_DIR_PATH),
    ]
}

fn volumes(resolved_secret: &str) -> Vec<Volume> {
    vec![
        Volume {
            name: VOLUME_RENDERING_DATA.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: VOLUME_JOBS_DIR.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: VOLUME_IG_RESOLVED.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(resolved_secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: foo-deployment
releases:
- name: redis
  version: 36.15.0
  url: hub.docker.com/cfcontainerization
- name: cflinuxfs3
  version: 0.62.0
  url: hub.docker.com/cfcontainerization
stemcells:
- alias: default
  os: opensuse-42.3
  version: 28.g837c5b3-30.263-7.0.0_234.gcd7d1132
instance_groups:
- name: redis-slave
  instances: 2
  jobs:
  - name: redis-server
    release: redis
    properties:
      bosh_containerization:
        run:
          healthcheck:
            redis-server:
              readiness:
                exec:
                  command: ["curl --silent --fail --head http://${HOSTNAME}:8080/health"]
  - name: cflinuxfs3-rootfs-setup
    release: cflinuxfs3
    properties:
      bosh_containerization:
        bpm:
          processes:
          - name: rootfs
            executable: /var/vcap/jobs/cflinuxfs3-rootfs-setup/bin/setup
            args: [--once]
            env: {TRACE: "1"}
            hooks:
              pre_start: /var/vcap/jobs/cflinuxfs3-rootfs-setup/bin/pre-start
"#;

    fn pod() -> PodSpec {
        let manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        let ig = manifest.instance_groups[0].clone();
        PodBuilder::new(&manifest, "kubebosh/operator:dev")
            .pod_spec(
                &ig,
                0,
                "foo-deployment.ig-resolved.redis-slave-v1",
                SpecIndexSource::PodOrdinal,
            )
            .unwrap()
    }

    #[test]
    fn spec_copiers_use_the_release_image() {
        let pod = pod();
        let init = pod.init_containers.unwrap();
        assert_eq!(init[0].name, "spec-copier-redis-server");
        assert_eq!(init[0].command.as_ref().unwrap()[0], "bash");
        assert_eq!(
            init[0].image.as_deref(),
            Some("hub.docker.com/cfcontainerization/redis:opensuse-42.3-28.g837c5b3-30.263-7.0.0_234.gcd7d1132-36.15.0")
        );
        assert_eq!(init[1].name, "spec-copier-cflinuxfs3-rootfs-setup");
    }

    #[test]
    fn renderer_follows_spec_copiers() {
        let pod = pod();
        let init = pod.init_containers.unwrap();
        let renderer = &init[2];
        assert_eq!(renderer.name, "renderer-redis-slave");
        assert_eq!(renderer.image.as_deref(), Some("kubebosh/operator:dev"));

        let env = renderer.env.as_ref().unwrap();
        assert_eq!(env[0].name, "INSTANCE_GROUP_NAME");
        assert_eq!(env[0].value.as_deref(), Some("redis-slave"));
        let spec_index = env.iter().find(|e| e.name == "SPEC_INDEX").unwrap();
        assert!(spec_index.value_from.is_some());

        let mounts = renderer.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, "rendering-data");
        assert_eq!(mounts[0].mount_path, "/var/vcap/all-releases");
        assert_eq!(mounts[1].name, "jobs-dir");
        assert_eq!(mounts[1].mount_path, "/var/vcap/jobs");
        assert_eq!(mounts[2].name, "ig-resolved");
        assert_eq!(
            mounts[2].mount_path,
            "/var/run/secrets/resolved-properties/redis-slave"
        );
    }

    #[test]
    fn pre_start_hook_runs_after_renderer() {
        let pod = pod();
        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 4);
        assert_eq!(init[3].name, "bpm-pre-start-cflinuxfs3-rootfs-setup");
        assert_eq!(
            init[3].args.as_ref().unwrap(),
            &vec![
                "/bin/sh".to_string(),
                "-xc".to_string(),
                "/var/vcap/jobs/cflinuxfs3-rootfs-setup/bin/pre-start".to_string()
            ]
        );
    }

    #[test]
    fn job_without_bpm_runs_image_default() {
        let pod = pod();
        let redis = &pod.containers[0];
        assert_eq!(redis.name, "redis-server");
        assert!(redis.command.is_none());
        assert_eq!(redis.volume_mounts.as_ref().unwrap()[0].name, "rendering-data");
        let probe = redis.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.exec.as_ref().unwrap().command.as_ref().unwrap()[0],
            "curl --silent --fail --head http://${HOSTNAME}:8080/health"
        );
    }

    #[test]
    fn bpm_processes_become_containers() {
        let pod = pod();
        let rootfs = &pod.containers[1];
        assert_eq!(rootfs.name, "cflinuxfs3-rootfs-setup-rootfs");
        assert_eq!(
            rootfs.command.as_ref().unwrap()[0],
            "/var/vcap/jobs/cflinuxfs3-rootfs-setup/bin/setup"
        );
        assert_eq!(rootfs.env.as_ref().unwrap()[0].name, "TRACE");
    }

    #[test]
    fn resolved_properties_volume_references_versioned_secret() {
        let pod = pod();
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes[2].name, "ig-resolved");
        assert_eq!(
            volumes[2].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("foo-deployment.ig-resolved.redis-slave-v1")
        );
    }

    #[test]
    fn errand_pods_render_index_zero() {
        let manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        let ig = manifest.instance_groups[0].clone();
        let pod = PodBuilder::new(&manifest, "op")
            .pod_spec(&ig, 0, "s-v1", SpecIndexSource::Fixed)
            .unwrap();
        let renderer = &pod.init_containers.unwrap()[2];
        let spec_index = renderer
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "SPEC_INDEX")
            .unwrap();
        assert_eq!(spec_index.value.as_deref(), Some("0"));
    }
}
