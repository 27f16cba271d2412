//! Job instances, link resolution and per-instance-group properties
//!
//! Each pod of an instance group is one instance. Its global index
//! interleaves zones: `index = ordinal * zones + az_index`, matching the
//! per-instance Service `<deployment>-<ig>-<index>` that gives it an address.
//! Groups without ports get no per-instance Services; their instances are
//! addressed through the pod's DNS record under the headless Service.

use std::collections::BTreeMap;

use serde_json::Value;

use kubebosh_common::names;

use crate::model::{InstanceGroup, Job, JobInstance, JobLink, Manifest};
use crate::{ManifestError, Result};

/// Name of the Service addressing one instance
pub fn instance_service_name(deployment: &str, instance_group: &str, index: usize) -> String {
    names::dns_label(&[deployment, instance_group, &index.to_string()])
}

/// Name of the StatefulSet running zone `az_index` of an instance group
///
/// A single-zone group uses the plain workload name, which is also the name
/// of its headless Service.
pub fn stateful_set_name(deployment: &str, ig: &InstanceGroup, az_index: usize) -> String {
    if ig.zones().len() > 1 {
        names::dns_label(&[deployment, &ig.name, &format!("z{az_index}")])
    } else {
        names::instance_group_workload_name(deployment, &ig.name)
    }
}

/// Whether any job of the group declares ports, which gives every instance
/// its own Service
pub fn has_instance_services(ig: &InstanceGroup) -> bool {
    ig.jobs
        .iter()
        .any(|job| job.containerization().is_ok_and(|c| !c.ports.is_empty()))
}

/// All instances of `job` in `ig`, ordered by global index
pub fn job_instances(
    deployment: &str,
    namespace: &str,
    ig: &InstanceGroup,
    job: &str,
) -> Vec<JobInstance> {
    let zones = ig.zones();
    let headless = names::instance_group_workload_name(deployment, &ig.name);
    let instance_services = has_instance_services(ig);
    let mut instances = Vec::with_capacity(ig.instances as usize * zones.len());
    for ordinal in 0..ig.instances {
        for (az_index, az) in zones.iter().enumerate() {
            let index = ig.instance_index(ordinal, az_index);
            let host = if instance_services {
                instance_service_name(deployment, &ig.name, index)
            } else {
                let pod = format!("{}-{ordinal}", stateful_set_name(deployment, ig, az_index));
                format!("{pod}.{headless}")
            };
            instances.push(JobInstance {
                address: format!("{host}.{namespace}.svc.cluster.local"),
                az: az.to_string(),
                id: format!("{}-{}", ig.name, index),
                index,
                instance: ordinal,
                name: format!("{}-{}", ig.name, job),
                bootstrap: index == 0,
            });
        }
    }
    instances
}

/// A link one job offers to others
struct Provider<'a> {
    alias: String,
    ig: &'a InstanceGroup,
    job: &'a Job,
}

fn providers(manifest: &Manifest) -> Vec<Provider<'_>> {
    let mut found = Vec::new();
    for ig in &manifest.instance_groups {
        for job in &ig.jobs {
            for (link, declaration) in &job.provides {
                let alias = declaration
                    .get("as")
                    .and_then(Value::as_str)
                    .unwrap_or(link)
                    .to_string();
                found.push(Provider { alias, ig, job });
            }
        }
    }
    found
}

/// A consumes entry of `nil` switches the link off
fn is_disabled(declaration: &Value) -> bool {
    matches!(declaration, Value::Null) || declaration.as_str() == Some("nil")
}

fn resolve_links(
    manifest: &Manifest,
    namespace: &str,
    job: &Job,
) -> Result<BTreeMap<String, JobLink>> {
    let providers = providers(manifest);
    let mut links = BTreeMap::new();
    for (link, declaration) in &job.consumes {
        if is_disabled(declaration) {
            continue;
        }
        let from = declaration
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or(link);
        let matching: Vec<&Provider> = providers.iter().filter(|p| p.alias == from).collect();
        let provider = match matching.as_slice() {
            [one] => *one,
            [] => {
                return Err(ManifestError::conversion(format!(
                    "link '{link}' consumed by job '{}' has no provider '{from}'",
                    job.name
                )))
            }
            _ => {
                return Err(ManifestError::conversion(format!(
                    "link '{link}' consumed by job '{}' has {} providers named '{from}'",
                    job.name,
                    matching.len()
                )))
            }
        };
        links.insert(
            link.clone(),
            JobLink {
                instances: job_instances(
                    &manifest.name,
                    namespace,
                    provider.ig,
                    &provider.job.name,
                ),
                properties: provider.job.user_properties(),
            },
        );
    }
    Ok(links)
}

/// The manifest as one instance group's renderer sees it
///
/// Only `ig` is kept. Each of its jobs gets its instances and consumed
/// links written into `bosh_containerization`.
pub fn resolved_properties(
    manifest: &Manifest,
    namespace: &str,
    ig: &InstanceGroup,
) -> Result<Manifest> {
    let mut resolved_ig = ig.clone();
    for job in &mut resolved_ig.jobs {
        let mut containerization = job.containerization()?;
        containerization.instances = job_instances(&manifest.name, namespace, ig, &job.name);
        containerization.consumes = resolve_links(manifest, namespace, job)?;
        job.set_containerization(&containerization)?;
    }

    Ok(Manifest {
        name: manifest.name.clone(),
        releases: manifest.releases.clone(),
        stemcells: manifest.stemcells.clone(),
        instance_groups: vec![resolved_ig],
        variables: Vec::new(),
        extra: Default::default(),
    })
}
