//! Network endpoints of an instance group

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubebosh_common::meta::ResourceMeta;
use kubebosh_common::{
    names, LABEL_AZ_INDEX, LABEL_DEPLOYMENT_NAME, LABEL_INSTANCE_GROUP_NAME, LABEL_POD_ORDINAL,
};

use super::instances::instance_service_name;
use crate::model::InstanceGroup;
use crate::Result;

/// Ports declared by all jobs of an instance group, in job order
pub fn declared_ports(ig: &InstanceGroup) -> Result<Vec<ServicePort>> {
    let mut ports = Vec::new();
    for job in &ig.jobs {
        for port in job.containerization()?.ports {
            ports.push(ServicePort {
                name: Some(port.name),
                protocol: Some(port.protocol),
                port: port.internal,
                target_port: Some(IntOrString::Int(port.internal)),
                ..Default::default()
            });
        }
    }
    Ok(ports)
}

/// Services of a service-lifecycle instance group
///
/// One Service per (zone, ordinal), ordered by global index, followed by
/// one headless Service spanning the whole group. Without declared ports
/// only the headless Service is emitted.
pub fn instance_group_services(
    deployment: &str,
    namespace: &str,
    ig: &InstanceGroup,
    owner: Option<&OwnerReference>,
) -> Result<Vec<Service>> {
    let ports = declared_ports(ig)?;
    let zones = ig.zones();
    let group_selector = BTreeMap::from([
        (LABEL_DEPLOYMENT_NAME.to_string(), deployment.to_string()),
        (LABEL_INSTANCE_GROUP_NAME.to_string(), names::sanitize_label(&ig.name)),
    ]);

    let mut services = Vec::new();
    if !ports.is_empty() {
        for ordinal in 0..ig.instances {
            for az_index in 0..zones.len() {
                let index = ig.instance_index(ordinal, az_index);
                let mut selector = group_selector.clone();
                selector.insert(LABEL_AZ_INDEX.to_string(), az_index.to_string());
                selector.insert(LABEL_POD_ORDINAL.to_string(), ordinal.to_string());

                let name = instance_service_name(deployment, &ig.name, index);
                let meta = ResourceMeta::new(name, namespace)
                    .with_labels(group_selector.clone())
                    .with_owner(owner.cloned());
                services.push(Service {
                    metadata: meta.to_object_meta(),
                    spec: Some(ServiceSpec {
                        selector: Some(selector),
                        ports: Some(ports.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }
    }

    let headless_name = names::instance_group_workload_name(deployment, &ig.name);
    let headless = ResourceMeta::new(headless_name, namespace)
        .with_labels(group_selector.clone())
        .with_owner(owner.cloned());
    services.push(Service {
        metadata: headless.to_object_meta(),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(group_selector),
            ports: (!ports.is_empty()).then_some(ports),
            ..Default::default()
        }),
        ..Default::default()
    });
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Manifest;

    const MANIFEST: &str = r#"
name: nats-deployment
instance_groups:
- name: nats
  instances: 2
  azs: [z1, z2]
  jobs:
  - name: nats
    release: nats
    properties:
      bosh_containerization:
        ports:
        - name: nats
          internal: 4222
        - name: nats-routes
          protocol: TCP
          internal: 4223
"#;

    fn services() -> Vec<Service> {
        let manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        instance_group_services("nats-deployment", "default", &manifest.instance_groups[0], None)
            .unwrap()
    }

    #[test]
    fn one_service_per_instance_then_headless() {
        let services = services();
        assert_eq!(services.len(), 5);
        let names: Vec<_> = services
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "nats-deployment-nats-0",
                "nats-deployment-nats-1",
                "nats-deployment-nats-2",
                "nats-deployment-nats-3",
                "nats-deployment-nats",
            ]
        );
        let headless = services[4].spec.as_ref().unwrap();
        assert_eq!(headless.cluster_ip.as_deref(), Some("None"));
    }

    #[test]
    fn instance_service_selects_zone_and_ordinal() {
        let services = services();
        // index 1 is ordinal 0 in the second zone
        let selector = services[1].spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(selector[LABEL_AZ_INDEX], "1");
        assert_eq!(selector[LABEL_POD_ORDINAL], "0");
        assert_eq!(selector[LABEL_INSTANCE_GROUP_NAME], "nats");

        let selector = services[2].spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(selector[LABEL_AZ_INDEX], "0");
        assert_eq!(selector[LABEL_POD_ORDINAL], "1");
    }

    #[test]
    fn ports_come_from_all_declarations() {
        let services = services();
        let ports = services[0].spec.as_ref().unwrap().ports.clone().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].name.as_deref(), Some("nats-routes"));
        assert_eq!(ports[1].port, 4223);
        assert_eq!(ports[1].target_port, Some(IntOrString::Int(4223)));
    }

    #[test]
    fn no_ports_means_headless_only() {
        let mut manifest = Manifest::from_yaml("test", MANIFEST).unwrap();
        manifest.instance_groups[0].jobs[0].properties.clear();
        let services =
            instance_group_services(
                "nats-deployment",
                "default",
                &manifest.instance_groups[0],
                None,
            )
                .unwrap();
        assert_eq!(services.len(), 1);
        assert!(services[0].spec.as_ref().unwrap().ports.is_none());
    }
}
