//! Canonical metadata for every object the operator generates
//!
//! Generated objects carry a `ResourceMeta` value by field and convert it into
//! Kubernetes `ObjectMeta` at the edge, so owner references and management
//! labels are applied the same way everywhere.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

/// Label marking objects managed by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY_KUBEBOSH: &str = "kubebosh";

/// Name, namespace, labels and owners of a generated object
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Owner references
    pub owner_refs: Vec<OwnerReference>,
}

impl ResourceMeta {
    /// Create new metadata with the management label set
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_KUBEBOSH.to_string());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
            owner_refs: Vec::new(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add several labels
    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Add an owner reference
    pub fn with_owner(mut self, owner: Option<OwnerReference>) -> Self {
        if let Some(owner) = owner {
            self.owner_refs.push(owner);
        }
        self
    }

    /// Convert into Kubernetes `ObjectMeta`
    pub fn to_object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: non_empty(&self.labels),
            annotations: non_empty(&self.annotations),
            owner_references: if self.owner_refs.is_empty() {
                None
            } else {
                Some(self.owner_refs.clone())
            },
            ..Default::default()
        }
    }
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

/// Controller owner reference for a custom resource
///
/// Returns `None` for objects that have not been persisted yet (no uid).
pub fn controller_owner_ref<K>(obj: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    obj.controller_owner_ref(&())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_meta_is_marked_managed() {
        let meta = ResourceMeta::new("nats-nats", "cf");
        assert_eq!(
            meta.labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(MANAGED_BY_KUBEBOSH)
        );
    }

    #[test]
    fn object_meta_carries_owner_and_skips_empty_maps() {
        let owner = OwnerReference {
            api_version: "kubebosh.dev/v1alpha1".into(),
            kind: "BoshDeployment".into(),
            name: "nats".into(),
            uid: "1234".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let om = ResourceMeta::new("nats-nats", "cf")
            .with_label("kubebosh.dev/deployment-name", "nats")
            .with_owner(Some(owner.clone()))
            .to_object_meta();
        assert_eq!(om.name.as_deref(), Some("nats-nats"));
        assert_eq!(om.owner_references, Some(vec![owner]));
        assert!(om.annotations.is_none());
        assert_eq!(om.labels.unwrap().len(), 2);
    }
}
