//! Manifest resolution from ConfigMaps and Secrets
//!
//! A `BoshDeployment` names a manifest object and ordered ops objects. The
//! resolver reads them through a [`ConfigSource`], applies the ops, and
//! returns the patched manifest together with the resourceVersion of every
//! input so callers can tell when an input changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use kubebosh_common::config_source::ConfigSource;
use kubebosh_common::crd::{BoshDeploymentSpec, ConfigKind, ConfigReference};
use kubebosh_common::yaml::parse_yaml;

use crate::interpolate::interpolate;
use crate::model::Manifest;
use crate::patch::{self, Op};
use crate::{ManifestError, Result, MANIFEST_KEY, OPS_KEY};

/// A manifest with ops applied, before variable interpolation
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    /// The patched document, placeholders intact
    pub document: Value,
    /// resourceVersion of every input, keyed by `type/ref`
    pub inputs: BTreeMap<String, String>,
}

/// Fetches and patches manifests
#[derive(Clone)]
pub struct Resolver {
    source: Arc<dyn ConfigSource>,
}

impl Resolver {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    /// Fetch the manifest and ops of `spec` and apply the ops
    pub async fn resolve_crd(
        &self,
        spec: &BoshDeploymentSpec,
        namespace: &str,
    ) -> Result<ResolvedManifest> {
        spec.validate()
            .map_err(|errors| ManifestError::schema(errors.join("; ")))?;

        let mut inputs = BTreeMap::new();

        let (text, version) = self.fetch_key(&spec.manifest, namespace, MANIFEST_KEY).await?;
        inputs.insert(spec.manifest.input_key(), version);
        let mut document = parse_yaml(&text)
            .map_err(|e| ManifestError::parse(source_name(&spec.manifest, namespace), e))?;

        for reference in &spec.ops {
            let (text, version) = self.fetch_key(reference, namespace, OPS_KEY).await?;
            inputs.insert(reference.input_key(), version);
            let ops = parse_ops_text(&source_name(reference, namespace), &text)?;
            document = patch::apply(&document, &ops)?;
            debug!(
                ops = %reference.ref_,
                count = ops.len(),
                "applied ops file"
            );
        }

        let manifest = Manifest::from_value(document.clone())?;
        Ok(ResolvedManifest {
            manifest,
            document,
            inputs,
        })
    }

    /// resourceVersion of every input of `spec`, without parsing anything
    pub async fn input_versions(
        &self,
        spec: &BoshDeploymentSpec,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut inputs = BTreeMap::new();
        let mut references = vec![(&spec.manifest, MANIFEST_KEY)];
        references.extend(spec.ops.iter().map(|r| (r, OPS_KEY)));
        for (reference, key) in references {
            let (_, version) = self.fetch_key(reference, namespace, key).await?;
            inputs.insert(reference.input_key(), version);
        }
        Ok(inputs)
    }

    async fn fetch_key(
        &self,
        reference: &ConfigReference,
        namespace: &str,
        key: &str,
    ) -> Result<(String, String)> {
        let kind = reference.kind().ok_or_else(|| {
            ManifestError::schema(format!("unsupported type '{}'", reference.type_))
        })?;
        let object = self
            .source
            .fetch(kind, namespace, &reference.ref_)
            .await?
            .ok_or_else(|| not_found(kind, namespace, &reference.ref_))?;
        let text = object
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| ManifestError::MissingKey {
                kind,
                namespace: namespace.to_string(),
                name: reference.ref_.clone(),
                key: key.to_string(),
            })?;
        Ok((text, object.resource_version))
    }
}

/// Substitute generated variables into a patched manifest document
pub fn desired_manifest(
    document: &Value,
    variables: &BTreeMap<String, Value>,
) -> Result<Manifest> {
    Manifest::from_value(interpolate(document, variables)?)
}

/// Parse ops YAML text into operations
pub fn parse_ops_text(source_name: &str, text: &str) -> Result<Vec<Op>> {
    let document = parse_yaml(text).map_err(|e| ManifestError::parse(source_name, e))?;
    patch::parse_ops(&document)
}

fn not_found(kind: ConfigKind, namespace: &str, name: &str) -> ManifestError {
    ManifestError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn source_name(reference: &ConfigReference, namespace: &str) -> String {
    format!("{} '{}/{}'", reference.type_, namespace, reference.ref_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubebosh_common::testing::InMemoryConfigSource;
    use serde_json::json;

    const MANIFEST: &str = r#"
name: foo
instance_groups:
- name: component1
  instances: 1
  jobs:
  - name: job1
    release: release1
    properties:
      password: ((adminpass))
- name: component2
  instances: 2
variables:
- name: adminpass
  type: password
"#;

    const OPS: &str = r#"
- type: replace
  path: /instance_groups/name=component1/instances
  value: 2
"#;

    fn spec(manifest: ConfigReference, ops: Vec<ConfigReference>) -> BoshDeploymentSpec {
        BoshDeploymentSpec { manifest, ops }
    }

    fn resolver(source: &Arc<InMemoryConfigSource>) -> Resolver {
        Resolver::new(source.clone())
    }

    #[tokio::test]
    async fn missing_manifest_object_names_namespace_and_ref() {
        let source = Arc::new(InMemoryConfigSource::default());
        let err = resolver(&source)
            .resolve_crd(&spec(ConfigReference::config_map("not_existing"), vec![]), "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::NotFound { .. }));
        let msg = err.to_string();
        assert!(msg.contains("default/not_existing"), "{msg}");
    }

    #[tokio::test]
    async fn object_without_manifest_key_is_missing_key() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "missing_key", "other", "x");
        let err = resolver(&source)
            .resolve_crd(&spec(ConfigReference::config_map("missing_key"), vec![]), "default")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing manifest key"), "{err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn ops_are_applied_in_order() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "base", MANIFEST_KEY, MANIFEST);
        source.insert_key(ConfigKind::Secret, "default", "scale", OPS_KEY, OPS);
        source.insert_key(
            ConfigKind::ConfigMap,
            "default",
            "rename",
            OPS_KEY,
            "- type: replace\n  path: /instance_groups/name=component1/instances\n  value: 5\n",
        );

        let resolved = resolver(&source)
            .resolve_crd(
                &spec(
                    ConfigReference::config_map("base"),
                    vec![
                        ConfigReference::secret("scale"),
                        ConfigReference::config_map("rename"),
                    ],
                ),
                "default",
            )
            .await
            .unwrap();

        assert_eq!(resolved.manifest.instance_groups[0].instances, 5);
        assert_eq!(resolved.inputs.len(), 3);
        assert!(resolved.inputs.contains_key("secret/scale"));
        assert_eq!(
            resolved.document["instance_groups"][0]["jobs"][0]["properties"]["password"],
            json!("((adminpass))")
        );
    }

    #[tokio::test]
    async fn missing_ops_object_fails() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "base", MANIFEST_KEY, MANIFEST);
        let err = resolver(&source)
            .resolve_crd(
                &spec(
                    ConfigReference::config_map("base"),
                    vec![ConfigReference::config_map("absent")],
                ),
                "default",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("default/absent"));
    }

    #[tokio::test]
    async fn ops_without_ops_key_is_missing_key() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "base", MANIFEST_KEY, MANIFEST);
        source.insert_key(ConfigKind::ConfigMap, "default", "ops", "manifest", OPS);
        let err = resolver(&source)
            .resolve_crd(
                &spec(
                    ConfigReference::config_map("base"),
                    vec![ConfigReference::config_map("ops")],
                ),
                "default",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing ops key"), "{err}");
    }

    #[tokio::test]
    async fn invalid_ops_type_fails_to_build_ops() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "base", MANIFEST_KEY, MANIFEST);
        source.insert_key(
            ConfigKind::ConfigMap,
            "default",
            "bad",
            OPS_KEY,
            "- type: invalid-ops\n  path: /name\n  value: x\n",
        );
        let err = resolver(&source)
            .resolve_crd(
                &spec(
                    ConfigReference::config_map("base"),
                    vec![ConfigReference::config_map("bad")],
                ),
                "default",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Patch { index: 0, .. }));
    }

    #[tokio::test]
    async fn empty_document_resolves_to_empty_manifest() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "empty", MANIFEST_KEY, "---");
        let resolved = resolver(&source)
            .resolve_crd(&spec(ConfigReference::config_map("empty"), vec![]), "default")
            .await
            .unwrap();
        assert!(resolved.manifest.instance_groups.is_empty());
    }

    #[tokio::test]
    async fn malformed_yaml_is_a_parse_error() {
        let source = Arc::new(InMemoryConfigSource::default());
        source.insert_key(ConfigKind::ConfigMap, "default", "bad", MANIFEST_KEY, "name: [unclosed");
        let err = resolver(&source)
            .resolve_crd(&spec(ConfigReference::config_map("bad"), vec![]), "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(err.to_string().contains("configmap 'default/bad'"));
    }

    #[test]
    fn desired_manifest_interpolates_variables() {
        let document = parse_yaml(MANIFEST).unwrap();
        let mut variables = BTreeMap::new();
        variables.insert("adminpass".to_string(), json!("s3cret"));
        let manifest = desired_manifest(&document, &variables).unwrap();
        assert_eq!(
            manifest.instance_groups[0].jobs[0].properties["password"],
            json!("s3cret")
        );
    }

    #[test]
    fn desired_manifest_reports_missing_variable() {
        let document = parse_yaml(MANIFEST).unwrap();
        let err = desired_manifest(&document, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("adminpass"));
    }
}
