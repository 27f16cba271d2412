//! Whole-pipeline runs against in-memory stores

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use kubebosh_common::crd::{
    BoshDeployment, BoshDeploymentSpec, BoshDeploymentStatus, ConfigKind, ConfigReference,
    DeploymentPhase,
};
use kubebosh_common::events::NoopEventPublisher;
use kubebosh_common::names;
use kubebosh_common::testing::{InMemoryConfigSource, InMemorySecretBackend};
use kubebosh_common::versioned_secret::{SecretContent, SecretScope, VersionedSecretStore};
use kubebosh_deployment::client::DeploymentKubeClient;
use kubebosh_deployment::{DeploymentError, Pipeline};
use kubebosh_manifest::converter::KubeResources;

const NAMESPACE: &str = "default";

const MANIFEST: &str = r#"
name: nats
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
  instances: 2
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
- name: nats_ca
  type: certificate
  options:
    is_ca: true
    common_name: nats-ca
"#;

const OPS: &str = r#"
- type: replace
  path: /instance_groups/name=nats/instances
  value: 3
"#;

/// Records applies instead of talking to a cluster
#[derive(Default)]
struct RecordingKube {
    applies: AtomicUsize,
    objects: AtomicUsize,
}

#[async_trait]
impl DeploymentKubeClient for RecordingKube {
    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        _status: &BoshDeploymentStatus,
    ) -> Result<(), DeploymentError> {
        Ok(())
    }

    async fn apply_resources(
        &self,
        _namespace: &str,
        resources: &KubeResources,
    ) -> Result<usize, DeploymentError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.objects.store(resources.len(), Ordering::SeqCst);
        Ok(resources.len())
    }
}

struct Harness {
    configs: Arc<InMemoryConfigSource>,
    backend: Arc<InMemorySecretBackend>,
    kube: Arc<RecordingKube>,
    pipeline: Pipeline,
}

impl Harness {
    fn new() -> Self {
        let configs = Arc::new(InMemoryConfigSource::default());
        configs.insert_key(
            ConfigKind::ConfigMap,
            NAMESPACE,
            "nats-manifest",
            "manifest",
            MANIFEST,
        );
        let backend = Arc::new(InMemorySecretBackend::default());
        let kube = Arc::new(RecordingKube::default());
        let pipeline = Pipeline::new(
            configs.clone(),
            VersionedSecretStore::new(backend.clone()),
            kube.clone(),
            Arc::new(NoopEventPublisher),
        );
        Self {
            configs,
            backend,
            kube,
            pipeline,
        }
    }

    fn store(&self) -> VersionedSecretStore {
        VersionedSecretStore::new(self.backend.clone())
    }

    /// One reconcile: pick the entry phase, run, store the status
    async fn reconcile(&self, deployment: &mut BoshDeployment) -> Result<(), DeploymentError> {
        let entry = self.pipeline.entry_phase(deployment, NAMESPACE).await;
        let mut status = deployment.status.clone().unwrap_or_default();
        status.phase = entry;
        status.observed_generation = deployment.metadata.generation;
        let result = self.pipeline.run(deployment, entry, &mut status).await;
        deployment.status = Some(status);
        result.map(|_| ())
    }
}

fn deployment(ops: Vec<ConfigReference>) -> BoshDeployment {
    let mut d = BoshDeployment::new(
        "nats",
        BoshDeploymentSpec {
            manifest: ConfigReference::config_map("nats-manifest"),
            ops,
        },
    );
    d.metadata.namespace = Some(NAMESPACE.into());
    d.metadata.uid = Some("6b1e3c9e-0000-4000-8000-000000000001".into());
    d.metadata.generation = Some(1);
    d
}

#[tokio::test]
async fn first_run_writes_every_stage_and_applies() {
    let h = Harness::new();
    let mut d = deployment(vec![]);
    h.reconcile(&mut d).await.unwrap();

    let status = d.status.clone().unwrap();
    assert_eq!(status.phase, DeploymentPhase::Applied);
    assert_eq!(status.with_ops_version, Some(1));
    assert_eq!(status.desired_manifest_version, Some(1));
    assert!(status.applied_digest.is_some());
    assert!(status.variable_versions.is_some());

    let stored = h.backend.names(NAMESPACE);
    for expected in [
        "nats.with-ops-v1",
        "nats.desired-manifest-v1",
        "nats.ig-resolved.nats-v1",
        "nats.ig-resolved.smoke-tests-v1",
        "nats.bpm.nats-v1",
        "nats.bpm.smoke-tests-v1",
        "nats.var-nats-password",
        "nats.var-nats-ca",
    ] {
        assert!(stored.iter().any(|n| n == expected), "missing {expected} in {stored:?}");
    }

    assert_eq!(h.kube.applies.load(Ordering::SeqCst), 1);
    // one StatefulSet, one ExtendedJob, two instance services, one headless
    assert_eq!(h.kube.objects.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn second_run_on_unchanged_inputs_writes_nothing() {
    let h = Harness::new();
    let mut d = deployment(vec![]);
    h.reconcile(&mut d).await.unwrap();
    let writes = h.backend.write_count();
    let digest = d.status.as_ref().unwrap().applied_digest.clone();

    h.reconcile(&mut d).await.unwrap();

    assert_eq!(h.backend.write_count(), writes);
    assert_eq!(h.kube.applies.load(Ordering::SeqCst), 1);
    let status = d.status.unwrap();
    assert_eq!(status.phase, DeploymentPhase::Applied);
    assert_eq!(status.applied_digest, digest);
}

#[tokio::test]
async fn ops_change_produces_new_versions_and_reapplies() {
    let h = Harness::new();
    h.configs
        .insert_key(ConfigKind::ConfigMap, NAMESPACE, "nats-ops", "ops", "[]");
    let mut d = deployment(vec![ConfigReference::config_map("nats-ops")]);
    h.reconcile(&mut d).await.unwrap();

    h.configs
        .insert_key(ConfigKind::ConfigMap, NAMESPACE, "nats-ops", "ops", OPS);
    h.reconcile(&mut d).await.unwrap();

    let status = d.status.unwrap();
    assert_eq!(status.with_ops_version, Some(2));
    assert_eq!(status.desired_manifest_version, Some(2));
    assert_eq!(h.kube.applies.load(Ordering::SeqCst), 2);
    // instance count only changes the resolved properties of the nats group
    let scope = SecretScope::new(NAMESPACE, "nats");
    let store = h.store();
    assert_eq!(
        store
            .latest_version(&scope, &names::ig_resolved_prefix("nats", "nats"))
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        store
            .latest_version(&scope, &names::ig_resolved_prefix("nats", "smoke-tests"))
            .await
            .unwrap(),
        1
    );
    // variables are never regenerated
    let stored = h.backend.names(NAMESPACE);
    assert!(stored.iter().all(|n| !n.contains(".var-nats-password-v")));
}

#[tokio::test]
async fn rotated_variable_reinterpolates_and_reapplies() {
    let h = Harness::new();
    let mut d = deployment(vec![]);
    h.reconcile(&mut d).await.unwrap();
    let before = d.status.clone().unwrap();

    let scope = SecretScope::new(NAMESPACE, "nats");
    let store = h.store();
    store
        .put(
            &scope,
            &names::variable_secret_name("nats", "nats_password"),
            &SecretContent::single("password", "rotated-secret"),
        )
        .await
        .unwrap();
    assert_eq!(
        h.pipeline.entry_phase(&d, NAMESPACE).await,
        DeploymentPhase::OpsApplied
    );
    h.reconcile(&mut d).await.unwrap();

    let status = d.status.unwrap();
    assert_eq!(status.phase, DeploymentPhase::Applied);
    assert_eq!(status.with_ops_version, Some(1));
    assert_eq!(status.desired_manifest_version, Some(2));
    assert_ne!(status.variable_versions, before.variable_versions);
    assert_ne!(status.applied_digest, before.applied_digest);
    assert_eq!(h.kube.applies.load(Ordering::SeqCst), 2);

    let desired = store
        .get(&scope, &names::desired_manifest_prefix("nats"), 2)
        .await
        .unwrap()
        .unwrap();
    assert!(desired.data.values().any(|v| v.contains("rotated-secret")));
}

#[tokio::test]
async fn failed_stage_keeps_earlier_artifacts_and_resumes() {
    let h = Harness::new();
    h.configs.insert_key(
        ConfigKind::ConfigMap,
        NAMESPACE,
        "nats-manifest",
        "manifest",
        &MANIFEST.replace("- name: nats_password\n  type: password\n", ""),
    );
    let mut d = deployment(vec![]);

    let err = h.reconcile(&mut d).await.unwrap_err();
    assert_eq!(err.failed_stage(), Some(DeploymentPhase::VariablesInterpolated));
    let status = d.status.clone().unwrap();
    assert_eq!(status.phase, DeploymentPhase::VariablesGenerated);
    assert_eq!(status.with_ops_version, Some(1));
    assert!(err.to_string().contains("nats_password"), "{err}");

    // the user fixes the manifest: a new input version starts over
    h.configs
        .insert_key(ConfigKind::ConfigMap, NAMESPACE, "nats-manifest", "manifest", MANIFEST);
    h.reconcile(&mut d).await.unwrap();
    let status = d.status.unwrap();
    assert_eq!(status.phase, DeploymentPhase::Applied);
    assert_eq!(status.with_ops_version, Some(2));
}

#[tokio::test]
async fn missing_manifest_object_reports_namespace_and_name() {
    let h = Harness::new();
    let mut d = deployment(vec![]);
    d.spec.manifest = ConfigReference::config_map("absent");

    let err = h.reconcile(&mut d).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("default/absent"), "{msg}");
    assert_eq!(err.failed_stage(), Some(DeploymentPhase::OpsApplied));
    assert!(h.backend.names(NAMESPACE).is_empty());
    assert_eq!(h.kube.applies.load(Ordering::SeqCst), 0);
}
