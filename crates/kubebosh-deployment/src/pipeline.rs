//! Stage pipeline of a BoshDeployment
//!
//! Each stage persists its output as a versioned secret before the next one
//! starts:
//!
//! ```text
//! SpecObserved ─resolve+patch─▶ OpsApplied ─generate─▶ VariablesGenerated
//!   ─interpolate─▶ VariablesInterpolated ─convert─▶ ResourcesConverted
//!   ─apply─▶ Applied
//! ```
//!
//! A run starts after the entry phase and reads the artifacts of completed
//! stages back from the store instead of recomputing them. Every artifact
//! write is gated on content equality and the apply is gated on a digest of
//! the converted objects, so a run over unchanged inputs writes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use kubebosh_common::config::DEFAULT_OPERATOR_IMAGE;
use kubebosh_common::config_source::ConfigSource;
use kubebosh_common::crd::{BoshDeployment, BoshDeploymentStatus, DeploymentPhase};
use kubebosh_common::events::{actions, reasons, EventPublisher};
use kubebosh_common::kube_utils::deterministic_hash;
use kubebosh_common::meta::controller_owner_ref;
use kubebosh_common::names;
use kubebosh_common::versioned_secret::{
    SecretContent, SecretScope, StoreOutcome, VersionedSecretStore,
};
use kubebosh_common::yaml::{parse_yaml, to_yaml_string};
use kubebosh_manifest::converter::{Converter, KubeResources};
use kubebosh_manifest::resolver::{desired_manifest, Resolver};
use kubebosh_manifest::variables::VariableGenerator;
use kubebosh_manifest::{
    Manifest, ManifestError, BPM_ARTIFACT_KEY, MANIFEST_ARTIFACT_KEY, PROPERTIES_ARTIFACT_KEY,
};

use crate::client::DeploymentKubeClient;
use crate::state;
use crate::DeploymentError;

/// What one run changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Versioned artifacts and variable secrets written
    pub artifacts_written: usize,
    /// Objects the converted manifest consists of
    pub objects: usize,
    /// Objects applied to the cluster; 0 when nothing changed
    pub applied: usize,
}

/// Runs the stages of a deployment
pub struct Pipeline {
    resolver: Resolver,
    variables: VariableGenerator,
    secrets: VersionedSecretStore,
    kube: Arc<dyn DeploymentKubeClient>,
    events: Arc<dyn EventPublisher>,
    operator_image: String,
}

impl Pipeline {
    pub fn new(
        configs: Arc<dyn ConfigSource>,
        secrets: VersionedSecretStore,
        kube: Arc<dyn DeploymentKubeClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            resolver: Resolver::new(configs),
            variables: VariableGenerator::new(secrets.clone()),
            secrets,
            kube,
            events,
            operator_image: DEFAULT_OPERATOR_IMAGE.to_string(),
        }
    }

    /// Image of the template renderer init container
    pub fn with_operator_image(mut self, image: impl Into<String>) -> Self {
        self.operator_image = image.into();
        self
    }

    /// Phase the next run of `deployment` starts from
    ///
    /// Input versions are read without parsing; when they cannot be read
    /// the run starts over and the resolve stage reports the problem.
    pub async fn entry_phase(
        &self,
        deployment: &BoshDeployment,
        namespace: &str,
    ) -> DeploymentPhase {
        let inputs = match self.resolver.input_versions(&deployment.spec, namespace).await {
            Ok(inputs) => Some(inputs),
            Err(e) => {
                debug!(
                    deployment = %deployment.name_any(),
                    error = %e,
                    "cannot read input versions"
                );
                None
            }
        };
        state::entry_phase(deployment, inputs.as_ref())
    }

    /// Run every stage after `entry`, recording progress in `status`
    ///
    /// On error `status` holds the last completed phase and the artifact
    /// versions of the stages that did complete.
    pub async fn run(
        &self,
        deployment: &BoshDeployment,
        entry: DeploymentPhase,
        status: &mut BoshDeploymentStatus,
    ) -> Result<RunSummary, DeploymentError> {
        let name = deployment.name_any();
        let namespace = deployment
            .namespace()
            .ok_or_else(|| DeploymentError::MissingNamespace { name: name.clone() })?;
        let scope =
            SecretScope::new(&namespace, &name).with_owner(controller_owner_ref(deployment));
        let mut run = Run {
            pipeline: self,
            deployment,
            name: &name,
            namespace: &namespace,
            scope,
            summary: RunSummary::default(),
        };

        let (document, manifest) = run.ops_applied(entry, status).await?;
        status.phase = DeploymentPhase::OpsApplied;

        if entry <= DeploymentPhase::OpsApplied {
            run.variables_generated(&manifest).await?;
        }
        status.phase = DeploymentPhase::VariablesGenerated;

        let desired = run.variables_interpolated(entry, &document, &manifest, status).await?;
        status.phase = DeploymentPhase::VariablesInterpolated;

        let resources = run.resources_converted(&desired).await?;
        status.phase = DeploymentPhase::ResourcesConverted;

        run.applied(&resources, status).await?;
        status.phase = DeploymentPhase::Applied;

        Ok(run.summary)
    }
}

/// State of one pipeline run
struct Run<'a> {
    pipeline: &'a Pipeline,
    deployment: &'a BoshDeployment,
    name: &'a str,
    namespace: &'a str,
    scope: SecretScope,
    summary: RunSummary,
}

impl Run<'_> {
    // =========================================================================
    // SpecObserved → OpsApplied
    // =========================================================================

    async fn ops_applied(
        &mut self,
        entry: DeploymentPhase,
        status: &mut BoshDeploymentStatus,
    ) -> Result<(Value, Manifest), DeploymentError> {
        let stage = DeploymentPhase::OpsApplied;
        if entry > DeploymentPhase::SpecObserved {
            if let Some(stored) = self
                .load_with_ops(status.with_ops_version)
                .await
                .map_err(|e| DeploymentError::stage(stage, e))?
            {
                return Ok(stored);
            }
            warn!(deployment = %self.name, "with-ops manifest missing, resolving again");
        }

        let resolved = self
            .pipeline
            .resolver
            .resolve_crd(&self.deployment.spec, self.namespace)
            .await
            .map_err(|e| DeploymentError::stage(stage, e))?;
        let yaml = to_yaml_string(&resolved.document).map_err(|e| {
            DeploymentError::stage(
                stage,
                ManifestError::Schema {
                    message: e.to_string(),
                },
            )
        })?;

        let content = SecretContent::single(MANIFEST_ARTIFACT_KEY, yaml)
            .described(format!("manifest of deployment '{}' with ops applied", self.name));
        let outcome = self
            .write(stage, &names::with_ops_prefix(self.name), &content)
            .await?;
        if outcome.is_created() {
            self.publish(
                reasons::MANIFEST_RESOLVED,
                format!("resolved manifest as {}", outcome.secret().name),
            )
            .await;
        }

        status.inputs = resolved.inputs;
        status.with_ops_version = Some(outcome.version());
        Ok((resolved.document, self.named(resolved.manifest)))
    }

    async fn load_with_ops(
        &self,
        version: Option<u64>,
    ) -> Result<Option<(Value, Manifest)>, ManifestError> {
        let prefix = names::with_ops_prefix(self.name);
        let secret = match version {
            Some(v) => self.pipeline.secrets.get(&self.scope, &prefix, v).await?,
            None => self.pipeline.secrets.latest(&self.scope, &prefix).await?,
        };
        let Some(secret) = secret else {
            return Ok(None);
        };
        let text = secret.value(MANIFEST_ARTIFACT_KEY).unwrap_or_default();
        let document = parse_yaml(text).map_err(|e| ManifestError::Parse {
            source_name: secret.name.clone(),
            message: e.to_string(),
        })?;
        let manifest = Manifest::from_value(document.clone())?;
        debug!(deployment = %self.name, secret = %secret.name, "loaded with-ops manifest");
        Ok(Some((document, self.named(manifest))))
    }

    // =========================================================================
    // OpsApplied → VariablesGenerated
    // =========================================================================

    async fn variables_generated(&mut self, manifest: &Manifest) -> Result<(), DeploymentError> {
        let generated = self
            .pipeline
            .variables
            .generate(&self.scope, manifest)
            .await
            .map_err(|e| DeploymentError::stage(DeploymentPhase::VariablesGenerated, e))?;
        let created: Vec<_> = generated
            .iter()
            .filter(|g| g.created)
            .map(|g| g.variable.as_str())
            .collect();
        if !created.is_empty() {
            self.summary.artifacts_written += created.len();
            let message = format!("generated variables {}", created.join(", "));
            self.publish(reasons::VARIABLES_GENERATED, message).await;
        }
        Ok(())
    }

    // =========================================================================
    // VariablesGenerated → VariablesInterpolated
    // =========================================================================

    async fn variables_interpolated(
        &mut self,
        entry: DeploymentPhase,
        document: &Value,
        manifest: &Manifest,
        status: &mut BoshDeploymentStatus,
    ) -> Result<Manifest, DeploymentError> {
        let stage = DeploymentPhase::VariablesInterpolated;
        let prefix = names::desired_manifest_prefix(self.name);

        if entry >= DeploymentPhase::VariablesInterpolated {
            if let Some(version) = status.desired_manifest_version {
                let stored = self
                    .pipeline
                    .secrets
                    .get(&self.scope, &prefix, version)
                    .await
                    .map_err(|e| DeploymentError::stage(stage, e))?;
                if let Some(secret) = stored {
                    let text = secret.value(MANIFEST_ARTIFACT_KEY).unwrap_or_default();
                    let desired = Manifest::from_yaml(&secret.name, text)
                        .map_err(|e| DeploymentError::stage(stage, e))?;
                    return Ok(self.named(desired));
                }
            }
        }

        let loaded = self
            .pipeline
            .variables
            .load(&self.scope, manifest)
            .await
            .map_err(|e| DeploymentError::stage(stage, e))?;
        let desired = desired_manifest(document, &loaded.values)
            .map(|m| self.named(m))
            .map_err(|e| DeploymentError::stage(stage, e))?;
        let yaml = desired
            .to_yaml()
            .map_err(|e| DeploymentError::stage(stage, e))?;

        let content = SecretContent::single(MANIFEST_ARTIFACT_KEY, yaml)
            .described(format!("desired manifest of deployment '{}'", self.name));
        let outcome = self.write(stage, &prefix, &content).await?;
        if outcome.is_created() {
            self.publish(
                reasons::VARIABLES_INTERPOLATED,
                format!("interpolated variables into {}", outcome.secret().name),
            )
            .await;
        }

        status.desired_manifest_version = Some(outcome.version());
        status.variable_versions = Some(loaded.digest);
        Ok(desired)
    }

    // =========================================================================
    // VariablesInterpolated → ResourcesConverted
    // =========================================================================

    async fn resources_converted(
        &mut self,
        desired: &Manifest,
    ) -> Result<KubeResources, DeploymentError> {
        let stage = DeploymentPhase::ResourcesConverted;
        let converter = Converter::new(desired, self.namespace)
            .with_operator_image(&self.pipeline.operator_image)
            .with_owner(self.scope.owner.clone());
        let artifacts = converter
            .artifacts()
            .map_err(|e| DeploymentError::stage(stage, e))?;

        let mut resolved_versions = BTreeMap::new();
        let mut written = 0;
        for artifact in artifacts {
            let ig = &artifact.instance_group;
            let properties = SecretContent::single(PROPERTIES_ARTIFACT_KEY, artifact.properties)
                .described(format!("resolved properties of instance group '{ig}'"));
            let outcome = self
                .write(stage, &names::ig_resolved_prefix(self.name, ig), &properties)
                .await?;
            written += usize::from(outcome.is_created());
            resolved_versions.insert(ig.clone(), outcome.version());

            let bpm = SecretContent::single(BPM_ARTIFACT_KEY, artifact.bpm)
                .described(format!("BPM configs of instance group '{ig}'"));
            let outcome = self
                .write(stage, &names::bpm_prefix(self.name, ig), &bpm)
                .await?;
            written += usize::from(outcome.is_created());
        }

        let resources = converter
            .convert(&resolved_versions)
            .map_err(|e| DeploymentError::stage(stage, e))?;
        self.summary.objects = resources.len();
        if written > 0 {
            let message = format!(
                "converted {} instance groups into {} objects",
                resolved_versions.len(),
                resources.len()
            );
            self.publish(reasons::RESOURCES_CONVERTED, message).await;
        }
        Ok(resources)
    }

    // =========================================================================
    // ResourcesConverted → Applied
    // =========================================================================

    async fn applied(
        &mut self,
        resources: &KubeResources,
        status: &mut BoshDeploymentStatus,
    ) -> Result<(), DeploymentError> {
        let digest = resources_digest(resources)?;
        if status.applied_digest.as_deref() == Some(digest.as_str()) {
            debug!(deployment = %self.name, %digest, "resources unchanged, skipping apply");
            return Ok(());
        }

        let applied = self
            .pipeline
            .kube
            .apply_resources(self.namespace, resources)
            .await?;
        info!(deployment = %self.name, applied, %digest, "applied resources");
        self.summary.applied = applied;
        self.publish(
            reasons::RESOURCES_APPLIED,
            format!("applied {applied} objects"),
        )
        .await;
        status.applied_digest = Some(digest);
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn write(
        &mut self,
        stage: DeploymentPhase,
        prefix: &str,
        content: &SecretContent,
    ) -> Result<StoreOutcome, DeploymentError> {
        let outcome = self
            .pipeline
            .secrets
            .create_if_changed(&self.scope, prefix, content)
            .await
            .map_err(|e| DeploymentError::stage(stage, e))?;
        if outcome.is_created() {
            self.summary.artifacts_written += 1;
        }
        Ok(outcome)
    }

    /// Workload and secret names derive from the BoshDeployment name, not
    /// from the `name` field inside the manifest
    fn named(&self, mut manifest: Manifest) -> Manifest {
        if manifest.name != self.name {
            if !manifest.name.is_empty() {
                debug!(
                    deployment = %self.name,
                    manifest_name = %manifest.name,
                    "using deployment name instead of manifest name"
                );
            }
            manifest.name = self.name.to_string();
        }
        manifest
    }

    async fn publish(&self, reason: &str, note: String) {
        self.pipeline
            .events
            .publish(
                &self.deployment.object_ref(&()),
                EventType::Normal,
                reason,
                actions::RECONCILE,
                Some(note),
            )
            .await;
    }
}

/// Digest of the objects a deployment converts into
pub fn resources_digest(resources: &KubeResources) -> Result<String, DeploymentError> {
    let serialized = serde_json::to_string(&(
        &resources.services,
        &resources.stateful_sets,
        &resources.extended_jobs,
    ))?;
    Ok(deterministic_hash(&serialized))
}
