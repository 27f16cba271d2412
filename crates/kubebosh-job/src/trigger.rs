//! Errand controller: turns triggered ExtendedJobs into Jobs
//!
//! `manual` never runs on its own. `now` runs once and reverts to `manual`.
//! `once` runs once and moves to the terminal `done`. The Job name is
//! derived from the run counter, so a retried reconcile that already
//! created the Job finds it and only finishes the strategy update.
//!
//! With `updateOnConfigChange`, a `done` errand runs again when a ConfigMap
//! or Secret its pod template references gets a new resourceVersion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use kubebosh_common::config_source::ConfigSource;
use kubebosh_common::crd::{
    ConfigKind, ExtendedJob, ExtendedJobStatus, TriggerStrategy, LABEL_EJOB_NAME,
    LABEL_EXTENDED_JOB,
};
use kubebosh_common::events::{actions, reasons};
use kubebosh_common::kube_utils::deterministic_hash;
use kubebosh_common::meta::{controller_owner_ref, ResourceMeta};
use kubebosh_common::names;
use kubebosh_common::references::{ChangeEvent, ReferencingObject};

use crate::context::JobContext;
use crate::JobError;

/// Name of the Job of the given run
pub fn job_name(ejob: &str, run: u32) -> String {
    names::dns_label(&[ejob, &format!("r{run}")])
}

/// Build the Job of the next run
pub fn build_job(ejob: &ExtendedJob, namespace: &str) -> Job {
    let name = ejob.name_any();
    let run = ejob.status.as_ref().map(|s| s.runs).unwrap_or(0) + 1;

    let job_labels = BTreeMap::from([
        (LABEL_EXTENDED_JOB.to_string(), "true".to_string()),
        (LABEL_EJOB_NAME.to_string(), name.clone()),
    ]);

    let mut template: PodTemplateSpec = ejob.spec.template.clone();
    let meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(job_labels.clone());
    if let Some(spec) = template.spec.as_mut() {
        if spec.restart_policy.is_none() {
            spec.restart_policy = Some("Never".to_string());
        }
    }

    Job {
        metadata: ResourceMeta::new(job_name(&name, run), namespace)
            .with_labels(job_labels)
            .with_owner(controller_owner_ref(ejob))
            .to_object_meta(),
        spec: Some(JobSpec {
            template,
            backoff_limit: Some(2),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Digest over the resourceVersions of every ConfigMap and Secret the pod
/// template references; absent objects count with an empty version
pub async fn referenced_config_digest(
    configs: &dyn ConfigSource,
    namespace: &str,
    ejob: &ExtendedJob,
) -> Result<String, JobError> {
    let Some(pod) = ejob.spec.template.spec.as_ref() else {
        return Ok(deterministic_hash(""));
    };
    let references = ReferencingObject::JobTemplate(pod).referenced_config_names();
    let mut versions = Vec::new();
    for kind in [ConfigKind::ConfigMap, ConfigKind::Secret] {
        for name in references.of_kind(kind) {
            let version = configs
                .fetch(kind, namespace, name)
                .await?
                .map(|o| o.resource_version)
                .unwrap_or_default();
            versions.push(format!("{kind}/{name}={version}"));
        }
    }
    Ok(deterministic_hash(&versions.join(",")))
}

/// ExtendedJobs that re-run when the changed object changes
pub fn affected_extended_jobs(
    event: &ChangeEvent,
    ejobs: &[Arc<ExtendedJob>],
) -> Vec<ObjectRef<ExtendedJob>> {
    ejobs
        .iter()
        .filter(|ejob| ejob.spec.update_on_config_change)
        .filter(|ejob| {
            let (Some(namespace), Some(pod)) =
                (ejob.namespace(), ejob.spec.template.spec.as_ref())
            else {
                return false;
            };
            event.affects(
                &namespace,
                &ReferencingObject::JobTemplate(pod).referenced_config_names(),
            )
        })
        .map(|ejob| ObjectRef::from_obj(&**ejob))
        .collect()
}

/// Reconcile the trigger of an ExtendedJob
pub async fn reconcile(ejob: Arc<ExtendedJob>, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let name = ejob.name_any();
    let namespace = ejob
        .namespace()
        .ok_or_else(|| JobError::MissingNamespace {
            kind: "ExtendedJob",
            name: name.clone(),
        })?;

    let previous = ejob.status.clone().unwrap_or_default();
    let config_digest = if ejob.spec.update_on_config_change {
        Some(referenced_config_digest(ctx.configs.as_ref(), &namespace, &ejob).await?)
    } else {
        None
    };

    let strategy = ejob.spec.trigger.strategy;
    let next = match strategy.after_run() {
        Some(next) => next,
        // A finished auto errand runs again once its configuration changes
        None if strategy == TriggerStrategy::Done
            && config_digest.is_some()
            && previous.config_digest.is_some()
            && config_digest != previous.config_digest =>
        {
            info!(ejob = %name, "referenced configuration changed, re-running");
            TriggerStrategy::Done
        }
        None => {
            debug!(ejob = %name, %strategy, "trigger does not run");
            return Ok(Action::await_change());
        }
    };

    let job = build_job(&ejob, &namespace);
    let job_name = job.metadata.name.clone().unwrap_or_default();
    if ctx.kube.create_job(&namespace, &job).await? {
        info!(ejob = %name, job = %job_name, %strategy, "created job");
    } else {
        warn!(ejob = %name, job = %job_name, "job already exists, finishing trigger");
    }

    if next != strategy {
        ctx.kube
            .patch_trigger_strategy(&namespace, &name, next)
            .await?;
    }

    let status = ExtendedJobStatus {
        last_reconcile: Some(Utc::now().to_rfc3339()),
        succeeded: false,
        runs: previous.runs + 1,
        config_digest,
    };
    ctx.kube
        .patch_extended_job_status(&namespace, &name, &status)
        .await?;

    ctx.events
        .publish(
            &ejob.object_ref(&()),
            EventType::Normal,
            reasons::JOB_TRIGGERED,
            actions::TRIGGER,
            Some(format!("created job {job_name}, strategy now {next}")),
        )
        .await;

    Ok(Action::await_change())
}

pub fn error_policy(ejob: Arc<ExtendedJob>, error: &JobError, _ctx: Arc<JobContext>) -> Action {
    error!(?error, ejob = %ejob.name_any(), "trigger reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(10))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockJobKubeClient, MockPodLogReader};
    use kubebosh_common::crd::{ExtendedJobSpec, Trigger};
    use kubebosh_common::testing::{InMemoryConfigSource, InMemorySecretBackend};
    use kubebosh_common::versioned_secret::VersionedSecretStore;
    use k8s_openapi::api::core::v1::{Container, PodSpec, SecretVolumeSource, Volume};

    fn ejob(strategy: TriggerStrategy) -> ExtendedJob {
        let mut ejob = ExtendedJob::new(
            "smoke-tests",
            ExtendedJobSpec {
                trigger: Trigger { strategy },
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "busybox".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                output: None,
                update_on_config_change: false,
            },
        );
        ejob.metadata.namespace = Some("default".into());
        ejob.metadata.uid = Some("uid-1".into());
        ejob
    }

    fn context(kube: MockJobKubeClient) -> Arc<JobContext> {
        Arc::new(JobContext::for_testing(
            Arc::new(kube),
            Arc::new(MockPodLogReader::new()),
            VersionedSecretStore::new(Arc::new(InMemorySecretBackend::default())),
        ))
    }

    #[tokio::test]
    async fn once_runs_and_becomes_done() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_create_job()
            .times(1)
            .withf(|ns, job| {
                ns == "default" && job.metadata.name.as_deref() == Some("smoke-tests-r1")
            })
            .returning(|_, _| Ok(true));
        kube.expect_patch_trigger_strategy()
            .times(1)
            .withf(|_, name, strategy| name == "smoke-tests" && *strategy == TriggerStrategy::Done)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_extended_job_status()
            .times(1)
            .withf(|_, _, status| status.runs == 1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(ejob(TriggerStrategy::Once)), context(kube))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn done_never_runs_again() {
        // no expectations: any client call fails the test
        let kube = MockJobKubeClient::new();
        let action = reconcile(Arc::new(ejob(TriggerStrategy::Done)), context(kube))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn manual_does_nothing() {
        let kube = MockJobKubeClient::new();
        reconcile(Arc::new(ejob(TriggerStrategy::Manual)), context(kube))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn now_reverts_to_manual() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_create_job().times(1).returning(|_, _| Ok(true));
        kube.expect_patch_trigger_strategy()
            .times(1)
            .withf(|_, _, strategy| *strategy == TriggerStrategy::Manual)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_extended_job_status()
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(ejob(TriggerStrategy::Now)), context(kube))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn existing_job_still_finishes_the_trigger() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_create_job().times(1).returning(|_, _| Ok(false));
        kube.expect_patch_trigger_strategy()
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_extended_job_status()
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(ejob(TriggerStrategy::Once)), context(kube))
            .await
            .unwrap();
    }

    #[test]
    fn job_carries_tracking_labels_and_owner() {
        let mut e = ejob(TriggerStrategy::Once);
        e.status = Some(ExtendedJobStatus {
            runs: 2,
            ..Default::default()
        });
        let job = build_job(&e, "default");
        assert_eq!(job.metadata.name.as_deref(), Some("smoke-tests-r3"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_EXTENDED_JOB], "true");
        assert_eq!(labels[LABEL_EJOB_NAME], "smoke-tests");
        assert_eq!(job.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let template = &job.spec.as_ref().unwrap().template;
        assert_eq!(
            template.metadata.as_ref().unwrap().labels.as_ref().unwrap()[LABEL_EJOB_NAME],
            "smoke-tests"
        );
        assert_eq!(
            template.spec.as_ref().unwrap().restart_policy.as_deref(),
            Some("Never")
        );
    }

    fn config_ejob(strategy: TriggerStrategy, digest: Option<String>) -> ExtendedJob {
        let mut e = ejob(strategy);
        e.spec.update_on_config_change = true;
        if let Some(pod) = e.spec.template.spec.as_mut() {
            pod.volumes = Some(vec![Volume {
                name: "config".into(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some("smoke-config".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        e.status = Some(ExtendedJobStatus {
            runs: 1,
            config_digest: digest,
            ..Default::default()
        });
        e
    }

    fn config_context(
        kube: MockJobKubeClient,
        configs: Arc<InMemoryConfigSource>,
    ) -> Arc<JobContext> {
        let base = JobContext::for_testing(
            Arc::new(kube),
            Arc::new(MockPodLogReader::new()),
            VersionedSecretStore::new(Arc::new(InMemorySecretBackend::default())),
        );
        Arc::new(JobContext { configs, ..base })
    }

    #[tokio::test]
    async fn done_errand_reruns_after_config_change() {
        let configs = Arc::new(InMemoryConfigSource::default());
        configs.insert_key(ConfigKind::Secret, "default", "smoke-config", "k", "v1");
        let before = referenced_config_digest(
            configs.as_ref(),
            "default",
            &config_ejob(TriggerStrategy::Done, None),
        )
        .await
        .unwrap();
        configs.insert_key(ConfigKind::Secret, "default", "smoke-config", "k", "v2");

        let mut kube = MockJobKubeClient::new();
        kube.expect_create_job()
            .times(1)
            .withf(|_, job| job.metadata.name.as_deref() == Some("smoke-tests-r2"))
            .returning(|_, _| Ok(true));
        kube.expect_patch_trigger_strategy().times(0);
        kube.expect_patch_extended_job_status()
            .times(1)
            .withf(move |_, _, status| status.runs == 2 && status.config_digest.is_some())
            .returning(|_, _, _| Ok(()));

        reconcile(
            Arc::new(config_ejob(TriggerStrategy::Done, Some(before))),
            config_context(kube, configs),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn done_errand_with_unchanged_config_stays_done() {
        let configs = Arc::new(InMemoryConfigSource::default());
        configs.insert_key(ConfigKind::Secret, "default", "smoke-config", "k", "v1");
        let digest = referenced_config_digest(
            configs.as_ref(),
            "default",
            &config_ejob(TriggerStrategy::Done, None),
        )
        .await
        .unwrap();

        let kube = MockJobKubeClient::new();
        reconcile(
            Arc::new(config_ejob(TriggerStrategy::Done, Some(digest))),
            config_context(kube, configs),
        )
        .await
        .unwrap();
    }

    #[test]
    fn config_changes_route_to_opted_in_ejobs() {
        let opted_in = Arc::new(config_ejob(TriggerStrategy::Done, None));
        let mut plain = config_ejob(TriggerStrategy::Done, None);
        plain.metadata.name = Some("other".into());
        plain.spec.update_on_config_change = false;

        let event = ChangeEvent {
            kind: ConfigKind::Secret,
            name: "smoke-config".into(),
            namespace: "default".into(),
            resource_version: Some("7".into()),
            deployment: None,
            secret_kind: None,
        };
        let affected = affected_extended_jobs(&event, &[opted_in, Arc::new(plain)]);
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].name, "smoke-tests");

        let elsewhere = ChangeEvent {
            namespace: "other".into(),
            ..event
        };
        let ejobs = [Arc::new(config_ejob(TriggerStrategy::Done, None))];
        assert!(affected_extended_jobs(&elsewhere, &ejobs).is_empty());
    }
}
