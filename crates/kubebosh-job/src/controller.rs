//! Job controller: collects output of finished ExtendedJob runs
//!
//! Watches Jobs labelled as created by an ExtendedJob. Once a Job finishes,
//! the JSON output of each container of its latest pod is written to a
//! Secret, the ExtendedJob status records the result, and a successful Job
//! is deleted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use kubebosh_common::crd::{ExtendedJob, ExtendedJobStatus, DELETE_POD, LABEL_DELETE};
use kubebosh_common::events::{actions, reasons};
use kubebosh_common::meta::controller_owner_ref;
use kubebosh_common::versioned_secret::SecretScope;
use kubebosh_common::LABEL_DEPLOYMENT_NAME;

use crate::client::{owning_extended_job, ANNOTATION_OUTPUT_PERSISTED};
use crate::context::JobContext;
use crate::output::{parse_output, persist_output};
use crate::JobError;

/// Terminal state of a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    /// Outcome of a finished Job, `None` while it still runs
    pub fn of(job: &Job) -> Option<Self> {
        let status = job.status.as_ref()?;
        let condition = |kind: &str| {
            status
                .conditions
                .as_ref()
                .is_some_and(|cs| cs.iter().any(|c| c.type_ == kind && c.status == "True"))
        };
        if condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
            Some(Self::Succeeded)
        } else if condition("Failed") {
            Some(Self::Failed)
        } else {
            None
        }
    }
}

fn output_persisted(job: &Job) -> bool {
    job.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_OUTPUT_PERSISTED))
}

fn deletes_pods(ejob: &ExtendedJob) -> bool {
    ejob.spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get(LABEL_DELETE))
        .is_some_and(|v| v == DELETE_POD)
}

/// Most recently created pod of a Job
fn latest_pod(mut pods: Vec<Pod>) -> Option<Pod> {
    pods.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    pods.pop()
}

/// Reconcile a Job created by an ExtendedJob
pub async fn reconcile(job: Arc<Job>, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let job_name = job.name_any();
    let namespace = job.namespace().ok_or_else(|| JobError::MissingNamespace {
        kind: "Job",
        name: job_name.clone(),
    })?;

    let Some(ejob_name) = owning_extended_job(&job) else {
        debug!(job = %job_name, "job not created by an extendedjob");
        return Ok(Action::await_change());
    };
    let Some(outcome) = JobOutcome::of(&job) else {
        debug!(job = %job_name, "job still running");
        return Ok(Action::await_change());
    };
    let Some(ejob) = ctx.kube.get_extended_job(&namespace, ejob_name).await? else {
        warn!(job = %job_name, ejob = %ejob_name, "owning extendedjob is gone");
        return Ok(Action::await_change());
    };

    if !output_persisted(&job) {
        if let Some(output) = &ejob.spec.output {
            if outcome == JobOutcome::Succeeded || output.write_on_failure {
                let deadline = ctx.config.ctx_timeout();
                tokio::time::timeout(deadline, write_outputs(&ctx, &namespace, &job_name, &ejob))
                    .await
                    .map_err(|_| JobError::DeadlineExceeded {
                        job: job_name.clone(),
                    })??;
            }
        }
        ctx.kube.mark_output_persisted(&namespace, &job_name).await?;
    }

    let previous = ejob.status.clone().unwrap_or_default();
    let succeeded = outcome == JobOutcome::Succeeded;
    if previous.succeeded != succeeded {
        let status = ExtendedJobStatus {
            succeeded,
            ..previous
        };
        ctx.kube
            .patch_extended_job_status(&namespace, ejob_name, &status)
            .await?;
    }

    if succeeded {
        ctx.kube
            .delete_job(&namespace, &job_name, deletes_pods(&ejob))
            .await?;
        info!(job = %job_name, ejob = %ejob_name, "job succeeded");
    } else {
        warn!(job = %job_name, ejob = %ejob_name, "job failed, keeping it for inspection");
    }

    Ok(Action::await_change())
}

async fn write_outputs(
    ctx: &JobContext,
    namespace: &str,
    job_name: &str,
    ejob: &ExtendedJob,
) -> Result<(), JobError> {
    let Some(output) = &ejob.spec.output else {
        return Ok(());
    };
    let pods = ctx.kube.list_job_pods(namespace, job_name).await?;
    let Some(pod) = latest_pod(pods) else {
        warn!(job = %job_name, "finished job has no pods, no output to persist");
        return Ok(());
    };
    let pod_name = pod.name_any();
    let ejob_name = ejob.name_any();

    let deployment = ejob
        .labels()
        .get(LABEL_DEPLOYMENT_NAME)
        .cloned()
        .unwrap_or_else(|| ejob_name.clone());
    let scope = SecretScope::new(namespace, deployment).with_owner(controller_owner_ref(ejob));

    let containers: Vec<String> = pod
        .spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    let mut outputs = Vec::with_capacity(containers.len());
    for container in containers {
        let logs = ctx
            .logs
            .container_logs(namespace, &pod_name, &container)
            .await?;
        match parse_output(&container, &logs) {
            Ok(data) if data.is_empty() => {}
            Ok(data) => outputs.push((container, data)),
            Err(e) => {
                ctx.events
                    .publish(
                        &ejob.object_ref(&()),
                        EventType::Warning,
                        reasons::OUTPUT_FAILED,
                        actions::PERSIST,
                        Some(e.to_string()),
                    )
                    .await;
                return Err(e);
            }
        }
    }

    // Every log parsed before the first write, so a bad log writes nothing
    let mut written = BTreeMap::new();
    for (container, data) in outputs {
        let name = persist_output(
            &ctx.secrets,
            &scope,
            output,
            &ejob_name,
            job_name,
            &container,
            data,
        )
        .await?;
        written.insert(container, name);
    }

    if !written.is_empty() {
        ctx.events
            .publish(
                &ejob.object_ref(&()),
                EventType::Normal,
                reasons::PERSISTING_OUTPUT,
                actions::PERSIST,
                Some(format!(
                    "persisted output of job {job_name}: {}",
                    written.values().cloned().collect::<Vec<_>>().join(", ")
                )),
            )
            .await;
    }
    Ok(())
}

pub fn error_policy(job: Arc<Job>, error: &JobError, _ctx: Arc<JobContext>) -> Action {
    error!(?error, job = %job.name_any(), "job reconciliation failed");
    if matches!(error, JobError::OutputParse { .. }) {
        // logs of a finished pod never change; the job is kept for inspection
        Action::await_change()
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(10))
    } else {
        Action::requeue(Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockJobKubeClient, MockPodLogReader};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubebosh_common::crd::{ExtendedJobSpec, Output, LABEL_EJOB_NAME};
    use kubebosh_common::testing::InMemorySecretBackend;
    use kubebosh_common::versioned_secret::VersionedSecretStore;

    fn job(condition: Option<&str>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("smoke-r1".into()),
                namespace: Some("default".into()),
                labels: Some(BTreeMap::from([(
                    LABEL_EJOB_NAME.to_string(),
                    "smoke".to_string(),
                )])),
                ..Default::default()
            },
            status: condition.map(|kind| JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: kind.into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ejob(output: Option<Output>, delete_pod: bool) -> ExtendedJob {
        let labels = delete_pod
            .then(|| BTreeMap::from([(LABEL_DELETE.to_string(), DELETE_POD.to_string())]));
        let mut ejob = ExtendedJob::new(
            "smoke",
            ExtendedJobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels,
                        ..Default::default()
                    }),
                    spec: None,
                },
                output,
                ..Default::default()
            },
        );
        ejob.metadata.namespace = Some("default".into());
        ejob
    }

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("smoke-r1-abcde".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "busybox".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn output(write_on_failure: bool) -> Output {
        Output {
            name_prefix: "out-".into(),
            output_type: "json".into(),
            write_on_failure,
            ..Default::default()
        }
    }

    fn context(
        kube: MockJobKubeClient,
        logs: MockPodLogReader,
    ) -> (Arc<JobContext>, Arc<InMemorySecretBackend>) {
        let backend = Arc::new(InMemorySecretBackend::default());
        let ctx = JobContext::for_testing(
            Arc::new(kube),
            Arc::new(logs),
            VersionedSecretStore::new(backend.clone()),
        );
        (Arc::new(ctx), backend)
    }

    #[test]
    fn outcome_from_conditions() {
        assert_eq!(JobOutcome::of(&job(None)), None);
        assert_eq!(JobOutcome::of(&job(Some("Complete"))), Some(JobOutcome::Succeeded));
        assert_eq!(JobOutcome::of(&job(Some("Failed"))), Some(JobOutcome::Failed));
    }

    #[tokio::test]
    async fn running_job_is_left_alone() {
        let (ctx, _) = context(MockJobKubeClient::new(), MockPodLogReader::new());
        reconcile(Arc::new(job(None)), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn succeeded_job_persists_output_and_is_deleted_with_pods() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job()
            .returning(|_, _| Ok(Some(ejob(Some(output(false)), true))));
        kube.expect_list_job_pods()
            .withf(|_, job| job == "smoke-r1")
            .returning(|_, _| Ok(vec![pod()]));
        kube.expect_mark_output_persisted()
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_extended_job_status()
            .times(1)
            .withf(|_, name, status| name == "smoke" && status.succeeded)
            .returning(|_, _, _| Ok(()));
        kube.expect_delete_job()
            .times(1)
            .withf(|_, name, with_pods| name == "smoke-r1" && *with_pods)
            .returning(|_, _, _| Ok(()));

        let mut logs = MockPodLogReader::new();
        logs.expect_container_logs()
            .withf(|_, pod, container| pod == "smoke-r1-abcde" && container == "busybox")
            .returning(|_, _, _| Ok(r#"{"hello":"world"}"#.to_string()));

        let (ctx, backend) = context(kube, logs);
        reconcile(Arc::new(job(Some("Complete"))), ctx.clone())
            .await
            .unwrap();

        assert_eq!(backend.names("default"), vec!["out-busybox"]);
        let stored = ctx
            .secrets
            .get_secret("default", "out-busybox")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data["hello"], "world");
    }

    #[tokio::test]
    async fn failed_job_without_write_on_failure_keeps_job_and_writes_nothing() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job()
            .returning(|_, _| Ok(Some(ejob(Some(output(false)), false))));
        kube.expect_mark_output_persisted()
            .returning(|_, _| Ok(()));
        // status already reports failure, so no patch
        kube.expect_delete_job().times(0);

        let (ctx, backend) = context(kube, MockPodLogReader::new());
        reconcile(Arc::new(job(Some("Failed"))), ctx).await.unwrap();
        assert!(backend.names("default").is_empty());
    }

    #[tokio::test]
    async fn failed_job_with_write_on_failure_persists_output() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job()
            .returning(|_, _| Ok(Some(ejob(Some(output(true)), false))));
        kube.expect_list_job_pods().returning(|_, _| Ok(vec![pod()]));
        kube.expect_mark_output_persisted()
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_delete_job().times(0);

        let mut logs = MockPodLogReader::new();
        logs.expect_container_logs()
            .returning(|_, _, _| Ok(r#"{"error":"boom"}"#.to_string()));

        let (ctx, backend) = context(kube, logs);
        reconcile(Arc::new(job(Some("Failed"))), ctx).await.unwrap();
        assert_eq!(backend.names("default"), vec!["out-busybox"]);
    }

    #[tokio::test]
    async fn persisted_output_is_not_written_twice() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job()
            .returning(|_, _| Ok(Some(ejob(Some(output(true)), false))));
        kube.expect_list_job_pods().times(0);
        kube.expect_mark_output_persisted().times(0);

        let mut failed = job(Some("Failed"));
        failed.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_OUTPUT_PERSISTED.to_string(),
            "true".to_string(),
        )]));

        let (ctx, _) = context(kube, MockPodLogReader::new());
        reconcile(Arc::new(failed), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_output_fails_the_reconcile() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job()
            .returning(|_, _| Ok(Some(ejob(Some(output(false)), false))));
        kube.expect_list_job_pods().returning(|_, _| Ok(vec![pod()]));
        kube.expect_mark_output_persisted().times(0);

        let mut logs = MockPodLogReader::new();
        logs.expect_container_logs()
            .returning(|_, _, _| Ok("plain text".to_string()));

        let (ctx, _) = context(kube, logs);
        let err = reconcile(Arc::new(job(Some("Complete"))), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::OutputParse { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn one_malformed_log_writes_no_output_on_any_attempt() {
        let mut kube = MockJobKubeClient::new();
        kube.expect_get_extended_job().returning(|_, _| {
            let mut out = output(false);
            out.versioned = true;
            Ok(Some(ejob(Some(out), false)))
        });
        kube.expect_list_job_pods().returning(|_, _| {
            let mut pod = pod();
            if let Some(spec) = pod.spec.as_mut() {
                spec.containers.push(Container {
                    name: "zbad".into(),
                    ..Default::default()
                });
            }
            Ok(vec![pod])
        });
        kube.expect_mark_output_persisted().times(0);
        kube.expect_delete_job().times(0);

        let mut logs = MockPodLogReader::new();
        logs.expect_container_logs()
            .returning(|_, _, container| match container {
                "busybox" => Ok(r#"{"a":"1"}"#.to_string()),
                _ => Ok("garbage".to_string()),
            });

        let (ctx, backend) = context(kube, logs);
        let job = Arc::new(job(Some("Complete")));
        for _ in 0..3 {
            let err = reconcile(job.clone(), ctx.clone()).await.unwrap_err();
            assert!(
                matches!(err, JobError::OutputParse { ref container, .. } if container == "zbad")
            );
            assert_eq!(
                error_policy(job.clone(), &err, ctx.clone()),
                Action::await_change()
            );
        }
        assert!(backend.names("default").is_empty());
    }

    #[test]
    fn latest_pod_wins() {
        let mut older = pod();
        older.metadata.name = Some("a".into());
        let mut newer = pod();
        newer.metadata.name = Some("b".into());
        assert_eq!(latest_pod(vec![newer, older]).unwrap().name_any(), "b");
    }
}
