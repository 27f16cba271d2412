//! BoshDeployment controller
//!
//! Each reconcile picks the entry phase, runs the remaining stages under the
//! configured deadline and records the outcome on the status. Requests for
//! one deployment are serialized by the controller runtime's queue.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{error, info, warn};

use kubebosh_common::crd::{BoshDeployment, BoshDeploymentStatus, ConfigKind};
use kubebosh_common::events::{actions, reasons};
use kubebosh_common::names;
use kubebosh_common::references::{ChangeEvent, ReferencingObject};
use kubebosh_common::versioned_secret::SECRET_KIND_VARIABLE;

use crate::context::DeploymentContext;
use crate::DeploymentError;

/// Reconcile a BoshDeployment
pub async fn reconcile(
    deployment: Arc<BoshDeployment>,
    ctx: Arc<DeploymentContext>,
) -> Result<Action, DeploymentError> {
    let name = deployment.name_any();
    let namespace = deployment
        .namespace()
        .ok_or_else(|| DeploymentError::MissingNamespace { name: name.clone() })?;

    let entry = ctx.pipeline.entry_phase(&deployment, &namespace).await;
    let mut status = deployment.status.clone().unwrap_or_default();
    status.phase = entry;
    status.observed_generation = deployment.metadata.generation;
    info!(deployment = %name, stage = %entry, "reconciling deployment");

    let timeout = ctx.config.ctx_timeout();
    let result = match tokio::time::timeout(
        timeout,
        ctx.pipeline.run(&deployment, entry, &mut status),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DeploymentError::DeadlineExceeded {
            deployment: name.clone(),
            timeout,
        }),
    };

    match result {
        Ok(summary) => {
            status.last_failed_stage = None;
            status.message = Some(format!("{} objects deployed", summary.objects));
            if summary.artifacts_written > 0 || summary.applied > 0 {
                info!(
                    deployment = %name,
                    artifacts = summary.artifacts_written,
                    applied = summary.applied,
                    "deployment converged"
                );
            }
            record_status(&ctx, &deployment, &namespace, &status).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            let failed = e
                .failed_stage()
                .or_else(|| status.phase.next())
                .unwrap_or(status.phase);
            status.last_failed_stage = Some(failed);
            status.message = Some(e.to_string());
            if let Err(patch_error) = record_status(&ctx, &deployment, &namespace, &status).await {
                warn!(deployment = %name, error = %patch_error, "failed to record failed stage");
            }
            ctx.events
                .publish(
                    &deployment.object_ref(&()),
                    EventType::Warning,
                    reasons::STAGE_FAILED,
                    actions::RECONCILE,
                    Some(format!("stage {failed}: {e}")),
                )
                .await;
            Err(e)
        }
    }
}

async fn record_status(
    ctx: &DeploymentContext,
    deployment: &BoshDeployment,
    namespace: &str,
    status: &BoshDeploymentStatus,
) -> Result<(), DeploymentError> {
    if deployment.status.as_ref() == Some(status) {
        return Ok(());
    }
    ctx.kube
        .patch_status(namespace, &deployment.name_any(), status)
        .await
}

pub fn error_policy(
    deployment: Arc<BoshDeployment>,
    error: &DeploymentError,
    _ctx: Arc<DeploymentContext>,
) -> Action {
    error!(
        ?error,
        deployment = %deployment.name_any(),
        stage = ?error.failed_stage(),
        "deployment reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(15))
    } else {
        // needs a change to the spec or its inputs, which triggers a reconcile
        Action::requeue(Duration::from_secs(600))
    }
}

/// Deployments to reconcile after a ConfigMap or Secret changed
///
/// A deployment is affected when it references the object as its manifest
/// or an ops file, or when the object is one of its generated variables.
pub fn affected_deployments(
    event: &ChangeEvent,
    deployments: &[Arc<BoshDeployment>],
) -> Vec<ObjectRef<BoshDeployment>> {
    deployments
        .iter()
        .filter(|d| {
            let Some(namespace) = d.namespace() else {
                return false;
            };
            let references = ReferencingObject::Deployment(&d.spec).referenced_config_names();
            event.affects(&namespace, &references) || is_variable_of(event, &namespace, d)
        })
        .map(|d| ObjectRef::from_obj(&**d))
        .collect()
}

fn is_variable_of(event: &ChangeEvent, namespace: &str, deployment: &BoshDeployment) -> bool {
    // the deployment label holds the name cut to a label value's length
    let label = names::limit_length(&deployment.name_any(), names::MAX_NAME_LEN);
    event.kind == ConfigKind::Secret
        && event.namespace == namespace
        && event.deployment.as_deref() == Some(label.as_str())
        && event.secret_kind.as_deref() == Some(SECRET_KIND_VARIABLE)
}
