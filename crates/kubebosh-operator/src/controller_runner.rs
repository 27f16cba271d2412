//! Controller runner - builds controller futures for each resource kind
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! runs concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use kubebosh_common::config::OperatorConfig;
use kubebosh_common::crd::{BoshDeployment, ExtendedJob, LABEL_EXTENDED_JOB};
use kubebosh_common::references::ChangeEvent;
use kubebosh_common::registry::ResourceRegistry;
use kubebosh_deployment::controller::{self as deployment_ctrl, affected_deployments};
use kubebosh_deployment::DeploymentContext;
use kubebosh_job::controller as job_ctrl;
use kubebosh_job::trigger::{self as trigger_ctrl, affected_extended_jobs};
use kubebosh_job::JobContext;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api over the watched namespace, or all namespaces when none is configured
fn scoped_api<K>(client: &Client, config: &OperatorConfig) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match config.watch_namespace() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Build the BoshDeployment controller
///
/// Besides its own resources it watches ConfigMaps and Secrets: a change to
/// a referenced manifest or ops object, or to one of a deployment's variable
/// secrets, reconciles that deployment.
pub fn build_deployment_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
    registry: Arc<ResourceRegistry>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(DeploymentContext::new(client.clone(), config.clone(), registry));
    let deployments: Api<BoshDeployment> = scoped_api(&client, &config);
    let config_maps: Api<ConfigMap> = scoped_api(&client, &config);
    let secrets: Api<Secret> = scoped_api(&client, &config);

    let controller = Controller::new(deployments, watcher_config());
    let store_for_config_maps = controller.store();
    let store_for_secrets = controller.store();

    let deployment_controller = controller
        .watches(config_maps, watcher_config(), move |cm| {
            ChangeEvent::from_config_map(&cm)
                .map(|event| affected_deployments(&event, &store_for_config_maps.state()))
                .unwrap_or_default()
        })
        .watches(secrets, watcher_config(), move |secret| {
            ChangeEvent::from_secret(&secret)
                .map(|event| affected_deployments(&event, &store_for_secrets.state()))
                .unwrap_or_default()
        })
        .shutdown_on_signal()
        .run(deployment_ctrl::reconcile, deployment_ctrl::error_policy, ctx)
        .for_each(log_reconcile_result("BoshDeployment"));

    tracing::info!("- BoshDeployment controller");

    vec![Box::pin(deployment_controller)]
}

/// Build the ExtendedJob controllers: the errand trigger and the Job
/// controller persisting output and cleaning up finished Jobs
pub fn build_extended_job_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(JobContext::new(client.clone(), config.clone()));
    let extended_jobs: Api<ExtendedJob> = scoped_api(&client, &config);
    let config_maps: Api<ConfigMap> = scoped_api(&client, &config);
    let secrets: Api<Secret> = scoped_api(&client, &config);

    let controller = Controller::new(extended_jobs, watcher_config());
    let store_for_config_maps = controller.store();
    let store_for_secrets = controller.store();

    let trigger_controller = controller
        .watches(config_maps, watcher_config(), move |cm| {
            ChangeEvent::from_config_map(&cm)
                .map(|event| affected_extended_jobs(&event, &store_for_config_maps.state()))
                .unwrap_or_default()
        })
        .watches(secrets, watcher_config(), move |secret| {
            ChangeEvent::from_secret(&secret)
                .map(|event| affected_extended_jobs(&event, &store_for_secrets.state()))
                .unwrap_or_default()
        })
        .shutdown_on_signal()
        .run(trigger_ctrl::reconcile, trigger_ctrl::error_policy, ctx.clone())
        .for_each(log_reconcile_result("ExtendedJob"));

    let jobs: Api<Job> = scoped_api(&client, &config);
    let job_controller = Controller::new(
        jobs,
        watcher_config().labels(&format!("{LABEL_EXTENDED_JOB}=true")),
    )
    .shutdown_on_signal()
    .run(job_ctrl::reconcile, job_ctrl::error_policy, ctx)
    .for_each(log_reconcile_result("Job"));

    tracing::info!("- ExtendedJob trigger controller");
    tracing::info!("- ExtendedJob output controller");

    vec![Box::pin(trigger_controller), Box::pin(job_controller)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
