use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use kubebosh_common::config_source::ConfigSource;

/// BoshDeployment validation
pub mod deployment;

pub use deployment::{validate_deployment, WebhookError};

/// Path the ValidatingWebhookConfiguration points at
pub const VALIDATE_DEPLOYMENTS_PATH: &str = "/validate/boshdeployments";

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Reads the manifests referenced by a deployment
    pub configs: Arc<dyn ConfigSource>,
}

/// Routes of the webhook server
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_DEPLOYMENTS_PATH, post(deployment::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhook over TLS until the process exits
pub async fn serve(
    addr: SocketAddr,
    cert: &Path,
    key: &Path,
    state: Arc<WebhookState>,
) -> Result<(), WebhookError> {
    let tls_config = RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| WebhookError::Server(format!("TLS config error: {e}")))?;

    info!(%addr, "starting admission webhook");
    axum_server::bind_rustls(addr, tls_config)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))
}
