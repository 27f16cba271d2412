//! BoshDeployment Validation Webhook
//!
//! Handles AdmissionReview requests for BoshDeployments. A deployment is
//! denied when a reference is empty or of an unsupported type, or when a
//! referenced manifest or ops file exists but does not parse. References to
//! objects that do not exist yet are allowed; the controller retries them.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, info};

use kubebosh_common::config_source::ConfigSource;
use kubebosh_common::crd::{BoshDeployment, ConfigReference};
use kubebosh_manifest::resolver::parse_ops_text;
use kubebosh_manifest::{Manifest, ManifestError, MANIFEST_KEY, OPS_KEY};

use super::WebhookState;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The TLS server could not be started or failed
    #[error("webhook server error: {0}")]
    Server(String),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::Server(_) | WebhookError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Handle a validating admission review for a BoshDeployment
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<BoshDeployment>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<BoshDeployment> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = review(&state, &request).await;
    Json(response.into_review())
}

async fn review(
    state: &WebhookState,
    request: &AdmissionRequest<BoshDeployment>,
) -> AdmissionResponse {
    let Some(deployment) = &request.object else {
        debug!(uid = %request.uid, "no object in request, allowing");
        return AdmissionResponse::from(request);
    };
    let namespace = request
        .namespace
        .clone()
        .or_else(|| deployment.metadata.namespace.clone())
        .unwrap_or_default();

    match validate_deployment(state.configs.as_ref(), &namespace, deployment).await {
        Ok(()) => AdmissionResponse::from(request),
        Err(reason) => {
            info!(
                uid = %request.uid,
                deployment = ?deployment.metadata.name,
                %reason,
                "denying deployment"
            );
            AdmissionResponse::from(request).deny(reason)
        }
    }
}

/// Check a deployment and the documents it references
///
/// Returns the reason for denial.
pub async fn validate_deployment(
    configs: &dyn ConfigSource,
    namespace: &str,
    deployment: &BoshDeployment,
) -> Result<(), String> {
    deployment.spec.validate().map_err(|problems| problems.join("; "))?;

    let manifest = &deployment.spec.manifest;
    if let Some(text) = fetch_document(configs, namespace, manifest, MANIFEST_KEY).await? {
        Manifest::from_yaml(&manifest.input_key(), &text).map_err(|e| e.to_string())?;
    }
    for (i, ops) in deployment.spec.ops.iter().enumerate() {
        if let Some(text) = fetch_document(configs, namespace, ops, OPS_KEY).await? {
            parse_ops_text(&ops.input_key(), &text)
                .map_err(|e| format!("spec.ops[{i}]: {e}"))?;
        }
    }
    Ok(())
}

/// Text under `key` of the referenced object, `None` when the object does
/// not exist
async fn fetch_document(
    configs: &dyn ConfigSource,
    namespace: &str,
    reference: &ConfigReference,
    key: &str,
) -> Result<Option<String>, String> {
    let Some(kind) = reference.kind() else {
        return Ok(None);
    };
    let object = configs
        .fetch(kind, namespace, &reference.ref_)
        .await
        .map_err(|e| format!("cannot read {kind} '{namespace}/{}': {e}", reference.ref_))?;
    let Some(object) = object else {
        return Ok(None);
    };
    match object.data.get(key) {
        Some(text) => Ok(Some(text.clone())),
        None => Err(ManifestError::MissingKey {
            kind,
            namespace: namespace.to_string(),
            name: reference.ref_.clone(),
            key: key.to_string(),
        }
        .to_string()),
    }
}
