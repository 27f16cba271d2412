//! Persisting the JSON output of finished Job containers as Secrets

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use kubebosh_common::crd::{Output, LABEL_EJOB_NAME, LABEL_JOB_NAME};
use kubebosh_common::versioned_secret::{SecretContent, SecretScope, VersionedSecretStore};

use crate::JobError;

/// Parse a container log into secret data
///
/// The log must hold one flat JSON object. String values are stored as-is,
/// any other value is stored as its JSON encoding. An empty log yields no
/// data.
pub fn parse_output(container: &str, logs: &str) -> Result<BTreeMap<String, String>, JobError> {
    let trimmed = logs.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let parse_error = |message: String| JobError::OutputParse {
        container: container.to_string(),
        message,
    };
    let value: Value = serde_json::from_str(trimmed).map_err(|e| parse_error(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(parse_error("expected a JSON object".to_string()));
    };

    Ok(map
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

/// Write the output of one container of a Job run, returning the secret name
///
/// In versioned mode each run gets one version: a retry for a run whose
/// version already exists writes nothing.
pub async fn persist_output(
    store: &VersionedSecretStore,
    scope: &SecretScope,
    output: &Output,
    ejob: &str,
    job: &str,
    container: &str,
    data: BTreeMap<String, String>,
) -> Result<String, JobError> {
    let name = output.secret_name(container);
    let mut content = SecretContent::from_data(data)
        .described(format!("output of container {container} of extendedjob {ejob}"))
        .with_label(LABEL_EJOB_NAME, ejob)
        .with_label(LABEL_JOB_NAME, job);
    for (k, v) in &output.secret_labels {
        content = content.with_label(k, v);
    }

    let written = if output.versioned {
        let latest = store.latest(scope, &name).await?;
        let produced_by = |job_label: Option<&String>| job_label.is_some_and(|j| j == job);
        match latest {
            Some(latest) if produced_by(latest.labels.get(LABEL_JOB_NAME)) => {
                debug!(secret = %latest.name, %container, %job, "output of run already stored");
                return Ok(latest.name);
            }
            _ => store.create(scope, &name, &content).await?.name,
        }
    } else {
        store.put(scope, &name, &content).await?.name
    };
    info!(secret = %written, %container, %ejob, "persisted job output");
    Ok(written)
}
