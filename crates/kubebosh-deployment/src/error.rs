//! BoshDeployment error types

use std::time::Duration;

use kubebosh_common::crd::DeploymentPhase;
use kubebosh_manifest::ManifestError;

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    /// A pipeline stage failed; `stage` is the phase it was moving to
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: DeploymentPhase,
        #[source]
        source: ManifestError,
    },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] kubebosh_common::Error),

    #[error("missing namespace on BoshDeployment '{name}'")]
    MissingNamespace { name: String },

    #[error("reconcile of '{deployment}' exceeded its deadline of {}s", .timeout.as_secs())]
    DeadlineExceeded {
        deployment: String,
        timeout: Duration,
    },
}

impl DeploymentError {
    pub(crate) fn stage(stage: DeploymentPhase, source: impl Into<ManifestError>) -> Self {
        Self::Stage {
            stage,
            source: source.into(),
        }
    }

    /// The stage a failure is attributed to, if any
    pub fn failed_stage(&self) -> Option<DeploymentPhase> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether retrying with backoff can succeed without a user change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage { source, .. } => source.is_retryable(),
            Self::Kube(_) | Self::DeadlineExceeded { .. } => true,
            Self::Common(e) => e.is_retryable(),
            Self::Serialization(_) | Self::MissingNamespace { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubebosh_common::crd::ConfigKind;

    #[test]
    fn stage_error_names_the_stage_and_keeps_retryability() {
        let err = DeploymentError::stage(
            DeploymentPhase::OpsApplied,
            ManifestError::NotFound {
                kind: ConfigKind::ConfigMap,
                namespace: "default".into(),
                name: "nats-manifest".into(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("OpsApplied"), "{msg}");
        assert!(msg.contains("default/nats-manifest"), "{msg}");
        assert_eq!(err.failed_stage(), Some(DeploymentPhase::OpsApplied));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_key_waits_for_user() {
        let err = DeploymentError::stage(
            DeploymentPhase::OpsApplied,
            ManifestError::MissingKey {
                kind: ConfigKind::Secret,
                namespace: "default".into(),
                name: "nats-manifest".into(),
                key: "manifest".into(),
            },
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn deadline_is_retried() {
        let err = DeploymentError::DeadlineExceeded {
            deployment: "nats".into(),
            timeout: Duration::from_secs(300),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("300s"));
        assert_eq!(err.failed_stage(), None);
    }
}
