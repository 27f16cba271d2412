//! ExtendedJob error types

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] kubebosh_common::Error),

    #[error("missing namespace on {kind} '{name}'")]
    MissingNamespace { kind: &'static str, name: String },

    #[error("output of container '{container}' is not a flat JSON object: {message}")]
    OutputParse { container: String, message: String },

    #[error("reading output of job '{job}' exceeded the deadline")]
    DeadlineExceeded { job: String },
}

impl JobError {
    /// Whether the controller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::DeadlineExceeded { .. } => true,
            Self::Common(e) => e.is_retryable(),
            Self::Serialization(_) | Self::MissingNamespace { .. } | Self::OutputParse { .. } => {
                false
            }
        }
    }
}
