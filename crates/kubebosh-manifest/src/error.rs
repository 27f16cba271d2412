//! Manifest error types
//!
//! Each variant carries the store, namespace and reference it failed on so
//! the message recorded on a deployment's status stands on its own.

use kubebosh_common::crd::ConfigKind;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to retrieve {kind} '{namespace}/{name}': not found")]
    NotFound {
        kind: ConfigKind,
        namespace: String,
        name: String,
    },

    #[error("{kind} '{namespace}/{name}' is missing {key} key")]
    MissingKey {
        kind: ConfigKind,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("invalid manifest: {message}")]
    Schema { message: String },

    #[error("ops[{index}] at '{path}': {message}")]
    Patch {
        index: usize,
        path: String,
        message: String,
    },

    #[error("failed to interpolate: variable '{variable}' not found")]
    Interpolation { variable: String },

    #[error("failed to generate variable '{variable}': {message}")]
    Generation { variable: String, message: String },

    #[error("conversion failed: {message}")]
    Conversion { message: String },

    #[error("template rendering failed for '{template}': {message}")]
    Render { template: String, message: String },

    #[error("{0}")]
    Common(#[from] kubebosh_common::Error),
}

impl ManifestError {
    pub(crate) fn parse(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn schema(message: impl ToString) -> Self {
        Self::Schema {
            message: message.to_string(),
        }
    }

    pub(crate) fn patch(index: usize, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Patch {
            index,
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn generation(variable: impl Into<String>, message: impl ToString) -> Self {
        Self::Generation {
            variable: variable.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub(crate) fn render(template: impl Into<String>, message: impl ToString) -> Self {
        Self::Render {
            template: template.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying without a user change can succeed
    ///
    /// A missing object may appear later; a missing key, bad syntax or a
    /// failing patch needs someone to edit the inputs first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Common(e) => e.is_retryable(),
            // The CA variable may be generated by a concurrent run
            Self::Generation { .. } => true,
            Self::MissingKey { .. }
            | Self::Parse { .. }
            | Self::Schema { .. }
            | Self::Patch { .. }
            | Self::Interpolation { .. }
            | Self::Conversion { .. }
            | Self::Render { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_namespace_and_reference() {
        let err = ManifestError::NotFound {
            kind: ConfigKind::ConfigMap,
            namespace: "default".to_string(),
            name: "bar".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("configmap 'default/bar'"), "{msg}");
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_key_is_not_retryable() {
        let err = ManifestError::MissingKey {
            kind: ConfigKind::Secret,
            namespace: "default".to_string(),
            name: "base".to_string(),
            key: "manifest".to_string(),
        };
        assert!(err.to_string().contains("missing manifest key"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn patch_error_carries_index_and_path() {
        let err = ManifestError::patch(2, "/instance_groups/name=nats", "not found");
        assert_eq!(
            err.to_string(),
            "ops[2] at '/instance_groups/name=nats': not found"
        );
    }
}
