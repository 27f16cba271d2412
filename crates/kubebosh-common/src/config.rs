//! Operator configuration
//!
//! Parsed once from command-line flags (with environment fallbacks) and
//! passed by `Arc` into every controller context.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Default per-reconcile deadline in seconds
pub const DEFAULT_CTX_TIMEOUT_SECS: u64 = 300;

/// Default image for the spec-copier/renderer init steps
pub const DEFAULT_OPERATOR_IMAGE: &str = "ghcr.io/kubebosh/kubebosh-operator:latest";

/// Settings shared by all controllers
#[derive(Args, Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "KUBEBOSH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Deadline of a single reconcile run, in seconds
    #[arg(
        long = "ctx-timeout-secs",
        env = "KUBEBOSH_CTX_TIMEOUT",
        default_value_t = DEFAULT_CTX_TIMEOUT_SECS
    )]
    pub ctx_timeout_secs: u64,

    /// Image that carries the template renderer
    #[arg(long, env = "KUBEBOSH_OPERATOR_IMAGE", default_value = DEFAULT_OPERATOR_IMAGE)]
    pub operator_image: String,

    /// Listen address of the admission webhook
    #[arg(long, env = "KUBEBOSH_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub webhook_addr: SocketAddr,

    /// PEM certificate of the admission webhook; webhook disabled when unset
    #[arg(long, env = "KUBEBOSH_WEBHOOK_CERT")]
    pub webhook_cert: Option<PathBuf>,

    /// PEM private key of the admission webhook
    #[arg(long, env = "KUBEBOSH_WEBHOOK_KEY")]
    pub webhook_key: Option<PathBuf>,
}

impl OperatorConfig {
    /// Per-reconcile deadline
    pub fn ctx_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx_timeout_secs)
    }

    /// Watched namespace, `None` for cluster-wide
    pub fn watch_namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }

    /// Config with defaults, for tests
    pub fn for_testing() -> Self {
        Self {
            namespace: String::new(),
            ctx_timeout_secs: DEFAULT_CTX_TIMEOUT_SECS,
            operator_image: DEFAULT_OPERATOR_IMAGE.to_string(),
            webhook_addr: SocketAddr::from(([127, 0, 0, 1], 9443)),
            webhook_cert: None,
            webhook_key: None,
        }
    }
}
