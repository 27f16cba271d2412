//! BOSH manifest handling for kubebosh
//!
//! Turns a `BoshDeployment` into Kubernetes resources in pure steps:
//! - `resolver`: fetch manifest and ops files, apply ops via `patch`
//! - `variables`: generate password, RSA, SSH and certificate secrets
//! - `interpolate`: substitute `((variable))` placeholders
//! - `converter`: instance groups to StatefulSets, ExtendedJobs and Services
//! - `render`: job template rendering inside the renderer init container

pub mod bpm;
pub mod converter;
pub mod error;
pub mod interpolate;
pub mod model;
pub mod patch;
pub mod release_image;
pub mod render;
pub mod resolver;
pub mod variables;

pub use error::ManifestError;
pub use model::Manifest;

/// Result type for manifest operations
pub type Result<T, E = ManifestError> = std::result::Result<T, E>;

/// Data key holding the manifest in its ConfigMap or Secret
pub const MANIFEST_KEY: &str = "manifest";

/// Data key holding an ops file in its ConfigMap or Secret
pub const OPS_KEY: &str = "ops";

/// Data key of stage artifacts holding a whole manifest
pub const MANIFEST_ARTIFACT_KEY: &str = "manifest.yaml";

/// Data key of the per-instance-group resolved properties artifact
pub const PROPERTIES_ARTIFACT_KEY: &str = "properties.yaml";

/// Data key of the per-instance-group BPM artifact
pub const BPM_ARTIFACT_KEY: &str = "bpm.yaml";
