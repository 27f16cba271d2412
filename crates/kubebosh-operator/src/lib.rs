//! kubebosh operator: controller wiring, CRD installation, admission webhook
//! and the template renderer entry point

#![deny(missing_docs)]

/// Builds the controller futures of each resource kind
pub mod controller_runner;
/// CRD generation and installation
pub mod crds;
/// `util template-render`, run inside the renderer init container
pub mod template_render;
/// Validating admission webhook for BoshDeployments
pub mod webhook;
