//! BoshDeployment reconciliation for kubebosh
//!
//! Drives a deployment through its stages (resolve, generate variables,
//! interpolate, convert, apply), persisting each stage's output as a
//! versioned secret so unchanged inputs converge without writes.

pub mod client;
pub mod context;
pub mod controller;
pub mod error;
pub mod pipeline;
pub mod state;

pub use context::DeploymentContext;
pub use error::DeploymentError;
pub use pipeline::{Pipeline, RunSummary};
