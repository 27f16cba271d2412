//! ExtendedJob controllers for kubebosh
//!
//! Two controllers cooperate on `ExtendedJob` resources:
//! - `trigger`: creates a `batch/v1` Job when the trigger strategy says so
//!   and advances the strategy (`now` to `manual`, `once` to `done`)
//! - `controller`: watches the created Jobs, persists container output as
//!   Secrets and cleans up succeeded Jobs

pub mod client;
pub mod context;
pub mod controller;
pub mod error;
pub mod output;
pub mod trigger;

pub use context::JobContext;
pub use error::JobError;
