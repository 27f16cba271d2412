//! Common types for kubebosh: CRDs, errors, stores, and utilities

#![cfg_attr(not(test), deny(missing_docs))]

pub mod config;
pub mod config_source;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod meta;
pub mod names;
pub mod references;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod versioned_secret;
pub mod yaml;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label naming the deployment a generated object belongs to
pub const LABEL_DEPLOYMENT_NAME: &str = versioned_secret::LABEL_DEPLOYMENT_NAME;

/// Label naming the instance group a generated object belongs to
pub const LABEL_INSTANCE_GROUP_NAME: &str = "kubebosh.dev/instance-group-name";

/// Label carrying the availability-zone index of a generated object
pub const LABEL_AZ_INDEX: &str = "kubebosh.dev/az-index";

/// Pod label set by the StatefulSet controller to the pod ordinal
pub const LABEL_POD_ORDINAL: &str = "apps.kubernetes.io/pod-index";
