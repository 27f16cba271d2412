//! Custom Resource Definitions owned by the operator

mod deployment;
mod extended_job;

pub use deployment::{
    BoshDeployment, BoshDeploymentSpec, BoshDeploymentStatus, ConfigKind, ConfigReference,
    DeploymentPhase,
};
pub use extended_job::{
    ExtendedJob, ExtendedJobSpec, ExtendedJobStatus, Output, Trigger, TriggerStrategy, DELETE_POD,
    LABEL_DELETE, LABEL_EJOB_NAME, LABEL_EXTENDED_JOB, LABEL_JOB_NAME,
};
