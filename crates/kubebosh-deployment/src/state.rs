//! Choosing where a run re-enters the pipeline

use std::collections::BTreeMap;

use kubebosh_common::crd::{BoshDeployment, DeploymentPhase};

/// Phase a run starts after
///
/// - no status, a new generation, or changed manifest/ops objects:
///   start over at `SpecObserved`
/// - a run that stopped part way resumes after its last completed phase
/// - a fully applied deployment re-enters at `OpsApplied`, which picks up
///   changed variable secrets while reusing the stored with-ops manifest
pub fn entry_phase(
    deployment: &BoshDeployment,
    current_inputs: Option<&BTreeMap<String, String>>,
) -> DeploymentPhase {
    let Some(status) = deployment.status.as_ref() else {
        return DeploymentPhase::SpecObserved;
    };
    if status.observed_generation != deployment.metadata.generation {
        return DeploymentPhase::SpecObserved;
    }
    if current_inputs != Some(&status.inputs) {
        return DeploymentPhase::SpecObserved;
    }
    if status.with_ops_version.is_none() {
        return DeploymentPhase::SpecObserved;
    }
    match status.phase {
        DeploymentPhase::Applied => DeploymentPhase::OpsApplied,
        phase => phase,
    }
}
