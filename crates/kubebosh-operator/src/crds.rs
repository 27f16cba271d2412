//! The operator installs its own CRDs on startup using server-side apply, so
//! the installed schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use kubebosh_common::crd::{BoshDeployment, ExtendedJob};
use kubebosh_common::kube_utils::FIELD_MANAGER;
use kubebosh_common::yaml::to_yaml_string;

/// Every CRD the operator owns
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![BoshDeployment::crd(), ExtendedJob::crd()]
}

/// CRDs as a multi-document YAML stream; each document opens with `---`
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut stream = String::new();
    for crd in all_crds() {
        let value = serde_json::to_value(&crd)?;
        stream.push_str(&to_yaml_string(&value)?);
    }
    Ok(stream)
}

/// Install or update all CRDs
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    }
    info!("CRDs installed/updated");
    Ok(())
}
