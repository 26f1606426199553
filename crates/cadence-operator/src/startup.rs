//! CRD installation and manifest output

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

use cadence_common::crd::all_crds;
use cadence_common::FIELD_MANAGER;

/// Install or update every Cadence CRD with server-side apply
///
/// CRD versions always match the running operator.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {name} CRD: {e}"))?;
    }

    tracing::info!("All Cadence CRDs installed/updated");
    Ok(())
}

/// All CRDs as a multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in all_crds() {
        let doc = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize {} CRD: {e}", crd.name_any()))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}
