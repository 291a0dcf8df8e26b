//! CRD installation utilities
//!
//! Installs the WirePact CRDs on startup using server-side apply, and renders
//! them as YAML for `--crd`.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use wirepact_common::crd::{CertificateAuthority, MeshParticipant, TranslatorDefinition};
use wirepact_common::OPERATOR_NAME;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "certificateauthorities.wirepact.ch",
            crd: CertificateAuthority::crd(),
        },
        CrdDef {
            name: "translatordefinitions.wirepact.ch",
            crd: TranslatorDefinition::crd(),
        },
        CrdDef {
            name: "meshparticipants.wirepact.ch",
            crd: MeshParticipant::crd(),
        },
    ]
}

/// Ensure all WirePact CRDs are installed and current
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    for def in crds() {
        tracing::info!("Installing {} CRD...", def.name);
        api.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

/// All CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = crds()
        .iter()
        .map(|def| serde_yaml::to_string(&def.crd))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}
