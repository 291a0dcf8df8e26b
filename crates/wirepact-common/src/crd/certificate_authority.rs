//! CertificateAuthority CRD: the cluster PKI singleton
//!
//! The operator provisions the CA workload (account, role, secret, deployment,
//! service) from this object. By convention exactly one instance exists, named
//! `wirepact-pki`; the seeding task creates it if missing.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Image of the CA workload when none is given
pub const DEFAULT_CA_IMAGE: &str = "ghcr.io/wirepact/k8s-pki:latest";

/// Port the CA listens on when none is given
pub const DEFAULT_CA_PORT: u16 = 8080;

/// Secret that stores the CA key material when none is given
pub const DEFAULT_CA_SECRET_NAME: &str = "wirepact-pki-ca";

/// Spec for the cluster certificate authority
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "wirepact.ch",
    version = "v1alpha1",
    kind = "CertificateAuthority",
    plural = "certificateauthorities",
    shortname = "pki",
    status = "CertificateAuthorityStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.dnsAddress"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthoritySpec {
    /// Container image of the CA
    #[serde(default = "default_image")]
    pub image: String,

    /// Port the CA serves gRPC on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Name of the Secret the CA persists its key material in
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
}

fn default_image() -> String {
    DEFAULT_CA_IMAGE.to_string()
}

fn default_port() -> u16 {
    DEFAULT_CA_PORT
}

fn default_secret_name() -> String {
    DEFAULT_CA_SECRET_NAME.to_string()
}

impl Default for CertificateAuthoritySpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            port: default_port(),
            secret_name: default_secret_name(),
        }
    }
}

/// Observed state of the CA
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthorityStatus {
    /// Namespace the CA workload runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// In-cluster address of the CA service (`<name>.<namespace>:<port>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_address: Option<String>,
}

impl CertificateAuthorityStatus {
    /// The namespace if one has been recorded and is non-empty
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// The service address if one has been recorded and is non-empty
    pub fn dns_address(&self) -> Option<&str> {
        self.dns_address.as_deref().filter(|a| !a.is_empty())
    }
}

impl CertificateAuthority {
    /// Service address for the CA workload in the given namespace
    pub fn service_address(name: &str, namespace: &str, port: u16) -> String {
        format!("{name}.{namespace}:{port}")
    }
}
