//! Custom Resource Definitions for WirePact
//!
//! All kinds live in API group `wirepact.ch`, version `v1alpha1`.

mod certificate_authority;
mod participant;
mod translator;

pub use certificate_authority::{
    CertificateAuthority, CertificateAuthoritySpec, CertificateAuthorityStatus,
    DEFAULT_CA_IMAGE, DEFAULT_CA_PORT, DEFAULT_CA_SECRET_NAME,
};
pub use participant::{MeshParticipant, MeshParticipantSpec, MeshParticipantStatus};
pub use translator::{builtin_catalog, TranslatorDefinition, TranslatorDefinitionSpec};
