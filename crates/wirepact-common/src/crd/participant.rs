//! MeshParticipant CRD: enrolls an existing Deployment/Service pair in the mesh
//!
//! The participant does not own its workload. The operator patches the
//! referenced Deployment and Service in place (sidecars, volume, service target
//! port) and reverses the patch when the participant is deleted.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Spec for a MeshParticipant
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "wirepact.ch",
    version = "v1alpha1",
    kind = "MeshParticipant",
    plural = "meshparticipants",
    shortname = "mp",
    namespaced,
    status = "MeshParticipantStatus",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deployment"}"#,
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.service"}"#,
    printcolumn = r#"{"name":"Translator","type":"string","jsonPath":".spec.translator"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshParticipantSpec {
    /// Name of the Deployment that runs the workload
    #[serde(default)]
    pub deployment: String,

    /// Name of the Service that exposes the workload
    #[serde(default)]
    pub service: String,

    /// The application's own port; the Service port with this number is redirected
    #[serde(default)]
    pub target_port: u16,

    /// Name of the TranslatorDefinition to run as sidecar
    #[serde(default)]
    pub translator: String,

    /// Extra environment for the translator container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Extra arguments for the translator container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl MeshParticipantSpec {
    /// Check the references a participant needs before it can be reconciled
    ///
    /// The translator reference is resolved against the catalog elsewhere;
    /// this only checks that the names are present.
    pub fn validate(&self) -> Result<(), Error> {
        if self.deployment.is_empty() {
            return Err(Error::validation(
                "There is no deployment set in the mesh participant.",
            ));
        }
        if self.service.is_empty() {
            return Err(Error::validation(
                "There is no service set in the mesh participant.",
            ));
        }
        Ok(())
    }
}

/// Ports allocated for the participant's sidecars, zero meaning unallocated
///
/// A non-zero port is never changed by the operator.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeshParticipantStatus {
    /// Port the proxy accepts inbound traffic on
    #[serde(default)]
    pub ingress_port: u16,

    /// Port the proxy accepts outbound traffic on (the workload's HTTP_PROXY)
    #[serde(default)]
    pub egress_port: u16,

    /// Port the translator serves inbound ext_authz checks on
    #[serde(default)]
    pub translator_ingress_port: u16,

    /// Port the translator serves outbound ext_authz checks on
    #[serde(default)]
    pub translator_egress_port: u16,
}

impl MeshParticipantStatus {
    /// The four ports in allocation order: ingress, egress, translator ingress, translator egress
    pub fn ports(&self) -> [u16; 4] {
        [
            self.ingress_port,
            self.egress_port,
            self.translator_ingress_port,
            self.translator_egress_port,
        ]
    }

    /// Build a status from ports in allocation order
    pub fn from_ports(ports: [u16; 4]) -> Self {
        let [ingress_port, egress_port, translator_ingress_port, translator_egress_port] = ports;
        Self {
            ingress_port,
            egress_port,
            translator_ingress_port,
            translator_egress_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> MeshParticipantSpec {
        MeshParticipantSpec {
            deployment: "web".to_string(),
            service: "web".to_string(),
            target_port: 8080,
            translator: "basic-auth".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_valid_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn validate_missing_deployment() {
        let mut spec = valid_spec();
        spec.deployment.clear();
        let err = spec.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("There is no deployment set in the mesh participant."));
    }

    #[test]
    fn validate_missing_service() {
        let mut spec = valid_spec();
        spec.service.clear();
        let err = spec.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("There is no service set in the mesh participant."));
    }

    #[test]
    fn spec_parses_wire_names() {
        let spec: MeshParticipantSpec = serde_json::from_value(serde_json::json!({
            "deployment": "web",
            "service": "web-svc",
            "targetPort": 8080,
            "translator": "basic-auth",
            "env": {"B": "2", "A": "1"},
            "args": ["--verbose"]
        }))
        .unwrap();
        assert_eq!(spec.target_port, 8080);
        assert_eq!(spec.service, "web-svc");
        assert_eq!(
            spec.env.keys().collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(spec.args, vec!["--verbose"]);
    }

    #[test]
    fn missing_status_ports_are_zero() {
        let status: MeshParticipantStatus =
            serde_json::from_value(serde_json::json!({"ingressPort": 41000})).unwrap();
        assert_eq!(status.ports(), [41000, 0, 0, 0]);
        assert_eq!(MeshParticipantStatus::from_ports([1, 2, 3, 4]).ports(), [1, 2, 3, 4]);
    }
}
