//! TranslatorDefinition CRD: catalog of credential translators

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A credential translator that participants can reference by name
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "wirepact.ch",
    version = "v1alpha1",
    kind = "TranslatorDefinition",
    plural = "translatordefinitions",
    shortname = "translator",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorDefinitionSpec {
    /// Container image of the translator sidecar
    pub image: String,
}

/// Translators seeded into every cluster, as `(name, image)`
pub fn builtin_catalog() -> [(&'static str, &'static str); 2] {
    [
        (
            "basic-auth",
            "ghcr.io/wirepact/k8s-basic-auth-translator:latest",
        ),
        (
            "token-exchange",
            "ghcr.io/wirepact/k8s-token-exchange-translator:latest",
        ),
    ]
}

impl TranslatorDefinition {
    /// Build a catalog entry
    pub fn entry(name: &str, image: &str) -> Self {
        Self::new(
            name,
            TranslatorDefinitionSpec {
                image: image.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn catalog_names_are_unique() {
        let catalog = builtin_catalog();
        assert_ne!(catalog[0].0, catalog[1].0);
        assert!(catalog.iter().all(|(_, image)| image.starts_with("ghcr.io/wirepact/")));
    }

    #[test]
    fn entry_carries_name_and_image() {
        let t = TranslatorDefinition::entry("basic-auth", "img:1");
        assert_eq!(t.name_any(), "basic-auth");
        assert_eq!(t.spec.image, "img:1");
    }
}
