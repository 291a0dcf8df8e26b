//! Common types for the WirePact operator: CRDs, errors, events, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// API group of all WirePact custom resources
pub const API_GROUP: &str = "wirepact.ch";

/// Name of the operator, used as event reporter and field manager
pub const OPERATOR_NAME: &str = "wirepact-operator";

/// Name of the singleton CertificateAuthority created by the seeding task
pub const DEFAULT_CA_NAME: &str = "wirepact-pki";

/// Standard Kubernetes `app.kubernetes.io/name` label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes `app.kubernetes.io/component` label
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard Kubernetes `app.kubernetes.io/part-of` label
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Standard Kubernetes `app.kubernetes.io/managed-by` label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard Kubernetes `app.kubernetes.io/created-by` label
pub const LABEL_CREATED_BY: &str = "app.kubernetes.io/created-by";

/// Value of the `part-of` label on everything WirePact creates
pub const PART_OF_WIREPACT: &str = "wirepact";

/// Value of the `component` label for CA resources
pub const COMPONENT_PKI: &str = "pki";
