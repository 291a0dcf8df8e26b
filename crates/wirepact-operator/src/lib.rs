//! WirePact Kubernetes operator: enrolls workloads in the authentication mesh

#![deny(missing_docs)]

/// Command line and runtime configuration
pub mod config;
/// Reconcilers for CertificateAuthority and MeshParticipant
pub mod controller;
/// Controller construction for the binary
pub mod controller_runner;
/// Create-if-missing primitive for the CA's child objects
pub mod convergence;
/// Proxy bootstrap configuration rendering
pub mod envoy;
/// Sidecar injection into foreign Deployments and Services
pub mod inject;
/// Sidecar port allocation
pub mod ports;
/// Startup utilities (CRD install, seeding tasks)
pub mod startup;
/// Admission webhook
pub mod webhook;
