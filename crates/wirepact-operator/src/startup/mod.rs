//! Startup utilities for the WirePact operator

mod crds;
mod seeding;

pub use crds::{crd_manifests, ensure_crds_installed};
pub use seeding::{
    ensure_certificate_authority, ensure_translator_catalog, start_ca_seeding,
    start_catalog_seeding, SeedClient, SeedClientImpl, CA_SEED_INTERVAL, CATALOG_SEED_INTERVAL,
};
