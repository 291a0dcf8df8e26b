//! Periodic seeding of cluster-wide defaults
//!
//! Two background tasks make sure the singleton CertificateAuthority and the
//! built-in translator catalog exist. Both list, then create what is missing.
//! Two operator replicas may race on create; the loser sees a conflict, which
//! is treated as success.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info};

use wirepact_common::crd::{
    builtin_catalog, CertificateAuthority, CertificateAuthoritySpec, TranslatorDefinition,
};
use wirepact_common::{kube_utils, Error};

/// How often the CertificateAuthority check runs
pub const CA_SEED_INTERVAL: Duration = Duration::from_secs(300);

/// How often the translator catalog check runs
pub const CATALOG_SEED_INTERVAL: Duration = Duration::from_secs(60);

/// Trait abstracting the API calls of the seeding tasks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SeedClient: Send + Sync {
    /// Names of all CertificateAuthorities
    async fn list_cas(&self) -> Result<Vec<String>, Error>;

    /// Create a CertificateAuthority
    async fn create_ca(&self, ca: &CertificateAuthority) -> Result<(), Error>;

    /// Names of all TranslatorDefinitions
    async fn list_translators(&self) -> Result<Vec<String>, Error>;

    /// Create a TranslatorDefinition
    async fn create_translator(&self, translator: &TranslatorDefinition) -> Result<(), Error>;
}

/// Production [`SeedClient`]
pub struct SeedClientImpl {
    client: Client,
}

impl SeedClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SeedClient for SeedClientImpl {
    async fn list_cas(&self) -> Result<Vec<String>, Error> {
        let api: Api<CertificateAuthority> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|ca| ca.name_any()).collect())
    }

    async fn create_ca(&self, ca: &CertificateAuthority) -> Result<(), Error> {
        let api: Api<CertificateAuthority> = Api::all(self.client.clone());
        kube_utils::create(&api, ca).await?;
        Ok(())
    }

    async fn list_translators(&self) -> Result<Vec<String>, Error> {
        let api: Api<TranslatorDefinition> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|t| t.name_any()).collect())
    }

    async fn create_translator(&self, translator: &TranslatorDefinition) -> Result<(), Error> {
        let api: Api<TranslatorDefinition> = Api::all(self.client.clone());
        kube_utils::create(&api, translator).await?;
        Ok(())
    }
}

fn tolerate_conflict(result: Result<(), Error>) -> Result<bool, Error> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create the CertificateAuthority `name` with default spec if it is missing.
///
/// Returns true if it was created.
pub async fn ensure_certificate_authority(
    client: &dyn SeedClient,
    name: &str,
) -> Result<bool, Error> {
    if client.list_cas().await?.iter().any(|n| n == name) {
        return Ok(false);
    }
    info!(ca = %name, "creating certificate authority");
    let ca = CertificateAuthority::new(name, CertificateAuthoritySpec::default());
    tolerate_conflict(client.create_ca(&ca).await)
}

/// Create every built-in translator that is missing.
///
/// Returns the number of translators created.
pub async fn ensure_translator_catalog(client: &dyn SeedClient) -> Result<usize, Error> {
    let existing: BTreeSet<String> = client.list_translators().await?.into_iter().collect();
    let mut created = 0;
    for (name, image) in builtin_catalog() {
        if existing.contains(name) {
            continue;
        }
        info!(translator = %name, %image, "creating translator definition");
        if tolerate_conflict(
            client
                .create_translator(&TranslatorDefinition::entry(name, image))
                .await,
        )? {
            created += 1;
        }
    }
    Ok(created)
}

/// Start the background task that keeps the CertificateAuthority around
pub fn start_ca_seeding(client: Arc<dyn SeedClient>, name: String) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CA_SEED_INTERVAL);
        loop {
            interval.tick().await;
            match ensure_certificate_authority(client.as_ref(), &name).await {
                Ok(true) => info!(ca = %name, "certificate authority seeded"),
                Ok(false) => debug!(ca = %name, "certificate authority present"),
                Err(e) => error!(error = %e, ca = %name, "certificate authority seeding failed"),
            }
        }
    });
}

/// Start the background task that keeps the translator catalog complete
pub fn start_catalog_seeding(client: Arc<dyn SeedClient>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CATALOG_SEED_INTERVAL);
        loop {
            interval.tick().await;
            match ensure_translator_catalog(client.as_ref()).await {
                Ok(0) => debug!("translator catalog complete"),
                Ok(created) => info!(created, "translator catalog seeded"),
                Err(e) => error!(error = %e, "translator catalog seeding failed"),
            }
        }
    });
}
