//! Admission webhook server
//!
//! Serves validating admission reviews for MeshParticipants over TLS.

pub mod participant;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tracing::info;

use crate::config::WebhookTls;
use participant::{KubeTranslatorLookup, TranslatorLookup};

/// Path of the MeshParticipant validation endpoint
pub const VALIDATE_PARTICIPANTS_PATH: &str = "/validate/meshparticipants";

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Resolves translator references
    pub translators: Arc<dyn TranslatorLookup>,
}

impl WebhookState {
    /// Create state backed by the given client
    pub fn from_client(client: Client) -> Self {
        Self {
            translators: Arc::new(KubeTranslatorLookup::new(client)),
        }
    }
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_PARTICIPANTS_PATH, post(participant::validate_handler))
        .with_state(state)
}

/// Serve the webhook over TLS until the process exits
pub async fn serve(port: u16, tls: &WebhookTls, state: Arc<WebhookState>) -> std::io::Result<()> {
    let config = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting admission webhook server");
    axum_server::bind_rustls(addr, config)
        .serve(router(state).into_make_service())
        .await
}
