//! MeshParticipant validation webhook
//!
//! Rejects participants whose references cannot be satisfied: an unknown
//! translator or an empty deployment/service name. Everything else is admitted
//! unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kube::{
    api::{Api, DynamicObject},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    Client,
};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info};

use wirepact_common::crd::{MeshParticipant, TranslatorDefinition};
use wirepact_common::{kube_utils, Error};

use super::WebhookState;

/// Trait abstracting the TranslatorDefinition lookup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TranslatorLookup: Send + Sync {
    /// Whether a TranslatorDefinition with this name exists
    async fn translator_exists(&self, name: &str) -> Result<bool, Error>;
}

/// [`TranslatorLookup`] against the API server
pub struct KubeTranslatorLookup {
    client: Client,
}

impl KubeTranslatorLookup {
    /// Create a new lookup
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TranslatorLookup for KubeTranslatorLookup {
    async fn translator_exists(&self, name: &str) -> Result<bool, Error> {
        let api: Api<TranslatorDefinition> = Api::all(self.client.clone());
        Ok(kube_utils::exists(&api, name).await?)
    }
}

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Handle a validating admission review for MeshParticipants
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<MeshParticipant>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let request: AdmissionRequest<MeshParticipant> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Err(WebhookError::InvalidReview(e.to_string()));
        }
    };

    let response = validate_participant(state.translators.as_ref(), &request).await;
    Ok(Json(response.into_review()))
}

/// Validate one admission request
async fn validate_participant(
    translators: &dyn TranslatorLookup,
    request: &AdmissionRequest<MeshParticipant>,
) -> AdmissionResponse {
    let admitted = AdmissionResponse::from(request);

    let Some(participant) = &request.object else {
        debug!(uid = %request.uid, "no object in request, admitting");
        return admitted;
    };
    let spec = &participant.spec;

    match translators.translator_exists(&spec.translator).await {
        Ok(true) => {}
        Ok(false) => {
            let message = format!(
                "No translator definition could be found for \"{}\".",
                spec.translator
            );
            info!(uid = %request.uid, translator = %spec.translator, "rejecting participant");
            return reject(admitted, StatusCode::BAD_REQUEST, message);
        }
        Err(e) => {
            error!(uid = %request.uid, error = %e, "translator lookup failed");
            return reject(admitted, StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    if let Err(Error::Validation { message, .. }) = spec.validate() {
        info!(uid = %request.uid, %message, "rejecting participant");
        return reject(admitted, StatusCode::BAD_REQUEST, message);
    }

    admitted
}

fn reject(response: AdmissionResponse, code: StatusCode, message: String) -> AdmissionResponse {
    let mut response = response.deny(message);
    response.result.code = code.as_u16();
    response
}
