use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tradutor::{
    admission::{AdmissionError, ValidationError},
    job::{JobId, TranslationRequest},
    queue::Broker,
    status::StatusError,
    store::JobStore,
};

use crate::state::AppState;

const MISSING_FIELDS: &str = "Fields text, sourceLanguage and targetLanguage are required";

/// Body of `POST /translations`.
///
/// Every field is optional here so that a missing one is reported as a validation error rather
/// than a deserialization failure.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTranslation {
    pub text: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

impl From<SubmitTranslation> for TranslationRequest {
    fn from(value: SubmitTranslation) -> Self {
        Self {
            text: value.text.unwrap_or_default(),
            source_language: value.source_language.unwrap_or_default(),
            target_language: value.target_language.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub message: String,
    pub request_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue: bool,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

#[tracing::instrument(skip_all)]
pub async fn submit_translation_handler<S, B>(
    State(state): State<AppState<S, B>>,
    payload: Result<Json<SubmitTranslation>, JsonRejection>,
) -> Response
where
    S: JobStore,
    B: Broker,
{
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected malformed translation request");
            return error_response(StatusCode::BAD_REQUEST, MISSING_FIELDS);
        }
    };

    match state.admission.submit(payload.into()).await {
        Ok(request_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                message: "Translation request received and queued for processing".to_owned(),
                request_id,
            }),
        )
            .into_response(),
        Err(AdmissionError::Validation(ValidationError::Missing(_))) => {
            error_response(StatusCode::BAD_REQUEST, MISSING_FIELDS)
        }
        Err(AdmissionError::Validation(error)) => {
            error_response(StatusCode::BAD_REQUEST, error.to_string())
        }
        Err(error) => {
            tracing::error!(?error, "Failed to admit translation request");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process the translation request",
            )
        }
    }
}

#[tracing::instrument(skip(state))]
pub async fn translation_status_handler<S, B>(
    State(state): State<AppState<S, B>>,
    Path(request_id): Path<String>,
) -> Response
where
    S: JobStore,
    B: Broker,
{
    let not_found = || error_response(StatusCode::NOT_FOUND, "Translation request not found");
    let Ok(id) = request_id.parse::<JobId>() else {
        return not_found();
    };

    match state.status.get_status(id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(StatusError::NotFound(_)) => not_found(),
        Err(StatusError::Store(error)) => {
            tracing::error!(?error, %id, "Failed to fetch translation status");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch the translation status",
            )
        }
    }
}

pub async fn health_handler<S, B>(State(state): State<AppState<S, B>>) -> Response
where
    S: JobStore,
    B: Broker,
{
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_owned(),
            queue: state.supervisor.health_check().await,
        }),
    )
        .into_response()
}
