//! Error types for snspub
//!
//! Federation failures are typed by `FederationError` so callers can branch
//! on the exact authentication or delivery outcome. Everything surfaced to
//! HTTP handlers is converted to `AppError`, which implements `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Authentication, key resolution and delivery failures
#[derive(Debug, Error)]
pub enum FederationError {
    /// Request carried no `Signature` header
    #[error("Missing Signature header")]
    MissingSignature,

    /// Signature header or a signed value could not be parsed
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// A header named in the signature is absent from the request
    #[error("Missing signed header: {0}")]
    MissingSignedHeader(String),

    /// Date header is older than the replay window
    #[error("Signature timestamp expired")]
    ExpiredTimestamp,

    /// Date header is ahead of the local clock beyond tolerance
    #[error("Signature timestamp is in the future")]
    FutureTimestamp,

    /// Remote key material could not be retrieved or decoded
    #[error("Failed to fetch remote key: {0}")]
    KeyFetchFailure(String),

    /// Remote actor answered 410 Gone
    #[error("Remote actor is gone: {0}")]
    ActorGone(String),

    /// Cryptographic verification failed
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Remote inbox refused the delivery or could not be reached
    #[error("Delivery failed (status {status:?}): {body}")]
    DeliveryFailure { status: Option<u16>, body: String },

    /// Activity is well-signed but not acceptable for this actor
    #[error("Invalid activity: {0}")]
    InvalidActivity(String),

    /// Tentative identity used for an activity that needs a verified author
    #[error("Actor identity is not verified")]
    UnverifiedActor,

    /// Local signing key could not produce a signature
    #[error("Signing failed: {0}")]
    Signing(String),
}

impl FederationError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::MalformedSignature(_) => "malformed_signature",
            Self::MissingSignedHeader(_) => "missing_signed_header",
            Self::ExpiredTimestamp => "expired_timestamp",
            Self::FutureTimestamp => "future_timestamp",
            Self::KeyFetchFailure(_) => "key_fetch_failure",
            Self::ActorGone(_) => "actor_gone",
            Self::SignatureMismatch => "signature_mismatch",
            Self::DeliveryFailure { .. } => "delivery_failure",
            Self::InvalidActivity(_) => "invalid_activity",
            Self::UnverifiedActor => "unverified_actor",
            Self::Signing(_) => "signing",
        }
    }
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Federation error (401 / 400 / 502 depending on kind)
    #[error(transparent)]
    Federation(#[from] FederationError),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Federation(err) => {
                let status = match err {
                    FederationError::InvalidActivity(_) => StatusCode::BAD_REQUEST,
                    FederationError::DeliveryFailure { .. } | FederationError::ActorGone(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    FederationError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::UNAUTHORIZED,
                };
                (status, err.to_string(), err.kind())
            }
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
