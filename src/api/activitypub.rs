//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Followers collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::error::{AppError, FederationError};
use crate::federation::{ActivityEnvelope, FollowOutcome, key_id_matches_actor};
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - GET /users/:username/followers - Followers collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/users/:username/followers", get(followers))
}

fn activity_json(value: serde_json::Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(value)).into_response()
}

fn ensure_local_actor(state: &AppState, username: &str) -> Result<(), AppError> {
    if username == state.actor.username {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

/// GET /users/:username
///
/// Returns the ActivityPub Actor document of the service actor.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    ensure_local_actor(&state, &username)?;
    let actor = &state.actor;
    let public_key_pem = state.signer.public_key_pem()?;

    Ok(activity_json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": actor.id,
        "type": "Service",
        "preferredUsername": actor.username,
        "inbox": actor.inbox(),
        "followers": actor.followers(),
        "manuallyApprovesFollowers": true,
        "discoverable": false,
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.id,
            "publicKeyPem": public_key_pem
        }
    })))
}

/// GET /users/:username/followers
///
/// Only the count is published.
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    ensure_local_actor(&state, &username)?;
    let total = state.store.list().await?.len();

    Ok(activity_json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": state.actor.followers(),
        "type": "OrderedCollection",
        "totalItems": total
    })))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Verify HTTP Signature
/// 2. Check the activity's actor against the signer
/// 3. Process Follow / Undo
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    ensure_local_actor(&state, &username)?;

    // 1. Verify signature before looking at the body
    let request_target = uri
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path());
    let sender = state
        .authenticator
        .verify(&headers, request_target, "POST", &body)
        .await
        .inspect_err(|e| tracing::info!(error = %e, "Rejected inbox request"))?;

    // 2. Parse and match actor
    let activity: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
    let envelope = ActivityEnvelope::from_value(&activity);
    let actor_id = envelope
        .actor
        .as_deref()
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    if !key_id_matches_actor(sender.id(), actor_id) {
        tracing::warn!(
            key_owner = %sender.id(),
            actor = %actor_id,
            "Signature keyId actor mismatch"
        );
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    // 3. Process
    match state.processor.process(&activity, &sender).await {
        Ok(outcome) => {
            if let FollowOutcome::Accepted(record) = &outcome {
                tracing::info!(follower = %record.actor_id, "New follower");
            }
            Ok(StatusCode::ACCEPTED)
        }
        Err(AppError::Federation(FederationError::DeliveryFailure { status, body })) => {
            // State is already committed; the reply is the remote side's problem.
            tracing::warn!(?status, body = %body, "Reply delivery failed");
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => Err(e),
    }
}
