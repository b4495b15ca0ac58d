//! Inbound request authentication
//!
//! Verifies the HTTP Signature of an inbox POST and yields the identity of
//! the signing actor. Checks run in this order: header presence and syntax,
//! digest and replay window, key resolution, RSA verification. Nothing here
//! touches the follower store, so a rejected request never leaves state
//! behind.

use http::HeaderMap;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use sha2::Sha256;
use std::sync::Arc;

use super::clock::Clock;
use super::key_cache::ActorKeyCache;
use super::signature::{canonicalize, generate_digest, parse_http_date, parse_signature_header};
use super::signer::decode_public_key_pem;
use crate::error::FederationError;
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;

/// Oldest accepted Date header, in seconds
pub const DEFAULT_MAX_SIGNATURE_AGE_SECONDS: i64 = 15 * 60;
/// Tolerated skew for Date headers ahead of the local clock, in seconds
pub const DEFAULT_MAX_CLOCK_SKEW_SECONDS: i64 = 5;

/// Outcome of a successful `verify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticatedActor {
    /// Signature checked against the actor's published key
    Verified(String),
    /// The actor's profile answered 410 Gone, so no key could be checked.
    /// Only good enough for retraction activities.
    Tentative(String),
}

impl AuthenticatedActor {
    pub fn id(&self) -> &str {
        match self {
            Self::Verified(id) | Self::Tentative(id) => id,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }
}

/// Values of `name`, joined as one header line
fn header_value(headers: &HeaderMap, name: &str) -> Result<Option<String>, FederationError> {
    let mut values = Vec::new();
    for value in headers.get_all(name) {
        let value = value.to_str().map_err(|_| {
            FederationError::MalformedSignature(format!("non-ASCII value in header {}", name))
        })?;
        values.push(value.trim());
    }

    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(values.join(", ")))
    }
}

/// Whether a Digest header carries `expected` (`SHA-256=<base64>`)
fn digest_matches(presented: &str, expected: &str) -> bool {
    let Some((_, expected_value)) = expected.split_once('=') else {
        return false;
    };

    presented.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("SHA-256") && value == expected_value
            })
    })
}

fn verify_rsa(public_key_pem: &str, message: &str, signature: &[u8]) -> Result<(), FederationError> {
    let public_key = decode_public_key_pem(public_key_pem)?;
    let verifier = VerifyingKey::<Sha256>::new(public_key);
    let signature =
        Signature::try_from(signature).map_err(|_| FederationError::SignatureMismatch)?;
    verifier
        .verify(message.as_bytes(), &signature)
        .map_err(|_| FederationError::SignatureMismatch)
}

/// Verifier for inbound signed requests
pub struct InboundAuthenticator {
    keys: Arc<ActorKeyCache>,
    clock: Arc<dyn Clock>,
    max_age: chrono::Duration,
    max_skew: chrono::Duration,
}

impl InboundAuthenticator {
    pub fn new(keys: Arc<ActorKeyCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            clock,
            max_age: chrono::Duration::seconds(DEFAULT_MAX_SIGNATURE_AGE_SECONDS),
            max_skew: chrono::Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECONDS),
        }
    }

    /// Override the replay window
    pub fn with_replay_window(mut self, max_age_seconds: i64, max_skew_seconds: i64) -> Self {
        self.max_age = chrono::Duration::seconds(max_age_seconds);
        self.max_skew = chrono::Duration::seconds(max_skew_seconds);
        self
    }

    /// Verify a signed request
    ///
    /// # Arguments
    /// * `headers` - All request headers
    /// * `request_target` - Path and query as received
    /// * `method` - HTTP method
    /// * `body` - Raw request body; its digest is recomputed here
    ///
    /// # Returns
    /// The `keyId` without fragment, as `Verified`, or as `Tentative` when
    /// the actor is gone.
    pub async fn verify(
        &self,
        headers: &HeaderMap,
        request_target: &str,
        method: &str,
        body: &[u8],
    ) -> Result<AuthenticatedActor, FederationError> {
        let result = self.verify_inner(headers, request_target, method, body).await;

        let label = match &result {
            Ok(AuthenticatedActor::Verified(_)) => "verified",
            Ok(AuthenticatedActor::Tentative(_)) => "tentative",
            Err(e) => e.kind(),
        };
        SIGNATURE_VERIFICATIONS_TOTAL
            .with_label_values(&[label])
            .inc();

        result
    }

    async fn verify_inner(
        &self,
        headers: &HeaderMap,
        request_target: &str,
        method: &str,
        body: &[u8],
    ) -> Result<AuthenticatedActor, FederationError> {
        // 1. Parse Signature header
        let raw = header_value(headers, "signature")?.ok_or(FederationError::MissingSignature)?;
        let parsed = parse_signature_header(&raw)?;

        // 2. Digest and Date checks
        for name in &parsed.headers {
            match name.as_str() {
                "digest" => {
                    let presented = header_value(headers, "digest")?
                        .ok_or_else(|| FederationError::MissingSignedHeader("digest".to_string()))?;
                    if !digest_matches(&presented, &generate_digest(body)) {
                        tracing::debug!(digest = %presented, "Digest does not match body");
                        return Err(FederationError::SignatureMismatch);
                    }
                }
                "date" => {
                    let raw_date = header_value(headers, "date")?
                        .ok_or_else(|| FederationError::MissingSignedHeader("date".to_string()))?;
                    self.check_date(&raw_date)?;
                }
                _ => {}
            }
        }

        // 3. Reconstruct signing string
        let mut lookup_error = None;
        let message = canonicalize(
            &parsed.headers,
            |name| match header_value(headers, name) {
                Ok(value) => value,
                Err(e) => {
                    lookup_error.get_or_insert(e);
                    None
                }
            },
            method,
            request_target,
        );
        if let Some(e) = lookup_error {
            return Err(e);
        }
        let message = message?;

        // 4. Resolve key
        let actor_id = parsed.actor_id().to_string();
        let key = match self.keys.get(&actor_id).await {
            Ok(key) => key,
            Err(FederationError::ActorGone(_)) => {
                tracing::warn!(
                    actor = %actor_id,
                    "Actor is gone; accepting tentative identity without signature check"
                );
                return Ok(AuthenticatedActor::Tentative(actor_id));
            }
            Err(e @ FederationError::KeyFetchFailure(_)) => return Err(e),
            Err(e) => return Err(FederationError::KeyFetchFailure(e.to_string())),
        };

        // 5. Verify RSA signature, refetching once if a cached key fails
        match verify_rsa(&key.public_key_pem, &message, &parsed.signature) {
            Err(FederationError::SignatureMismatch) if key.from_cache => {
                tracing::debug!(actor = %actor_id, "Cached key rejected signature, refetching");
                self.keys.invalidate(&actor_id).await;
                let fresh = self
                    .keys
                    .get(&actor_id)
                    .await
                    .map_err(|_| FederationError::SignatureMismatch)?;
                if fresh.public_key_pem == key.public_key_pem {
                    return Err(FederationError::SignatureMismatch);
                }
                verify_rsa(&fresh.public_key_pem, &message, &parsed.signature)?;
            }
            other => other?,
        }

        tracing::debug!(actor = %actor_id, "Signature verified");
        Ok(AuthenticatedActor::Verified(actor_id))
    }

    fn check_date(&self, raw_date: &str) -> Result<(), FederationError> {
        let sent = parse_http_date(raw_date)?;
        let age = self.clock.now() - sent;

        if age > self.max_age {
            return Err(FederationError::ExpiredTimestamp);
        }
        if age < -self.max_skew {
            return Err(FederationError::FutureTimestamp);
        }
        Ok(())
    }
}
