//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes on behalf of the service
//! actor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use super::client::{HttpClient, HttpError};
use super::clock::Clock;
use super::signature::{
    REQUEST_TARGET, build_signature_header, canonicalize, format_http_date, generate_digest,
};
use super::signer::SigningOracle;
use crate::config::ServiceActor;
use crate::data::{EntityId, FollowerRecord};
use crate::error::FederationError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS};

/// Headers covered by every outbound signature, in signing order
const SIGNED_HEADERS: [&str; 4] = [REQUEST_TARGET, "host", "date", "digest"];

/// Default number of concurrent deliveries during a broadcast
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 10;

/// Successful inbox response
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResponse {
    /// Empty or non-JSON 2xx body
    Empty,
    /// Parsed JSON body
    Json(serde_json::Value),
}

/// Outcome of one delivery within a broadcast
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_uri: String,
    pub success: bool,
    pub error: Option<String>,
    pub status_code: Option<u16>,
}

/// Addressing of a broadcast note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Addressed to the followers collection
    Followers,
    /// Addressed to each follower individually, with a Mention tag
    Mention,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
fn unique_inbox_targets(followers: Vec<FollowerRecord>) -> Vec<FollowerRecord> {
    let mut seen = HashSet::new();
    followers
        .into_iter()
        .filter(|follower| seen.insert(follower.inbox.clone()))
        .collect()
}

/// `Host` header value and request target for `inbox`
fn request_parts(inbox: &str) -> Result<(String, String), FederationError> {
    let url = url::Url::parse(inbox).map_err(|e| FederationError::DeliveryFailure {
        status: None,
        body: format!("invalid inbox URL {}: {}", inbox, e),
    })?;
    let host = url.host_str().ok_or_else(|| FederationError::DeliveryFailure {
        status: None,
        body: format!("inbox URL {} has no host", inbox),
    })?;

    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    Ok((host, target))
}

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http: Arc<dyn HttpClient>,
    signer: Arc<dyn SigningOracle>,
    clock: Arc<dyn Clock>,
    actor: ServiceActor,
    concurrency: usize,
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(
        http: Arc<dyn HttpClient>,
        signer: Arc<dyn SigningOracle>,
        clock: Arc<dyn Clock>,
        actor: ServiceActor,
    ) -> Self {
        Self {
            http,
            signer,
            clock,
            actor,
            concurrency: DEFAULT_DELIVERY_CONCURRENCY,
        }
    }

    /// Maximum number of in-flight deliveries during `broadcast`
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn actor(&self) -> &ServiceActor {
        &self.actor
    }

    /// Deliver activity to a single inbox
    ///
    /// # Arguments
    /// * `inbox_uri` - Target inbox URL
    /// * `activity` - Activity JSON, serialized once and signed as sent
    ///
    /// # Errors
    /// `DeliveryFailure` with the status and body on a non-2xx answer, or
    /// without a status when the inbox could not be reached.
    pub async fn deliver(
        &self,
        inbox_uri: &str,
        activity: &serde_json::Value,
    ) -> Result<DeliveryResponse, FederationError> {
        let started = Instant::now();
        let result = self.deliver_inner(inbox_uri, activity).await;

        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());
        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[if result.is_ok() { "success" } else { "failure" }])
            .inc();

        result
    }

    async fn deliver_inner(
        &self,
        inbox_uri: &str,
        activity: &serde_json::Value,
    ) -> Result<DeliveryResponse, FederationError> {
        // 1. Serialize activity
        let body = serde_json::to_vec(activity).map_err(|e| {
            FederationError::InvalidActivity(format!("failed to serialize activity: {}", e))
        })?;

        // 2. Sign request
        let (host, target) = request_parts(inbox_uri)?;
        let date = format_http_date(self.clock.now());
        let digest = generate_digest(&body);

        let message = canonicalize(
            &SIGNED_HEADERS,
            |name| match name {
                "host" => Some(host.clone()),
                "date" => Some(date.clone()),
                "digest" => Some(digest.clone()),
                _ => None,
            },
            "POST",
            &target,
        )?;
        let signature = self.signer.sign(message.as_bytes()).await?;
        let signature_header =
            build_signature_header(&self.actor.key_id(), &SIGNED_HEADERS, &signature);

        let headers = vec![
            ("Host".to_string(), host),
            ("Date".to_string(), date),
            ("Digest".to_string(), digest),
            ("Signature".to_string(), signature_header),
            (
                "Content-Type".to_string(),
                "application/activity+json".to_string(),
            ),
        ];

        // 3. POST to inbox with signed headers
        let response = self
            .http
            .post(inbox_uri, body, &headers)
            .await
            .map_err(|e| match e {
                HttpError::Status { status, body } => FederationError::DeliveryFailure {
                    status: Some(status),
                    body,
                },
                other => FederationError::DeliveryFailure {
                    status: None,
                    body: other.to_string(),
                },
            })?;

        // 4. Handle response
        if !response.is_success() {
            tracing::warn!(
                inbox = %inbox_uri,
                status = response.status,
                "Inbox rejected activity"
            );
            return Err(FederationError::DeliveryFailure {
                status: Some(response.status),
                body: response.body,
            });
        }

        tracing::info!(inbox = %inbox_uri, status = response.status, "Delivered activity");

        if response.body.trim().is_empty() {
            return Ok(DeliveryResponse::Empty);
        }
        Ok(serde_json::from_str(&response.body)
            .map(DeliveryResponse::Json)
            .unwrap_or(DeliveryResponse::Empty))
    }

    /// Send Accept activity (for follow request)
    ///
    /// # Arguments
    /// * `follow_activity_uri` - Original Follow activity URI
    /// * `follower_inbox_uri` - Follower's inbox
    pub async fn send_accept(
        &self,
        follow_activity_uri: &str,
        follower_inbox_uri: &str,
    ) -> Result<DeliveryResponse, FederationError> {
        let accept_id = format!("{}/accept/{}", self.actor.id, EntityId::new().0);
        let activity = builder::accept(&accept_id, &self.actor.id, follow_activity_uri);

        self.deliver(follower_inbox_uri, &activity).await
    }

    /// Send Reject activity (for follow request rejection)
    pub async fn send_reject(
        &self,
        follow_activity_uri: &str,
        follower_inbox_uri: &str,
    ) -> Result<DeliveryResponse, FederationError> {
        let reject_id = format!("{}/reject/{}", self.actor.id, EntityId::new().0);
        let activity = builder::reject(&reject_id, &self.actor.id, follow_activity_uri);

        self.deliver(follower_inbox_uri, &activity).await
    }

    /// Build the `Create{Note}` for `message` as addressed to `recipient`
    ///
    /// `recipient` is `None` for followers-collection addressing.
    fn create_note(
        &self,
        create_id: &str,
        note_id: &str,
        content: &str,
        published: &str,
        recipient: Option<&FollowerRecord>,
    ) -> serde_json::Value {
        let followers = self.actor.followers();
        let (to, tag) = match recipient {
            Some(follower) => (
                follower.actor_id.as_str(),
                Some(builder::mention(&follower.username, &follower.actor_id)),
            ),
            None => (followers.as_str(), None),
        };

        let note = builder::note(note_id, &self.actor.id, content, published, vec![to], tag);
        builder::create(create_id, &self.actor.id, note, vec![to], published)
    }

    /// Broadcast a notification note to followers
    ///
    /// # Arguments
    /// * `message` - Plain text; escaped and wrapped in a paragraph
    /// * `audience` - Followers collection or one mention per follower
    /// * `followers` - Current follower records
    ///
    /// # Returns
    /// One result per delivery; failures do not stop the batch.
    pub async fn broadcast(
        &self,
        message: &str,
        audience: Audience,
        followers: Vec<FollowerRecord>,
    ) -> Vec<DeliveryResult> {
        let note_key = EntityId::new().0;
        let create_id = format!("{}/create/{}", self.actor.id, note_key);
        let note_id = format!("{}/notes/{}", self.actor.id, note_key);
        let content = format!("<p>{}</p>", html_escape::encode_text(message));
        let published = self.clock.now().to_rfc3339();

        let total = followers.len();
        let targets = match audience {
            Audience::Followers => unique_inbox_targets(followers),
            Audience::Mention => followers,
        };

        tracing::info!(
            ?audience,
            "Delivering to {} inboxes ({} followers)",
            targets.len(),
            total
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(targets.len());

        for follower in targets {
            let activity = match audience {
                Audience::Followers => {
                    self.create_note(&create_id, &note_id, &content, &published, None)
                }
                Audience::Mention => self.create_note(
                    &create_id,
                    &note_id,
                    &content,
                    &published,
                    Some(&follower),
                ),
            };
            let semaphore = semaphore.clone();
            let delivery = self.clone();

            tasks.push(tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => delivery.deliver(&follower.inbox, &activity).await,
                    Err(e) => Err(FederationError::DeliveryFailure {
                        status: None,
                        body: e.to_string(),
                    }),
                };

                let status_code = match &result {
                    Err(FederationError::DeliveryFailure { status, .. }) => *status,
                    _ => None,
                };
                DeliveryResult {
                    inbox_uri: follower.inbox,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    status_code,
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Delivery task failed"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }
}

/// ActivityPub document builders
pub mod builder {
    use serde_json::Value;

    pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Id of the Follow being accepted
    pub fn accept(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "id": id,
            "type": "Accept",
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "id": id,
            "type": "Reject",
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (creator)
    /// * `object` - Object being created (a Note)
    /// * `to` - Primary recipients
    /// * `published` - Publication timestamp (RFC3339)
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, published: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "id": id,
            "type": "Create",
            "actor": actor,
            "object": object,
            "to": to,
            "published": published
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        to: Vec<&str>,
        tag: Option<Value>,
    ) -> Value {
        let mut note = serde_json::json!({
            "id": id,
            "type": "Note",
            "published": published,
            "attributedTo": attributed_to,
            "content": content,
            "to": to
        });
        if let (Some(tag), Some(object)) = (tag, note.as_object_mut()) {
            object.insert("tag".to_string(), Value::Array(vec![tag]));
        }
        note
    }

    /// Build a Mention tag for `@username`
    pub fn mention(username: &str, href: &str) -> Value {
        serde_json::json!({
            "type": "Mention",
            "name": format!("@{}", username),
            "href": href
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::clock::FixedClock;
    use crate::federation::signature::parse_signature_header;
    use crate::federation::signer::decode_public_key_pem;
    use crate::federation::testing::{
        ALICE, ALICE_INBOX, FakeHttpClient, RecordedPost, SERVICE_ACTOR, epoch, test_signer,
    };
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use sha2::Sha256;

    fn service_actor() -> ServiceActor {
        ServiceActor::new("https://alerts.example.net", "alerts.example.net", "sns")
    }

    fn delivery(http: Arc<FakeHttpClient>) -> ActivityDelivery {
        ActivityDelivery::new(
            http,
            Arc::new(test_signer().clone()),
            Arc::new(FixedClock::new(epoch())),
            service_actor(),
        )
    }

    fn follower(name: &str, inbox: &str) -> FollowerRecord {
        FollowerRecord {
            id: format!("https://example.com/follows/{name}"),
            actor_id: format!("https://example.com/users/{name}"),
            inbox: inbox.to_string(),
            username: name.to_string(),
        }
    }

    /// Re-verify a recorded POST exactly as a remote inbox would
    fn assert_signed(post: &RecordedPost, expected_target: &str) {
        let parsed = parse_signature_header(post.header("signature").unwrap()).unwrap();
        assert_eq!(parsed.key_id, format!("{SERVICE_ACTOR}#main-key"));
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date", "digest"]);

        let message = canonicalize(
            &parsed.headers,
            |name| post.header(name).map(str::to_string),
            "POST",
            expected_target,
        )
        .unwrap();
        let key = decode_public_key_pem(&test_signer().public_key_pem().unwrap()).unwrap();
        let signature = Signature::try_from(parsed.signature.as_slice()).unwrap();
        VerifyingKey::<Sha256>::new(key)
            .verify(message.as_bytes(), &signature)
            .expect("signature verifies");
    }

    #[tokio::test]
    async fn deliver_signs_host_date_digest_and_target() {
        let http = Arc::new(FakeHttpClient::new());
        let activity = serde_json::json!({"type": "Accept", "object": "x"});

        let response = delivery(http.clone())
            .deliver("https://example.com:8443/inbox?shard=1", &activity)
            .await
            .unwrap();
        assert_eq!(response, DeliveryResponse::Empty);

        let posts = http.posts();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.header("host"), Some("example.com:8443"));
        assert_eq!(post.header("date"), Some("Fri, 01 Mar 2024 12:00:00 GMT"));
        assert_eq!(post.header("digest"), Some(generate_digest(&post.body).as_str()));
        assert_eq!(post.header("content-type"), Some("application/activity+json"));
        assert_eq!(post.json(), activity);
        assert_signed(post, "/inbox?shard=1");
    }

    #[tokio::test]
    async fn deliver_reports_rejection_with_status_and_body() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond_to_posts_with(401, "bad signature");

        match delivery(http).deliver(ALICE_INBOX, &serde_json::json!({})).await {
            Err(FederationError::DeliveryFailure { status, body }) => {
                assert_eq!(status, Some(401));
                assert_eq!(body, "bad signature");
            }
            other => panic!("expected delivery failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deliver_parses_json_success_body() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond_to_posts_with(200, r#"{"ok":true}"#);
        let response = delivery(http.clone())
            .deliver(ALICE_INBOX, &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response, DeliveryResponse::Json(serde_json::json!({"ok": true})));

        http.respond_to_posts_with(202, "accepted");
        let response = delivery(http)
            .deliver(ALICE_INBOX, &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response, DeliveryResponse::Empty);
    }

    #[tokio::test]
    async fn deliver_rejects_unparsable_inbox() {
        let http = Arc::new(FakeHttpClient::new());
        let result = delivery(http.clone())
            .deliver("not a url", &serde_json::json!({}))
            .await;
        assert!(matches!(
            result,
            Err(FederationError::DeliveryFailure { status: None, .. })
        ));
        assert!(http.posts().is_empty());
    }

    #[tokio::test]
    async fn accept_references_follow_id() {
        let http = Arc::new(FakeHttpClient::new());
        delivery(http.clone())
            .send_accept("https://example.com/follows/1", ALICE_INBOX)
            .await
            .unwrap();

        let body = http.posts()[0].json();
        assert_eq!(body["type"], "Accept");
        assert_eq!(body["actor"], SERVICE_ACTOR);
        assert_eq!(body["object"], "https://example.com/follows/1");
        assert!(
            body["id"]
                .as_str()
                .unwrap()
                .starts_with(&format!("{SERVICE_ACTOR}/accept/"))
        );
    }

    #[tokio::test]
    async fn broadcast_to_followers_collection_deduplicates_inboxes() {
        let http = Arc::new(FakeHttpClient::new());
        let followers = vec![
            follower("alice", "https://example.com/inbox"),
            follower("bob", "https://example.com/inbox"),
            follower("carol", "https://other.example/users/carol/inbox"),
        ];

        let results = delivery(http.clone())
            .broadcast("disk <full>", Audience::Followers, followers)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));

        let posts = http.posts();
        assert_eq!(posts.len(), 2);
        let body = posts[0].json();
        assert_eq!(body["type"], "Create");
        assert_eq!(body["object"]["type"], "Note");
        assert_eq!(body["object"]["content"], "<p>disk &lt;full&gt;</p>");
        assert_eq!(body["object"]["to"][0], format!("{SERVICE_ACTOR}/followers"));
        assert!(body["object"].get("tag").is_none());
    }

    #[tokio::test]
    async fn broadcast_mention_addresses_each_follower() {
        let http = Arc::new(FakeHttpClient::new());
        let followers = vec![
            follower("alice", ALICE_INBOX),
            follower("bob", "https://example.com/users/bob/inbox"),
        ];

        delivery(http.clone())
            .broadcast("paging", Audience::Mention, followers)
            .await;

        let posts = http.posts();
        assert_eq!(posts.len(), 2);
        let to_alice = posts.iter().find(|p| p.url == ALICE_INBOX).unwrap().json();
        assert_eq!(to_alice["object"]["to"][0], ALICE);
        assert_eq!(to_alice["object"]["tag"][0]["type"], "Mention");
        assert_eq!(to_alice["object"]["tag"][0]["name"], "@alice");
        assert_eq!(to_alice["object"]["tag"][0]["href"], ALICE);
    }

    #[tokio::test]
    async fn broadcast_collects_failures_without_stopping() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond_to_posts_with(500, "down");

        let results = delivery(http)
            .with_concurrency(1)
            .broadcast(
                "x",
                Audience::Mention,
                vec![follower("alice", ALICE_INBOX), follower("bob", "https://b.example/inbox")],
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success && r.status_code == Some(500)));
    }
}
