//! Activity processing
//!
//! Handles incoming ActivityPub activities addressed to the service actor:
//! Follow requests are checked against the allow-list, answered with Accept
//! or Reject and persisted; Undo{Follow} removes the follower again.

use std::sync::Arc;

use serde::Deserialize;

use super::authenticator::AuthenticatedActor;
use super::delivery::ActivityDelivery;
use super::delivery::builder::ACTIVITYSTREAMS_CONTEXT;
use super::key_cache::ActorKeyCache;
use super::signature::strip_fragment;
use crate::config::ServiceActor;
use crate::data::{FollowerRecord, FollowerStore};
use crate::error::{AppError, FederationError};
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FOLLOWERS_TOTAL};

/// Activity types this actor distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Create,
    Accept,
    Reject,
    Delete,
    Other(String),
}

impl ActivityType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Undo" => Self::Undo,
            "Create" => Self::Create,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Delete" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Delete => "Delete",
            Self::Other(other) => other,
        }
    }

    /// Bounded label for metrics
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Delete => "Delete",
            Self::Other(_) => "Other",
        }
    }
}

/// `publicKey` block of a remote actor document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorPublicKey {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

/// The parts of a remote actor document this service reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub id: String,
    pub inbox: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub public_key: Option<ActorPublicKey>,
}

impl ActorProfile {
    /// `preferredUsername`, falling back to the last path segment of `id`
    pub fn username(&self) -> String {
        match &self.preferred_username {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .id
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// `host[:port]` of `id`
    pub fn domain(&self) -> Option<String> {
        let url = url::Url::parse(&self.id).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// `username@domain`
    pub fn account(&self) -> Option<String> {
        self.domain()
            .map(|domain| format!("{}@{}", self.username(), domain))
    }
}

/// `object` of an activity
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    /// Bare id string
    Id(String),
    /// Embedded activity, e.g. the Follow inside an Undo
    Activity(Box<ActivityEnvelope>),
    /// Anything else (a Note, a missing object)
    Other(serde_json::Value),
}

impl ObjectRef {
    fn from_value(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(serde_json::Value::String(id)) => Self::Id(id.clone()),
            Some(value @ serde_json::Value::Object(map)) if map.contains_key("type") => {
                Self::Activity(Box::new(ActivityEnvelope::from_value(value)))
            }
            Some(other) => Self::Other(other.clone()),
            None => Self::Other(serde_json::Value::Null),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Activity(activity) => activity.id.as_deref(),
            Self::Other(value) => value.get("id").and_then(|id| id.as_str()),
        }
    }
}

/// Loosely parsed activity
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEnvelope {
    pub context: serde_json::Value,
    pub activity_type: ActivityType,
    pub actor: Option<String>,
    pub object: ObjectRef,
    pub id: Option<String>,
}

/// Read an id that may be a bare string or an object with `id`
fn id_of(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(map) => map.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

impl ActivityEnvelope {
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            context: value
                .get("@context")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            activity_type: ActivityType::from_str(
                value.get("type").and_then(|t| t.as_str()).unwrap_or_default(),
            ),
            actor: id_of(value.get("actor")),
            object: ObjectRef::from_value(value.get("object")),
            id: value.get("id").and_then(|id| id.as_str()).map(str::to_string),
        }
    }

    /// Whether `@context` is, or lists, the ActivityStreams namespace
    pub fn has_activitystreams_context(&self) -> bool {
        match &self.context {
            serde_json::Value::String(context) => context == ACTIVITYSTREAMS_CONTEXT,
            serde_json::Value::Array(contexts) => contexts
                .iter()
                .any(|context| context.as_str() == Some(ACTIVITYSTREAMS_CONTEXT)),
            _ => false,
        }
    }
}

/// What processing an activity did
#[derive(Debug, Clone, PartialEq)]
pub enum FollowOutcome {
    /// Follow accepted, record stored, Accept sent
    Accepted(FollowerRecord),
    /// Follow rejected, Reject sent
    Rejected { actor_id: String },
    /// Undo{Follow} processed; `removed` is false when nothing was stored
    Unfollowed { follow_id: String, removed: bool },
    /// Acknowledged without side effects
    Ignored,
}

/// Follow / unfollow state machine for the service actor
pub struct FollowProcessor {
    actor: ServiceActor,
    /// Lower-cased `user@domain` entries
    allow_list: Vec<String>,
    keys: Arc<ActorKeyCache>,
    store: Arc<dyn FollowerStore>,
    delivery: Arc<ActivityDelivery>,
}

impl FollowProcessor {
    pub fn new(
        actor: ServiceActor,
        allow_list: &[String],
        keys: Arc<ActorKeyCache>,
        store: Arc<dyn FollowerStore>,
        delivery: Arc<ActivityDelivery>,
    ) -> Self {
        Self {
            actor,
            allow_list: allow_list
                .iter()
                .map(|entry| entry.trim().to_ascii_lowercase())
                .collect(),
            keys,
            store,
            delivery,
        }
    }

    pub fn is_allowed(&self, account: &str) -> bool {
        let account = account.to_ascii_lowercase();
        self.allow_list.iter().any(|entry| *entry == account)
    }

    /// Process an activity from an authenticated sender
    ///
    /// # Arguments
    /// * `activity` - Parsed JSON body
    /// * `sender` - Identity established by signature verification
    pub async fn process(
        &self,
        activity: &serde_json::Value,
        sender: &AuthenticatedActor,
    ) -> Result<FollowOutcome, AppError> {
        let envelope = ActivityEnvelope::from_value(activity);

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[envelope.activity_type.metric_label()])
            .inc();

        if !envelope.has_activitystreams_context() {
            return Err(FederationError::InvalidActivity(
                "missing ActivityStreams @context".to_string(),
            )
            .into());
        }

        tracing::info!(
            activity_type = envelope.activity_type.as_str(),
            actor = %sender.id(),
            verified = sender.is_verified(),
            "Processing activity"
        );

        match (&envelope.activity_type, sender) {
            (ActivityType::Undo, sender) => self.handle_undo(&envelope, sender.id()).await,
            (_, AuthenticatedActor::Tentative(_)) => Err(FederationError::UnverifiedActor.into()),
            (ActivityType::Follow, AuthenticatedActor::Verified(actor_id)) => {
                self.handle_follow(&envelope, actor_id).await
            }
            (other, _) => {
                tracing::debug!(activity_type = other.as_str(), "Ignoring activity");
                Ok(FollowOutcome::Ignored)
            }
        }
    }

    async fn handle_follow(
        &self,
        envelope: &ActivityEnvelope,
        actor_id: &str,
    ) -> Result<FollowOutcome, AppError> {
        if envelope.object.id() != Some(self.actor.id.as_str()) {
            return Err(FederationError::InvalidActivity(format!(
                "Follow object must be {}",
                self.actor.id
            ))
            .into());
        }
        let follow_id = envelope
            .id
            .clone()
            .ok_or_else(|| FederationError::InvalidActivity("Follow without id".to_string()))?;

        let profile = self.keys.fetch_profile(actor_id).await?;
        if strip_fragment(&profile.id) != actor_id {
            tracing::warn!(
                signer = %actor_id,
                claimed = %profile.id,
                "Actor document id does not match signer"
            );
            return Err(FederationError::InvalidActivity(format!(
                "actor document at {} claims id {}",
                actor_id, profile.id
            ))
            .into());
        }
        let account = profile.account().ok_or_else(|| {
            FederationError::InvalidActivity(format!("actor id {} has no host", profile.id))
        })?;

        if !self.is_allowed(&account) {
            tracing::info!(account = %account, "Rejecting follow request");
            self.delivery
                .send_reject(&follow_id, &profile.inbox)
                .await?;
            return Ok(FollowOutcome::Rejected {
                actor_id: actor_id.to_string(),
            });
        }

        let record = FollowerRecord {
            id: follow_id,
            actor_id: actor_id.to_string(),
            inbox: profile.inbox.clone(),
            username: profile.username(),
        };
        self.store.put(&record).await?;
        self.refresh_follower_gauge().await;
        tracing::info!(account = %account, follow = %record.id, "Accepted follow request");

        self.delivery
            .send_accept(&record.id, &record.inbox)
            .await?;

        Ok(FollowOutcome::Accepted(record))
    }

    /// Only the actor that owns a Follow can undo it.
    async fn handle_undo(
        &self,
        envelope: &ActivityEnvelope,
        actor_id: &str,
    ) -> Result<FollowOutcome, AppError> {
        let ObjectRef::Activity(inner) = &envelope.object else {
            tracing::debug!("Ignoring Undo without embedded activity");
            return Ok(FollowOutcome::Ignored);
        };
        if inner.activity_type != ActivityType::Follow {
            tracing::debug!(
                activity_type = inner.activity_type.as_str(),
                "Ignoring Undo of non-Follow"
            );
            return Ok(FollowOutcome::Ignored);
        }
        if inner
            .actor
            .as_deref()
            .is_some_and(|follower| strip_fragment(follower) != actor_id)
        {
            tracing::warn!(
                sender = %actor_id,
                follower = ?inner.actor,
                "Ignoring Undo of another actor's Follow"
            );
            return Ok(FollowOutcome::Ignored);
        }
        if inner.object.id() != Some(self.actor.id.as_str()) {
            return Err(FederationError::InvalidActivity(format!(
                "Undo{{Follow}} object must be {}",
                self.actor.id
            ))
            .into());
        }
        let follow_id = inner.id.clone().ok_or_else(|| {
            FederationError::InvalidActivity("Undo{Follow} without Follow id".to_string())
        })?;

        let removed = self.store.delete(&follow_id, actor_id).await?;
        if removed {
            self.refresh_follower_gauge().await;
            tracing::info!(follow = %follow_id, "Removed follower");
        } else {
            tracing::debug!(follow = %follow_id, actor = %actor_id, "Undo matched no follow of this actor");
        }

        Ok(FollowOutcome::Unfollowed { follow_id, removed })
    }

    async fn refresh_follower_gauge(&self) {
        match self.store.list().await {
            Ok(followers) => FOLLOWERS_TOTAL.set(followers.len() as i64),
            Err(e) => tracing::warn!(error = %e, "Failed to count followers"),
        }
    }
}
