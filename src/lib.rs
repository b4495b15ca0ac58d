//! snspub - a single-actor ActivityPub notification service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - WebFinger, actor document, inbox                         │
//! │  - Health and Prometheus metrics                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - HTTP Signatures (verify inbound, sign outbound)          │
//! │  - Actor key cache                                          │
//! │  - Follow / Undo processing, Accept / Reject replies        │
//! │  - Note broadcasts to followers                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Followers in SQLite (sqlx)                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `federation`: signatures, key cache, delivery, follow processing
//! - `data`: follower persistence
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    ActivityDelivery, ActorKeyCache, Audience, Clock, DeliveryResult, FollowProcessor,
    HttpClient, InboundAuthenticator, ReqwestHttpClient, RsaKeySigner, SigningOracle,
    SystemClock,
};

/// Application state shared across all handlers
///
/// Holds the fully wired handler set. Nothing here reads the environment;
/// every collaborator is passed in by `new` or `from_parts`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// The service actor's identity
    pub actor: config::ServiceActor,

    /// Inbound signature verification
    pub authenticator: Arc<InboundAuthenticator>,

    /// Follow / unfollow state machine
    pub processor: Arc<FollowProcessor>,

    /// Outbound signed delivery
    pub delivery: Arc<ActivityDelivery>,

    /// Actor signing key
    pub signer: Arc<dyn SigningOracle>,

    /// Accepted followers
    pub store: Arc<dyn data::FollowerStore>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the actor key
    /// 3. Build the HTTP client
    /// 4. Wire the federation components
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect(&config.database.path).await?;
        metrics::FOLLOWERS_TOTAL.set(db.count_followers().await?);
        tracing::info!("Database connected");

        // 2. Load signing key
        let signer = RsaKeySigner::load_or_generate(&config.actor.private_key_path)?;

        // 3. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("snspub/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let http = ReqwestHttpClient::new(Arc::new(http_client));

        let state = Self::from_parts(
            config,
            Arc::new(db),
            Arc::new(signer),
            Arc::new(http),
            Arc::new(SystemClock),
        );

        tracing::info!(actor = %state.actor.id, "Application state initialized successfully");
        Ok(state)
    }

    /// Wire the handler set from explicit collaborators
    pub fn from_parts(
        config: config::AppConfig,
        store: Arc<dyn data::FollowerStore>,
        signer: Arc<dyn SigningOracle>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let actor = config.service_actor();
        let federation_config = &config.federation;

        let keys = Arc::new(ActorKeyCache::new(
            http.clone(),
            clock.clone(),
            i64::try_from(federation_config.key_cache_ttl_seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds),
        ));
        let authenticator = InboundAuthenticator::new(keys.clone(), clock.clone())
            .with_replay_window(
                federation_config.max_signature_age_seconds,
                federation_config.max_clock_skew_seconds,
            );
        let delivery = Arc::new(
            ActivityDelivery::new(http, signer.clone(), clock, actor.clone())
                .with_concurrency(federation_config.delivery_concurrency),
        );
        let processor = FollowProcessor::new(
            actor.clone(),
            &federation_config.follower_allow_list,
            keys,
            store.clone(),
            delivery.clone(),
        );

        Self {
            config: Arc::new(config),
            actor,
            authenticator: Arc::new(authenticator),
            processor: Arc::new(processor),
            delivery,
            signer,
            store,
        }
    }

    /// Broadcast a notification to every current follower
    pub async fn notify(
        &self,
        message: &str,
        audience: Audience,
    ) -> Result<Vec<DeliveryResult>, error::AppError> {
        let followers = self.store.list().await?;
        Ok(self.delivery.broadcast(message, audience, followers).await)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(api::MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
