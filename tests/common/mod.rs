//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use snspub::data::{Database, FollowerStore};
use snspub::federation::{
    Clock, FixedClock, HttpClient, HttpError, HttpResponse, REQUEST_TARGET, RsaKeySigner,
    SigningOracle, build_signature_header, canonicalize, format_http_date, generate_digest,
};
use snspub::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const LOCAL_DOMAIN: &str = "alerts.example.net";
pub const SERVICE_ACTOR: &str = "https://alerts.example.net/users/sns";
pub const INBOX_PATH: &str = "/users/sns/inbox";

/// A remote actor with its own key
pub struct RemoteActor {
    pub id: String,
    pub username: String,
    pub signer: RsaKeySigner,
}

impl RemoteActor {
    pub fn new(id: &str, username: &str) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            signer: RsaKeySigner::generate(1024).unwrap(),
        }
    }

    pub fn inbox(&self) -> String {
        format!("{}/inbox", self.id)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    pub fn document(&self) -> serde_json::Value {
        serde_json::json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": self.id,
            "type": "Person",
            "preferredUsername": self.username,
            "inbox": self.inbox(),
            "publicKey": {
                "id": self.key_id(),
                "owner": self.id,
                "publicKeyPem": self.signer.public_key_pem().unwrap()
            }
        })
    }
}

/// The fediverse as seen by the server under test
#[derive(Default)]
pub struct FakeFediverse {
    documents: Mutex<HashMap<String, serde_json::Value>>,
    gone: Mutex<Vec<String>>,
    deliveries: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeFediverse {
    pub fn publish(&self, actor: &RemoteActor) {
        self.documents
            .lock()
            .unwrap()
            .insert(actor.id.clone(), actor.document());
    }

    pub fn delete(&self, actor_id: &str) {
        self.documents.lock().unwrap().remove(actor_id);
        self.gone.lock().unwrap().push(actor_id.to_string());
    }

    /// Activities POSTed by the server, with their target inbox
    pub fn deliveries(&self) -> Vec<(String, serde_json::Value)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for FakeFediverse {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, HttpError> {
        let url = url.split('#').next().unwrap_or(url);
        if self.gone.lock().unwrap().iter().any(|id| id == url) {
            return Err(HttpError::Gone);
        }
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(HttpError::Status {
                status: 404,
                body: String::new(),
            })
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        _headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        let activity = serde_json::from_slice(&body).unwrap();
        self.deliveries
            .lock()
            .unwrap()
            .push((url.to_string(), activity));
        Ok(HttpResponse {
            status: 202,
            body: String::new(),
        })
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub host: String,
    pub state: AppState,
    pub store: Arc<Database>,
    pub fediverse: Arc<FakeFediverse>,
    pub clock: Arc<FixedClock>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: LOCAL_DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        actor: config::ActorConfig {
            username: "sns".to_string(),
            private_key_path: temp_dir.path().join("actor.pem"),
        },
        federation: config::FederationConfig {
            follower_allow_list: vec!["alice@remote.example".to_string()],
            key_cache_ttl_seconds: 60,
            max_signature_age_seconds: 900,
            max_clock_skew_seconds: 5,
            delivery_concurrency: 4,
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let store = Arc::new(Database::connect(&config.database.path).await.unwrap());
        let fediverse = Arc::new(FakeFediverse::default());
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let signer = Arc::new(RsaKeySigner::generate(1024).unwrap());

        let state = AppState::from_parts(
            config,
            store.clone(),
            signer,
            fediverse.clone(),
            clock.clone(),
        );

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = snspub::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            host: addr.to_string(),
            state,
            store,
            fediverse,
            clock,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub async fn followers(&self) -> Vec<snspub::data::FollowerRecord> {
        self.store.list().await.unwrap()
    }

    /// POST `activity` to `path`, signed by `actor` at the server's current time
    pub async fn signed_post(
        &self,
        actor: &RemoteActor,
        path: &str,
        activity: &serde_json::Value,
    ) -> reqwest::Response {
        self.signed_post_at(actor, path, activity, self.clock.now())
            .await
    }

    pub async fn signed_post_at(
        &self,
        actor: &RemoteActor,
        path: &str,
        activity: &serde_json::Value,
        date: chrono::DateTime<chrono::Utc>,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let date = format_http_date(date);
        let digest = generate_digest(&body);
        let names = [REQUEST_TARGET, "host", "date", "digest"];

        let message = canonicalize(
            &names,
            |name| match name {
                "host" => Some(self.host.clone()),
                "date" => Some(date.clone()),
                "digest" => Some(digest.clone()),
                _ => None,
            },
            "POST",
            path,
        )
        .unwrap();
        let signature = actor.signer.sign(message.as_bytes()).await.unwrap();

        self.client
            .post(self.url(path))
            .header("Host", &self.host)
            .header("Date", date)
            .header("Digest", digest)
            .header(
                "Signature",
                build_signature_header(&actor.key_id(), &names, &signature),
            )
            .header("Content-Type", "application/activity+json")
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

pub fn follow(id: &str, actor: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": id,
        "type": "Follow",
        "actor": actor,
        "object": SERVICE_ACTOR
    })
}

pub fn undo_follow(follow_id: &str, actor: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{follow_id}#undo"),
        "type": "Undo",
        "actor": actor,
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": actor,
            "object": SERVICE_ACTOR
        }
    })
}
