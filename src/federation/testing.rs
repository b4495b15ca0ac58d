//! Shared fakes for federation unit tests

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use http::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use super::client::{HttpClient, HttpError, HttpResponse};
use super::signature::{
    REQUEST_TARGET, build_signature_header, canonicalize, format_http_date, generate_digest,
};
use super::signer::{RsaKeySigner, SigningOracle};

pub(crate) const SERVICE_ACTOR: &str = "https://alerts.example.net/users/sns";
pub(crate) const ALICE: &str = "https://example.com/users/alice";
pub(crate) const ALICE_INBOX: &str = "https://example.com/users/alice/inbox";

pub(crate) fn test_signer() -> &'static RsaKeySigner {
    static SIGNER: OnceLock<RsaKeySigner> = OnceLock::new();
    SIGNER.get_or_init(|| RsaKeySigner::generate(1024).expect("key generation should work"))
}

/// A second, unrelated key
pub(crate) fn other_signer() -> &'static RsaKeySigner {
    static SIGNER: OnceLock<RsaKeySigner> = OnceLock::new();
    SIGNER.get_or_init(|| RsaKeySigner::generate(1024).expect("key generation should work"))
}

pub(crate) fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn actor_document(id: &str, username: &str, public_key_pem: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{id}/inbox"),
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": public_key_pem,
        }
    })
}

#[derive(Debug, Clone)]
pub(crate) enum FakeGet {
    Json(serde_json::Value),
    Gone,
    Status(u16),
    /// Never answers
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedPost {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl RecordedPost {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("posted body is JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// In-memory `HttpClient` recording every call
pub(crate) struct FakeHttpClient {
    documents: Mutex<HashMap<String, FakeGet>>,
    post_response: Mutex<HttpResponse>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<RecordedPost>>,
}

impl FakeHttpClient {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            post_response: Mutex::new(HttpResponse {
                status: 202,
                body: String::new(),
            }),
            gets: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_actor(self, id: &str, username: &str, signer: &RsaKeySigner) -> Self {
        let pem = signer.public_key_pem().unwrap();
        self.serve(id, FakeGet::Json(actor_document(id, username, &pem)))
    }

    pub fn serve(self, url: &str, response: FakeGet) -> Self {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
        self
    }

    /// Replace what `url` answers from now on
    pub fn replace(&self, url: &str, response: FakeGet) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn respond_to_posts_with(&self, status: u16, body: &str) {
        *self.post_response.lock().unwrap() = HttpResponse {
            status,
            body: body.to_string(),
        };
    }

    pub fn get_count(&self) -> usize {
        self.gets.lock().unwrap().len()
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, HttpError> {
        let url = super::signature::strip_fragment(url).to_string();
        self.gets.lock().unwrap().push(url.clone());
        let response = self.documents.lock().unwrap().get(&url).cloned();
        // Let other tasks run, as a real network round trip would.
        tokio::task::yield_now().await;
        match response {
            Some(FakeGet::Json(value)) => Ok(value),
            Some(FakeGet::Gone) => Err(HttpError::Gone),
            Some(FakeGet::Status(status)) => Err(HttpError::Status {
                status,
                body: String::new(),
            }),
            Some(FakeGet::Hang) => std::future::pending().await,
            None => Err(HttpError::Status {
                status: 404,
                body: "not found".to_string(),
            }),
        }
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        self.posts.lock().unwrap().push(RecordedPost {
            url: url.to_string(),
            body,
            headers: headers.to_vec(),
        });
        Ok(self.post_response.lock().unwrap().clone())
    }
}

/// Headers of a request to `path` on `host`, signed by `signer` as `key_id`
pub(crate) async fn signed_headers(
    signer: &RsaKeySigner,
    key_id: &str,
    host: &str,
    path: &str,
    body: &[u8],
    date: DateTime<Utc>,
) -> HeaderMap {
    let date = format_http_date(date);
    let digest = generate_digest(body);
    let names = [REQUEST_TARGET, "host", "date", "digest"];

    let message = canonicalize(
        &names,
        |name| match name {
            "host" => Some(host.to_string()),
            "date" => Some(date.clone()),
            "digest" => Some(digest.clone()),
            _ => None,
        },
        "POST",
        path,
    )
    .unwrap();
    let signature = signer.sign(message.as_bytes()).await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_str(host).unwrap());
    headers.insert("date", HeaderValue::from_str(&date).unwrap());
    headers.insert("digest", HeaderValue::from_str(&digest).unwrap());
    headers.insert(
        "signature",
        HeaderValue::from_str(&build_signature_header(key_id, &names, &signature)).unwrap(),
    );
    headers
}
