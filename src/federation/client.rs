//! Outbound HTTP for federation
//!
//! `HttpClient` is the seam the key cache and the dispatcher talk through.
//! `ReqwestHttpClient` is the production implementation; it refuses to talk
//! to loopback/private destinations unless explicitly allowed.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use super::signature::strip_fragment;

/// Transport-level failure of a federation request
#[derive(Debug, Error)]
pub enum HttpError {
    /// Remote resource answered 410 Gone
    #[error("resource gone")]
    Gone,
    /// Non-success status other than 410
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Destination host is not allowed
    #[error("destination not allowed: {0}")]
    Forbidden(String),
    /// Connection, TLS, timeout
    #[error("transport error: {0}")]
    Transport(String),
    /// Body was not the expected JSON
    #[error("decode error: {0}")]
    Decode(String),
}

/// Raw response to a POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET a JSON document (fragment stripped). 410 maps to `HttpError::Gone`.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, HttpError>;

    /// POST `body` with the given headers. Any status is returned as a response.
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError>;
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), HttpError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| HttpError::Transport(format!("failed to resolve {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(HttpError::Forbidden(host.to_string()));
        }
    }

    if !resolved_any {
        return Err(HttpError::Transport(format!("no DNS records for {}", host)));
    }

    Ok(())
}

/// reqwest-backed client
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
    allow_private_hosts: bool,
}

impl ReqwestHttpClient {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self {
            client,
            allow_private_hosts: false,
        }
    }

    /// Permit loopback/private destinations (local development and tests)
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    async fn check_destination(&self, url: &url::Url) -> Result<(), HttpError> {
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(HttpError::Forbidden(format!(
                    "unsupported scheme {}",
                    scheme
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| HttpError::Forbidden("missing host".to_string()))?;

        if self.allow_private_hosts {
            return Ok(());
        }

        if is_disallowed_host(host) {
            return Err(HttpError::Forbidden(host.to_string()));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::Forbidden("missing port".to_string()))?;
        validate_resolved_host_ips(host, port).await
    }
}

fn parse_url(raw: &str) -> Result<url::Url, HttpError> {
    url::Url::parse(raw).map_err(|e| HttpError::Forbidden(format!("invalid URL {}: {}", raw, e)))
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, HttpError> {
        let url = parse_url(strip_fragment(url))?;
        self.check_destination(&url).await?;

        let response = self
            .client
            .get(url.clone())
            .header("Accept", "application/activity+json, application/ld+json")
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::GONE {
            tracing::debug!(%url, "Remote resource is gone");
            return Err(HttpError::Gone);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))
    }

    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        let url = parse_url(url)?;
        self.check_destination(&url).await?;

        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}
