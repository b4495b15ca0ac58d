//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Upper bound for every federation time window, in seconds (one day)
pub const MAX_WINDOW_SECONDS: i64 = 24 * 60 * 60;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub actor: ActorConfig,
    pub federation: FederationConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "alerts.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://alerts.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// The single service actor
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Local username (default: "sns")
    pub username: String,
    /// Path to the PKCS#8 PEM private key. Generated on first start if missing.
    pub private_key_path: PathBuf,
}

/// Federation policy and tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Remote identities (`user@domain`) allowed to follow the actor
    #[serde(default)]
    pub follower_allow_list: Vec<String>,
    /// Actor key cache TTL in seconds (default: 60)
    pub key_cache_ttl_seconds: u64,
    /// Maximum age of a signed Date header in seconds (default: 900)
    pub max_signature_age_seconds: i64,
    /// Tolerated clock skew for Date headers from the future (default: 5)
    pub max_clock_skew_seconds: i64,
    /// Concurrent deliveries during a broadcast (default: 10)
    pub delivery_concurrency: usize,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

/// Identity of the service actor derived from configuration.
///
/// Passed by value into the federation components so none of them read the
/// environment directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceActor {
    pub username: String,
    pub domain: String,
    /// Actor document URL, e.g. `https://alerts.example.com/users/sns`
    pub id: String,
}

impl ServiceActor {
    pub fn new(base_url: &str, domain: &str, username: &str) -> Self {
        Self {
            username: username.to_string(),
            domain: domain.to_string(),
            id: format!("{}/users/{}", base_url.trim_end_matches('/'), username),
        }
    }

    /// `user@domain`
    pub fn account(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    pub fn inbox(&self) -> String {
        format!("{}/inbox", self.id)
    }

    pub fn followers(&self) -> String {
        format!("{}/followers", self.id)
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SNSPUB__*)
    ///
    /// List values in the environment are comma separated, e.g.
    /// `SNSPUB__FEDERATION__FOLLOWER_ALLOW_LIST=alice@example.com,bob@example.org`.
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("actor.username", "sns")?
            .set_default("actor.private_key_path", "data/actor_key.pem")?
            .set_default("federation.key_cache_ttl_seconds", 60)?
            .set_default("federation.max_signature_age_seconds", 900)?
            .set_default("federation.max_clock_skew_seconds", 5)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("database.path", "data/snspub.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SNSPUB")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.follower_allow_list")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn service_actor(&self) -> ServiceActor {
        ServiceActor::new(
            &self.server.base_url(),
            &self.server.domain,
            &self.actor.username,
        )
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must be set".to_string(),
            ));
        }

        if self.actor.username.is_empty()
            || !self
                .actor
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(crate::error::AppError::Config(
                "actor.username must be non-empty and contain only [A-Za-z0-9_]".to_string(),
            ));
        }

        if !(1..=MAX_WINDOW_SECONDS as u64).contains(&self.federation.key_cache_ttl_seconds) {
            return Err(crate::error::AppError::Config(format!(
                "federation.key_cache_ttl_seconds must be between 1 and {}",
                MAX_WINDOW_SECONDS
            )));
        }

        if !(1..=MAX_WINDOW_SECONDS).contains(&self.federation.max_signature_age_seconds) {
            return Err(crate::error::AppError::Config(format!(
                "federation.max_signature_age_seconds must be between 1 and {}",
                MAX_WINDOW_SECONDS
            )));
        }

        if !(0..=MAX_WINDOW_SECONDS).contains(&self.federation.max_clock_skew_seconds) {
            return Err(crate::error::AppError::Config(format!(
                "federation.max_clock_skew_seconds must be between 0 and {}",
                MAX_WINDOW_SECONDS
            )));
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.follower_allow_list.is_empty() {
            tracing::warn!("federation.follower_allow_list is empty; every Follow will be rejected");
        }

        Ok(())
    }
}
