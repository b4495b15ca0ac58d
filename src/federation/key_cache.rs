//! Public Key Caching
//!
//! Caches remote actor public keys for a short TTL so a burst of activities
//! from one actor costs a single profile fetch. Entries expire lazily: they
//! are checked on lookup and never swept in the background.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};

use super::activity::ActorProfile;
use super::client::{HttpClient, HttpError};
use super::clock::Clock;
use super::signature::strip_fragment;
use crate::error::FederationError;
use crate::metrics::KEY_CACHE_LOOKUPS_TOTAL;

/// Default TTL for cached keys
pub const DEFAULT_KEY_TTL_SECONDS: i64 = 60;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedActorKey {
    /// PEM-encoded public key
    public_key_pem: String,
    /// When the profile was fetched
    fetched_at: DateTime<Utc>,
    ttl: chrono::Duration,
}

impl CachedActorKey {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.fetched_at + self.ttl
    }
}

/// Result of a key lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorKey {
    pub public_key_pem: String,
    /// Served from a previous fetch rather than fetched for this lookup
    pub from_cache: bool,
}

type Flights = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Removes the in-flight entry for a URL when the lookup ends, including
/// when the lookup future is dropped mid-fetch.
struct FlightGuard<'a> {
    flights: &'a Flights,
    url: String,
    flight: Arc<Mutex<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if flights
            .get(&self.url)
            .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
        {
            flights.remove(&self.url);
        }
    }
}

/// Actor public key cache
///
/// Keyed by actor profile URL (fragment stripped). Concurrent misses for the
/// same URL are collapsed into one fetch.
pub struct ActorKeyCache {
    cache: RwLock<HashMap<String, CachedActorKey>>,
    inflight: Flights,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl ActorKeyCache {
    /// Create new key cache
    ///
    /// # Arguments
    /// * `http` - Fetch collaborator
    /// * `clock` - Time source for expiry
    /// * `ttl` - Entry lifetime (default: 60 seconds)
    pub fn new(
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
            http,
            clock,
            ttl: ttl.unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_KEY_TTL_SECONDS)),
        }
    }

    /// Fetch an actor profile without touching the cache
    ///
    /// A 410 response surfaces as `ActorGone`; every other failure as
    /// `KeyFetchFailure`.
    pub async fn fetch_profile(&self, actor_url: &str) -> Result<ActorProfile, FederationError> {
        let actor_url = strip_fragment(actor_url);
        let document = self.http.get_json(actor_url).await.map_err(|e| match e {
            HttpError::Gone => FederationError::ActorGone(actor_url.to_string()),
            other => FederationError::KeyFetchFailure(format!(
                "failed to fetch {}: {}",
                actor_url, other
            )),
        })?;

        serde_json::from_value::<ActorProfile>(document).map_err(|e| {
            FederationError::KeyFetchFailure(format!("invalid actor document {}: {}", actor_url, e))
        })
    }

    fn lookup(&self, cache: &HashMap<String, CachedActorKey>, actor_url: &str) -> Option<ActorKey> {
        let now = self.clock.now();
        cache
            .get(actor_url)
            .filter(|cached| cached.is_valid(now))
            .map(|cached| ActorKey {
                public_key_pem: cached.public_key_pem.clone(),
                from_cache: true,
            })
    }

    /// Get the public key PEM for an actor
    ///
    /// Returns the cached key while it is fresh, otherwise fetches the
    /// profile and stores its `publicKey.publicKeyPem`.
    pub async fn get(&self, actor_url: &str) -> Result<ActorKey, FederationError> {
        let actor_url = strip_fragment(actor_url);

        let cached = self.lookup(&*self.cache.read().await, actor_url);
        if let Some(key) = cached {
            tracing::debug!(actor = %actor_url, "Public key cache hit");
            KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
            return Ok(key);
        }

        let guard = {
            let mut flights = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            let flight = flights
                .entry(actor_url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            FlightGuard {
                flights: &self.inflight,
                url: actor_url.to_string(),
                flight,
            }
        };
        let _turn = guard.flight.lock().await;

        // Another task may have filled the entry while we waited.
        let cached = self.lookup(&*self.cache.read().await, actor_url);
        if let Some(key) = cached {
            KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
            return Ok(key);
        }

        tracing::debug!(actor = %actor_url, "Public key cache miss, fetching...");
        KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
        let public_key_pem = self.refresh(actor_url).await?;
        Ok(ActorKey {
            public_key_pem,
            from_cache: false,
        })
    }

    async fn refresh(&self, actor_url: &str) -> Result<String, FederationError> {
        let profile = self.fetch_profile(actor_url).await?;
        let public_key_pem = profile
            .public_key
            .map(|key| key.public_key_pem)
            .ok_or_else(|| {
                FederationError::KeyFetchFailure(format!("{} has no publicKey", actor_url))
            })?;

        self.cache.write().await.insert(
            actor_url.to_string(),
            CachedActorKey {
                public_key_pem: public_key_pem.clone(),
                fetched_at: self.clock.now(),
                ttl: self.ttl,
            },
        );

        Ok(public_key_pem)
    }

    /// Drop a cached key, e.g. after it failed to verify a signature
    pub async fn invalidate(&self, actor_url: &str) {
        self.cache.write().await.remove(strip_fragment(actor_url));
        tracing::debug!(actor = %actor_url, "Invalidated public key cache entry");
    }
}
