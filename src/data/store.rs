//! Follower persistence contract
//!
//! The follow state machine only needs put / delete / list. Every call is a
//! single atomic mutation keyed by the Follow activity id. Deletes are also
//! scoped to the actor that owns the record.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::FollowerRecord;
use crate::error::AppError;

/// Key-value store of accepted followers
#[async_trait]
pub trait FollowerStore: Send + Sync {
    /// Insert or replace the record keyed by `record.id`
    async fn put(&self, record: &FollowerRecord) -> Result<(), AppError>;

    /// Remove the record keyed by `id` if it belongs to `actor_id`.
    ///
    /// Returns whether a row was removed; a missing or foreign row is not an
    /// error.
    async fn delete(&self, id: &str, actor_id: &str) -> Result<bool, AppError>;

    /// All stored followers
    async fn list(&self) -> Result<Vec<FollowerRecord>, AppError>;
}

/// Volatile store, used by tests and dry runs
#[derive(Default)]
pub struct MemoryFollowerStore {
    records: RwLock<BTreeMap<String, FollowerRecord>>,
}

impl MemoryFollowerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FollowerStore for MemoryFollowerStore {
    async fn put(&self, record: &FollowerRecord) -> Result<(), AppError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str, actor_id: &str) -> Result<bool, AppError> {
        let mut records = self.records.write().await;
        if records.get(id).is_some_and(|record| record.actor_id == actor_id) {
            records.remove(id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list(&self) -> Result<Vec<FollowerRecord>, AppError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
