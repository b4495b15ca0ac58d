//! Data models
//!
//! Rust structs representing persisted entities.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Used for locally minted activity ids.
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Followers
// =============================================================================

/// A remote actor whose Follow was accepted
///
/// Keyed by the id of the Follow activity, so an Undo referencing that id
/// removes exactly this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowerRecord {
    /// Follow activity id
    pub id: String,
    /// Remote actor id (profile URL)
    pub actor_id: String,
    /// Remote inbox for deliveries
    pub inbox: String,
    /// Remote preferred username
    pub username: String,
}
