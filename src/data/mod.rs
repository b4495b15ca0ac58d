//! Data layer module
//!
//! Handles follower persistence:
//! - SQLite database (production)
//! - In-memory store (tests)

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::{FollowerStore, MemoryFollowerStore};
