use std::collections::BTreeMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::site::{SiteId, SitePolicy};

/// Current persisted layout version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The whole durable site collection, keyed by site id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub version: u32,
    /// Next enforcement rule id to hand out; never reused
    pub next_rule_id: u32,
    /// Bumped on every successful write
    pub revision: u64,
    pub sites: BTreeMap<SiteId, SitePolicy>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            next_rule_id: 1,
            revision: 0,
            sites: BTreeMap::new(),
        }
    }
}

/// Durable storage seam for the site registry.
///
/// Writes are optimistic: a snapshot is only stored when the persisted
/// revision still equals the one it was read at.
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Read the current snapshot. A missing store reads as empty.
    async fn load(&self) -> StoreResult<RegistrySnapshot>;

    /// Store `snapshot` iff the persisted revision equals `expected_revision`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(&self, expected_revision: u64, snapshot: &RegistrySnapshot) -> StoreResult<bool>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Process-local store, used for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    snapshot: RwLock<RegistrySnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn load(&self) -> StoreResult<RegistrySnapshot> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn compare_and_swap(&self, expected_revision: u64, snapshot: &RegistrySnapshot) -> StoreResult<bool> {
        let mut current = self.snapshot.write().await;
        if current.revision != expected_revision {
            return Ok(false);
        }
        *current = snapshot.clone();
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
