use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::store::{RegistrySnapshot, SiteStore, StoreError, StoreResult, SNAPSHOT_VERSION};
use crate::models::site::SitePolicy;

const POOL_SIZE: usize = 4;
const DEFAULT_PREFIX: &str = "sitebudget";

/// Redis backed store.
///
/// Layout: hash `<prefix>:sites` (site id -> policy JSON) plus the integer
/// keys `<prefix>:next_rule_id` and `<prefix>:revision`. Writes run in a
/// MULTI/EXEC guarded by WATCH on the revision key.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    // connections are checked out exclusively, so WATCH state never leaks between callers
    pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    prefix: String,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> StoreResult<Self> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn with_prefix(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;

        let mut connections = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            connections.push(client.get_multiplexed_async_connection().await?);
        }

        Ok(Self {
            client,
            pool: Arc::new(Mutex::new(connections)),
            prefix: prefix.to_string(),
        })
    }

    // Helper method to get a connection from the pool
    async fn get_conn(&self) -> StoreResult<MultiplexedConnection> {
        let mut pool = self.pool.lock().await;
        if let Some(conn) = pool.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn return_conn(&self, conn: MultiplexedConnection) {
        let mut pool = self.pool.lock().await;
        if pool.len() < POOL_SIZE {
            pool.push(conn);
        }
    }

    fn sites_key(&self) -> String {
        format!("{}:sites", self.prefix)
    }

    fn next_rule_key(&self) -> String {
        format!("{}:next_rule_id", self.prefix)
    }

    fn revision_key(&self) -> String {
        format!("{}:revision", self.prefix)
    }

    async fn read_with(&self, conn: &mut MultiplexedConnection) -> StoreResult<RegistrySnapshot> {
        // one MULTI/EXEC so the revision always belongs to the sites read with it
        let (raw, next_rule_id, revision): (HashMap<String, String>, Option<u32>, Option<u64>) = redis::pipe()
            .atomic()
            .hgetall(self.sites_key())
            .get(self.next_rule_key())
            .get(self.revision_key())
            .query_async(conn)
            .await?;

        let mut sites = BTreeMap::new();
        for (field, json) in raw {
            let id = Uuid::parse_str(&field)
                .map_err(|e| StoreError::Corrupt(format!("bad site key {}: {}", field, e)))?;
            let site: SitePolicy = serde_json::from_str(&json)?;
            sites.insert(id, site);
        }

        Ok(RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            next_rule_id: next_rule_id.unwrap_or(1),
            revision: revision.unwrap_or(0),
            sites,
        })
    }

    async fn swap_with(
        &self,
        conn: &mut MultiplexedConnection,
        expected_revision: u64,
        snapshot: &RegistrySnapshot,
    ) -> StoreResult<bool> {
        let revision_key = self.revision_key();
        redis::cmd("WATCH").arg(&revision_key).query_async::<()>(conn).await?;

        let current: Option<u64> = conn.get(&revision_key).await?;
        if current.unwrap_or(0) != expected_revision {
            redis::cmd("UNWATCH").query_async::<()>(conn).await?;
            return Ok(false);
        }

        let mut fields = Vec::with_capacity(snapshot.sites.len());
        for (id, site) in &snapshot.sites {
            fields.push((id.to_string(), serde_json::to_string(site)?));
        }

        let sites_key = self.sites_key();
        let mut pipe = redis::pipe();
        pipe.atomic().del(&sites_key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(&sites_key, &fields[..]).ignore();
        }
        pipe.set(self.next_rule_key(), snapshot.next_rule_id).ignore();
        pipe.set(&revision_key, snapshot.revision).ignore();

        // EXEC answers nil when the watched key changed underneath us
        let committed: Option<redis::Value> = pipe.query_async(conn).await?;
        Ok(committed.is_some())
    }
}

#[async_trait]
impl SiteStore for RedisStore {
    async fn load(&self) -> StoreResult<RegistrySnapshot> {
        let mut conn = self.get_conn().await?;
        let result = self.read_with(&mut conn).await;
        self.return_conn(conn).await;
        result
    }

    async fn compare_and_swap(&self, expected_revision: u64, snapshot: &RegistrySnapshot) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let result = self.swap_with(&mut conn, expected_revision, snapshot).await;
        if result.is_ok() {
            self.return_conn(conn).await;
        } else {
            debug!("Dropping redis connection after failed swap");
        }
        result
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
