//! Durable hostname -> policy registry.
//!
//! The registry is the single source of truth for every site policy and its
//! budget. Each mutation is a read-compare-write against the backing store:
//! the whole collection is read, the change is applied to a copy, and the
//! copy is stored only if nobody else wrote in between. Inside one process
//! writers are additionally queued behind a mutex so they never race each
//! other into a retry.
pub mod file_store;
pub mod redis_store;
pub mod store;

use std::sync::Arc;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget;
use crate::filter::host_matches;
use crate::models::site::{BlockMode, NewSite, RemovedRecord, RuleId, SiteId, SitePolicy, DEFAULT_COLOR};
use crate::time::DayKey;
use store::{RegistrySnapshot, SiteStore, StoreError};

pub use file_store::JsonFileStore;
pub use redis_store::RedisStore;
pub use store::MemoryStore;

const MAX_WRITE_ATTEMPTS: usize = 5;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("A policy for {0} already exists")]
    DuplicateHostname(String),

    #[error("Site not found: {0}")]
    NotFound(SiteId),

    #[error("Daily budget must be at least one second")]
    InvalidBudget,

    #[error("Gave up after {0} conflicting writes")]
    Conflict(usize),

    #[error("Rule id space exhausted")]
    RuleIdsExhausted,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Site policy registry over a [`SiteStore`]
pub struct SiteRegistry {
    store: Arc<dyn SiteStore>,
    write_lock: Mutex<()>,
}

impl SiteRegistry {
    pub fn new(store: Arc<dyn SiteStore>) -> Self {
        info!("Site registry using {} store", store.name());
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Registry over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Run `mutate` against the latest snapshot and persist the result.
    ///
    /// `mutate` may run more than once when a concurrent writer wins the
    /// compare-and-swap, so it must derive everything from the snapshot it is
    /// handed. Nothing is written when it fails or leaves the snapshot as is.
    async fn transact<T, F>(&self, mut mutate: F) -> RegistryResult<T>
    where
        F: FnMut(&mut RegistrySnapshot) -> RegistryResult<T>,
    {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let base = self.store.load().await?;
            let mut working = base.clone();
            let value = mutate(&mut working)?;

            if working.sites == base.sites && working.next_rule_id == base.next_rule_id {
                return Ok(value);
            }

            working.revision = base.revision + 1;
            if self.store.compare_and_swap(base.revision, &working).await? {
                debug!("Registry committed revision {}", working.revision);
                return Ok(value);
            }

            warn!(
                "Registry write conflict at revision {} (attempt {}/{})",
                base.revision, attempt, MAX_WRITE_ATTEMPTS
            );
        }

        Err(RegistryError::Conflict(MAX_WRITE_ATTEMPTS))
    }

    /// Create a policy. Fails without touching the registry when the
    /// hostname is already registered or the budget is zero.
    pub async fn add(&self, new_site: NewSite, today: &DayKey) -> RegistryResult<SitePolicy> {
        if let BlockMode::Timed { daily_budget_seconds } = new_site.mode {
            if daily_budget_seconds == 0 {
                return Err(RegistryError::InvalidBudget);
            }
        }

        if self.find(&new_site.hostname).await?.is_some() {
            return Err(RegistryError::DuplicateHostname(new_site.hostname));
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let site = self
            .transact(|snapshot| {
                if snapshot.sites.values().any(|s| s.hostname == new_site.hostname) {
                    return Err(RegistryError::DuplicateHostname(new_site.hostname.clone()));
                }

                let rule_id = RuleId(snapshot.next_rule_id);
                snapshot.next_rule_id = snapshot
                    .next_rule_id
                    .checked_add(1)
                    .filter(|next| *next <= i32::MAX as u32)
                    .ok_or(RegistryError::RuleIdsExhausted)?;

                let site = SitePolicy {
                    id,
                    rule_id,
                    hostname: new_site.hostname.clone(),
                    origin: new_site.origin.clone(),
                    mode: new_site.mode,
                    budget: budget::initial_state(&new_site.mode, today),
                    color: new_site.color.clone().unwrap_or_else(|| DEFAULT_COLOR.to_string()),
                    created_at,
                };
                snapshot.sites.insert(id, site.clone());
                Ok(site)
            })
            .await?;

        info!("Added {} ({}) as site {} with rule {}", site.hostname, site.mode, site.id, site.rule_id);
        Ok(site)
    }

    /// Delete a policy by id
    pub async fn remove(&self, id: SiteId) -> RegistryResult<RemovedRecord> {
        let site = self
            .transact(|snapshot| snapshot.sites.remove(&id).ok_or(RegistryError::NotFound(id)))
            .await?;

        info!("Removed site {} ({})", site.id, site.hostname);
        Ok(RemovedRecord { site, removed_count: 1 })
    }

    /// Policy registered for exactly `hostname`
    pub async fn find(&self, hostname: &str) -> RegistryResult<Option<SitePolicy>> {
        let hostname = hostname.to_lowercase();
        let snapshot = self.store.load().await?;
        Ok(snapshot.sites.into_values().find(|s| s.hostname == hostname))
    }

    /// Most specific policy covering `hostname` (itself or a parent domain)
    pub async fn find_matching(&self, hostname: &str) -> RegistryResult<Option<SitePolicy>> {
        let snapshot = self.store.load().await?;
        Ok(snapshot
            .sites
            .into_values()
            .filter(|s| host_matches(&s.hostname, hostname))
            .max_by_key(|s| s.hostname.len()))
    }

    pub async fn get(&self, id: SiteId) -> RegistryResult<Option<SitePolicy>> {
        let snapshot = self.store.load().await?;
        Ok(snapshot.sites.get(&id).cloned())
    }

    /// All policies, oldest first
    pub async fn list(&self) -> RegistryResult<Vec<SitePolicy>> {
        let snapshot = self.store.load().await?;
        let mut sites: Vec<SitePolicy> = snapshot.sites.into_values().collect();
        sites.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.rule_id.cmp(&b.rule_id)));
        Ok(sites)
    }

    /// Atomic read-modify-write of one policy.
    ///
    /// Returns `NotFound` (and writes nothing) when the policy is gone, so a
    /// late write for a deleted site never resurrects it.
    pub async fn update<T, F>(&self, id: SiteId, mut mutator: F) -> RegistryResult<(SitePolicy, T)>
    where
        F: FnMut(&mut SitePolicy) -> T,
    {
        self.transact(|snapshot| {
            let site = snapshot.sites.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            let value = mutator(site);
            Ok((site.clone(), value))
        })
        .await
    }

    /// Apply `mutator` to every policy in one write. Returns the updated
    /// policies paired with the mutator's result for each.
    pub async fn update_all<T, F>(&self, mut mutator: F) -> RegistryResult<Vec<(SitePolicy, T)>>
    where
        F: FnMut(&mut SitePolicy) -> T,
    {
        self.transact(|snapshot| {
            Ok(snapshot
                .sites
                .values_mut()
                .map(|site| {
                    let value = mutator(site);
                    (site.clone(), value)
                })
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> DayKey {
        DayKey::from(chrono::NaiveDate::from_ymd_opt(2025, 4, 14).unwrap())
    }

    fn new_site(host: &str, mode: BlockMode) -> NewSite {
        NewSite {
            hostname: host.to_string(),
            origin: format!("https://{}", host),
            mode,
            color: None,
        }
    }

    #[tokio::test]
    async fn duplicate_hostname_is_rejected_and_registry_unchanged() {
        let registry = SiteRegistry::in_memory();
        registry.add(new_site("example.com", BlockMode::Always), &today()).await.unwrap();

        let before = registry.list().await.unwrap();
        let err = registry
            .add(new_site("example.com", BlockMode::Timed { daily_budget_seconds: 60 }), &today())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateHostname(h) if h == "example.com"));
        assert_eq!(registry.list().await.unwrap(), before);
    }

    #[tokio::test]
    async fn find_is_exact_and_case_insensitive() {
        let registry = SiteRegistry::in_memory();
        let site = registry.add(new_site("example.com", BlockMode::Always), &today()).await.unwrap();

        assert_eq!(registry.find("example.com").await.unwrap(), Some(site.clone()));
        assert_eq!(registry.find("Example.COM").await.unwrap(), Some(site));
        assert!(registry.find("www.example.com").await.unwrap().is_none());
        assert!(registry.find_matching("www.example.com").await.unwrap().is_some());

        // a subdomain is its own hostname and may be registered
        let sub = registry
            .add(new_site("www.example.com", BlockMode::Timed { daily_budget_seconds: 60 }), &today())
            .await
            .unwrap();
        assert_eq!(registry.find("www.example.com").await.unwrap(), Some(sub));
    }

    #[tokio::test]
    async fn zero_budget_is_rejected() {
        let registry = SiteRegistry::in_memory();
        let err = registry
            .add(new_site("example.com", BlockMode::Timed { daily_budget_seconds: 0 }), &today())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidBudget));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_ids_are_never_reused() {
        let registry = SiteRegistry::in_memory();
        let a = registry.add(new_site("a.example", BlockMode::Always), &today()).await.unwrap();
        registry.remove(a.id).await.unwrap();
        let b = registry.add(new_site("a.example", BlockMode::Always), &today()).await.unwrap();

        assert_eq!(a.rule_id, RuleId(1));
        assert_eq!(b.rule_id, RuleId(2));
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn update_after_remove_is_not_found() {
        let registry = SiteRegistry::in_memory();
        let site = registry
            .add(new_site("example.com", BlockMode::Timed { daily_budget_seconds: 60 }), &today())
            .await
            .unwrap();
        registry.remove(site.id).await.unwrap();

        let err = registry.update(site.id, |s| budget::checkpoint(s, 10)).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(id) if id == site.id));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_matching_prefers_most_specific_host() {
        let registry = SiteRegistry::in_memory();
        registry.add(new_site("example.com", BlockMode::Always), &today()).await.unwrap();
        registry
            .add(new_site("news.example.com", BlockMode::Timed { daily_budget_seconds: 60 }), &today())
            .await
            .unwrap();

        let hit = registry.find_matching("a.news.example.com").await.unwrap().unwrap();
        assert_eq!(hit.hostname, "news.example.com");
        let hit = registry.find_matching("www.example.com").await.unwrap().unwrap();
        assert_eq!(hit.hostname, "example.com");
        assert!(registry.find_matching("example.org").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let registry = Arc::new(SiteRegistry::in_memory());
        let site = registry
            .add(new_site("example.com", BlockMode::Timed { daily_budget_seconds: 100 }), &today())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.update(site.id, |s| budget::consume(s, 3)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = registry.get(site.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_seconds(), Some(70));
    }
}
