//! Network-level redirect rules derived from the registry.
//!
//! The rule set is a cache of registry state: it holds no truth of its own and
//! `sync_all` can rebuild it from the site list at any time. Every change goes
//! through the channel's lock so a read-diff-update never interleaves with
//! another one from the same process.
pub mod file_backend;
pub mod rules;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::budget;
use crate::filter::url_filter_for;
use crate::models::site::SitePolicy;

pub use file_backend::FileRuleBackend;
pub use rules::{
    EnforcementError, EnforcementResult, EnforcementRule, MemoryRuleBackend, RedirectTarget, ResourceType,
    RuleAction, RuleBackend, RuleCondition,
};

const RULE_PRIORITY: u32 = 1;

/// Outcome of a full resync
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
}

/// Installs and removes redirect rules per blocked hostname
pub struct EnforcementChannel {
    backend: Arc<dyn RuleBackend>,
    block_page: String,
    lock: Mutex<()>,
}

impl EnforcementChannel {
    pub fn new(backend: Arc<dyn RuleBackend>, block_page: impl Into<String>) -> Self {
        Self {
            backend,
            block_page: block_page.into(),
            lock: Mutex::new(()),
        }
    }

    /// Channel over an in-memory rule set
    pub fn in_memory(block_page: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryRuleBackend::new()), block_page)
    }

    /// Block page location for a site, e.g. `/blocked.html?host=https%3A%2F%2Fexample.com`
    pub fn block_page_for(&self, site: &SitePolicy) -> String {
        let host: String = url::form_urlencoded::byte_serialize(site.origin.as_bytes()).collect();
        format!("{}?host={}", self.block_page, host)
    }

    /// The one rule a blocked site should have
    pub fn rule_for(&self, site: &SitePolicy) -> EnforcementRule {
        EnforcementRule {
            id: site.rule_id.0,
            priority: RULE_PRIORITY,
            action: RuleAction::Redirect {
                redirect: RedirectTarget {
                    extension_path: self.block_page_for(site),
                },
            },
            condition: RuleCondition {
                url_filter: url_filter_for(&site.hostname),
                resource_types: vec![ResourceType::MainFrame],
            },
        }
    }

    /// Make sure exactly one redirect rule exists for the site's hostname.
    ///
    /// Rules are matched by content as well as by id, so stale rules left under
    /// another id are cleared before the fresh one is added.
    pub async fn ensure_blocked(&self, site: &SitePolicy) -> EnforcementResult<()> {
        let _guard = self.lock.lock().await;
        let desired = self.rule_for(site);
        let existing = self.backend.list_rules().await?;

        let conflicting: Vec<&EnforcementRule> = existing
            .iter()
            .filter(|r| r.id == desired.id || r.hostname() == Some(site.hostname.as_str()))
            .collect();

        if conflicting.len() == 1 && *conflicting[0] == desired {
            return Ok(());
        }

        let remove_ids: Vec<u32> = conflicting.iter().map(|r| r.id).collect();

        self.backend.update_rules(&remove_ids, vec![desired]).await?;
        debug!("Rule {} installed for {} (cleared {:?})", site.rule_id, site.hostname, remove_ids);
        Ok(())
    }

    /// Remove every rule for `hostname`. Returns how many were removed.
    pub async fn ensure_unblocked(&self, hostname: &str) -> EnforcementResult<usize> {
        let _guard = self.lock.lock().await;
        let remove_ids: Vec<u32> = self
            .backend
            .list_rules()
            .await?
            .iter()
            .filter(|r| r.hostname() == Some(hostname))
            .map(|r| r.id)
            .collect();

        if remove_ids.is_empty() {
            return Ok(0);
        }

        self.backend.update_rules(&remove_ids, Vec::new()).await?;
        debug!("Removed {} rule(s) for {}", remove_ids.len(), hostname);
        Ok(remove_ids.len())
    }

    /// Rebuild the rule set from the given sites in one pass.
    ///
    /// `Always` sites get a rule, `Timed` sites get one iff exhausted, and any
    /// rule not matching that picture (including orphans) is removed. The
    /// caller is expected to have run the daily reconciliation first.
    pub async fn sync_all(&self, sites: &[SitePolicy]) -> EnforcementResult<SyncReport> {
        let _guard = self.lock.lock().await;

        let desired: BTreeMap<u32, EnforcementRule> = sites
            .iter()
            .filter(|site| budget::is_exhausted(site))
            .map(|site| (site.rule_id.0, self.rule_for(site)))
            .collect();

        let existing = self.backend.list_rules().await?;
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        let mut remove_ids = Vec::new();

        for rule in &existing {
            if desired.get(&rule.id) == Some(rule) && seen.insert(rule.id) {
                report.kept += 1;
            } else {
                remove_ids.push(rule.id);
            }
        }

        let add_rules: Vec<EnforcementRule> = desired
            .into_values()
            .filter(|rule| !seen.contains(&rule.id))
            .collect();

        report.removed = remove_ids.len();
        report.added = add_rules.len();

        if report.removed > 0 || report.added > 0 {
            self.backend.update_rules(&remove_ids, add_rules).await?;
        }

        info!(
            "Rule sync on {} backend: {} added, {} removed, {} kept",
            self.backend.name(),
            report.added,
            report.removed,
            report.kept
        );
        Ok(report)
    }

    /// Whether some rule currently redirects `hostname`
    pub async fn is_blocked(&self, hostname: &str) -> EnforcementResult<bool> {
        Ok(self
            .backend
            .list_rules()
            .await?
            .iter()
            .any(|r| r.hostname() == Some(hostname)))
    }

    pub async fn rules(&self) -> EnforcementResult<Vec<EnforcementRule>> {
        self.backend.list_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::site::{BlockMode, BudgetState, RuleId};
    use crate::time::DayKey;
    use chrono::Utc;
    use uuid::Uuid;

    fn site(host: &str, rule: u32, mode: BlockMode, remaining: u32) -> SitePolicy {
        SitePolicy {
            id: Uuid::new_v4(),
            rule_id: RuleId(rule),
            hostname: host.to_string(),
            origin: format!("https://{}", host),
            budget: match mode {
                BlockMode::Timed { .. } => Some(BudgetState {
                    remaining_seconds: remaining,
                    last_reset_day: DayKey::from(chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
                }),
                BlockMode::Always => None,
            },
            mode,
            color: "#000000".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ensure_blocked_is_idempotent_and_heals_stale_ids() {
        let backend = Arc::new(MemoryRuleBackend::new());
        let channel = EnforcementChannel::new(backend.clone(), "/blocked.html");
        let s = site("example.com", 4, BlockMode::Always, 0);

        // a leftover rule for the same host under a different id
        let mut stale = channel.rule_for(&s);
        stale.id = 99;
        backend.update_rules(&[], vec![stale]).await.unwrap();

        channel.ensure_blocked(&s).await.unwrap();
        channel.ensure_blocked(&s).await.unwrap();

        let rules = channel.rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 4);
        assert!(channel.is_blocked("example.com").await.unwrap());
    }

    #[tokio::test]
    async fn unblock_without_rules_is_fine() {
        let channel = EnforcementChannel::in_memory("/blocked.html");
        assert_eq!(channel.ensure_unblocked("example.com").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn block_page_carries_encoded_origin() {
        let channel = EnforcementChannel::in_memory("/blocked.html");
        let s = site("example.com", 1, BlockMode::Always, 0);
        assert_eq!(channel.block_page_for(&s), "/blocked.html?host=https%3A%2F%2Fexample.com");
    }

    #[tokio::test]
    async fn sync_all_matches_registry_picture() {
        let backend = Arc::new(MemoryRuleBackend::new());
        let channel = EnforcementChannel::new(backend.clone(), "/blocked.html");
        let always = site("ads.example", 1, BlockMode::Always, 0);
        let spent = site("video.example", 2, BlockMode::Timed { daily_budget_seconds: 60 }, 0);
        let fresh = site("news.example", 3, BlockMode::Timed { daily_budget_seconds: 60 }, 30);

        // stale rule for a site that still has budget, plus an orphan
        channel.ensure_blocked(&fresh).await.unwrap();
        let orphan = site("gone.example", 50, BlockMode::Always, 0);
        channel.ensure_blocked(&orphan).await.unwrap();
        channel.ensure_blocked(&always).await.unwrap();

        let report = channel.sync_all(&[always.clone(), spent.clone(), fresh.clone()]).await.unwrap();
        assert_eq!(report, SyncReport { added: 1, removed: 2, kept: 1 });

        assert!(channel.is_blocked("ads.example").await.unwrap());
        assert!(channel.is_blocked("video.example").await.unwrap());
        assert!(!channel.is_blocked("news.example").await.unwrap());
        assert!(!channel.is_blocked("gone.example").await.unwrap());

        let again = channel.sync_all(&[always, spent, fresh]).await.unwrap();
        assert_eq!(again, SyncReport { added: 0, removed: 0, kept: 2 });
    }
}
