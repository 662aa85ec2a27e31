//! Blocking decisions and the operations that move a site between states.
//!
//! `BlockingService` is the only component that touches the registry, the
//! rule set and the tabs together. Registry failures fail the call. Rule and
//! tab failures are logged and counted, and the next decision or sync repairs
//! whatever they left behind.
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::budget;
use crate::enforcement::{EnforcementChannel, EnforcementError, SyncReport};
use crate::filter::{normalize_url, FilterError};
use crate::models::site::{BlockMode, ModeKind, NewSite, SiteId, SitePolicy};
use crate::registry::{RegistryError, SiteRegistry};
use crate::tabs::{TabEvent, TabHub, TabId};
use crate::time::{format_budget, parse_budget, Clock, TimeError};
use crate::utils::metrics_channel;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Filter(#[from] FilterError),

    #[error("{0}")]
    Budget(#[from] TimeError),

    #[error("No timed site matches {0}")]
    UnknownSite(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Enforcement error: {0}")]
    Enforcement(#[from] EnforcementError),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Whether a URL is blocked right now, and by which policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub block: bool,
    pub site: Option<SitePolicy>,
}

impl Decision {
    fn allow(site: Option<SitePolicy>) -> Self {
        Self { block: false, site }
    }
}

/// Budget seen by a session starting on a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLookup {
    NotTimed,
    Active { remaining_seconds: u32, block_now: bool },
}

/// Result of a committed page navigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationOutcome {
    pub block: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub removed_count: usize,
    pub overlay_stopped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyResetReport {
    pub reset: usize,
    pub notified_tabs: usize,
}

/// Blocking decision service
pub struct BlockingService {
    registry: Arc<SiteRegistry>,
    enforcement: Arc<EnforcementChannel>,
    tabs: Arc<TabHub>,
    clock: Arc<dyn Clock>,
}

impl BlockingService {
    pub fn new(
        registry: Arc<SiteRegistry>,
        enforcement: Arc<EnforcementChannel>,
        tabs: Arc<TabHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            enforcement,
            tabs,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    pub fn enforcement(&self) -> &Arc<EnforcementChannel> {
        &self.enforcement
    }

    pub fn tabs(&self) -> &Arc<TabHub> {
        &self.tabs
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decide whether `url` is blocked at `now`.
    ///
    /// Non-web and unknown URLs are never blocked. A timed site is reconciled
    /// (and the reconciliation persisted) before its budget is read, and the
    /// rule set is brought in line with the outcome.
    pub async fn decide(&self, url: &str, now: DateTime<Utc>) -> ServiceResult<Decision> {
        let _timer = metrics_channel::start_timer("decision.duration");
        metrics_channel::increment_counter("decisions.total");

        let origin = match normalize_url(url) {
            Ok(origin) => origin,
            Err(e) => {
                debug!("Not deciding on {}: {}", url, e);
                return Ok(Decision::allow(None));
            }
        };

        let Some(site) = self.registry.find_matching(&origin.hostname).await? else {
            return Ok(Decision::allow(None));
        };

        let site = if site.is_timed() {
            let today = self.clock.day_key(now);
            match self.registry.update(site.id, |s| budget::reconcile_daily(s, &today)).await {
                Ok((site, reset)) => {
                    if reset {
                        info!("Daily budget of {} reset on visit", site.hostname);
                    }
                    site
                }
                // deleted between lookup and reconcile
                Err(RegistryError::NotFound(_)) => return Ok(Decision::allow(None)),
                Err(e) => return Err(e.into()),
            }
        } else {
            site
        };

        let block = budget::is_exhausted(&site);
        if block {
            metrics_channel::increment_counter("decisions.blocked");
            self.enforce_block(&site).await;
        } else {
            self.enforce_unblock(&site.hostname).await;
        }

        Ok(Decision { block, site: Some(site) })
    }

    /// Main-frame commit in a tab. Blocked pages are redirected.
    pub async fn on_navigation(&self, tab_id: TabId, url: &str) -> ServiceResult<NavigationOutcome> {
        self.tabs.navigated(tab_id, url).await;
        let decision = self.decide(url, self.clock.now()).await?;

        let redirect_to = match (decision.block, decision.site) {
            (true, Some(site)) => {
                let target = self.enforcement.block_page_for(&site);
                if let Err(e) = self.tabs.redirect(tab_id, &target).await {
                    debug!("Could not redirect tab {}: {}", tab_id, e);
                }
                Some(target)
            }
            _ => None,
        };

        Ok(NavigationOutcome {
            block: decision.block,
            redirect_to,
        })
    }

    /// Budget for a session starting on `page_url`
    pub async fn get_budget(&self, page_url: &str) -> ServiceResult<BudgetLookup> {
        let decision = self.decide(page_url, self.clock.now()).await?;
        match decision.site {
            Some(site) if site.is_timed() => Ok(BudgetLookup::Active {
                remaining_seconds: site.remaining_seconds().unwrap_or(0),
                block_now: decision.block,
            }),
            _ => Ok(BudgetLookup::NotTimed),
        }
    }

    /// Store the remaining time reported by a live session.
    ///
    /// Reports above the stored value are ignored. Reaching zero installs the
    /// rule right away instead of waiting for the session's time-up.
    pub async fn sync_remaining(&self, page_url: &str, remaining_seconds: u32) -> ServiceResult<u32> {
        let site = self.timed_site_for(page_url).await?;
        let (site, stored) = self
            .registry
            .update(site.id, |s| budget::checkpoint(s, remaining_seconds))
            .await?;

        metrics_channel::increment_counter("sessions.checkpoints");
        debug!("Checkpoint for {}: {} left", site.hostname, format_budget(stored));

        if stored == 0 {
            self.enforce_block(&site).await;
        }
        Ok(stored)
    }

    /// A session ran out of time. Zeroes the budget, blocks the host and
    /// sends the originating tab (or every tab on the host) to the block page.
    /// Returns the block page the caller should show.
    pub async fn time_up(&self, page_url: &str, tab_id: Option<TabId>) -> ServiceResult<String> {
        let site = self.site_for(page_url).await?;
        let (site, ()) = self.registry.update(site.id, budget::exhaust).await?;
        info!("Time is up for {}", site.hostname);

        self.enforce_block(&site).await;

        let target = self.enforcement.block_page_for(&site);
        match tab_id {
            Some(tab_id) => {
                if let Err(e) = self.tabs.redirect(tab_id, &target).await {
                    debug!("Could not redirect tab {}: {}", tab_id, e);
                }
            }
            None => {
                self.tabs.redirect_host(&site.hostname, &target).await;
            }
        }
        Ok(target)
    }

    /// Register a site from the URL the user typed.
    ///
    /// Input is validated before the registry is touched. A site that starts
    /// blocked sends its open tabs to the block page; a timed site with budget
    /// has its countdown started in the open tabs.
    pub async fn add_site(
        &self,
        url: &str,
        kind: ModeKind,
        daily_budget: Option<&str>,
        color: Option<String>,
    ) -> ServiceResult<SitePolicy> {
        let origin = normalize_url(url)?;
        let mode = match kind {
            ModeKind::Always => BlockMode::Always,
            ModeKind::Timed => BlockMode::Timed {
                daily_budget_seconds: parse_budget(daily_budget.unwrap_or(""))?,
            },
        };

        let new_site = NewSite {
            origin: origin.as_origin_string(),
            hostname: origin.hostname,
            mode,
            color,
        };
        let site = self.registry.add(new_site, &self.clock.today()).await?;
        metrics_channel::increment_counter("sites.added");

        if budget::is_exhausted(&site) {
            self.enforce_block(&site).await;
            let target = self.enforcement.block_page_for(&site);
            let redirected = self.tabs.redirect_host(&site.hostname, &target).await;
            debug!("Redirected {} open tab(s) of {}", redirected, site.hostname);
        } else {
            self.enforce_unblock(&site.hostname).await;
            self.tabs
                .broadcast_to_host(
                    &site.hostname,
                    TabEvent::DailyResetForHost {
                        hostname: site.hostname.clone(),
                        remaining_seconds: site.remaining_seconds().unwrap_or(0),
                    },
                )
                .await;
        }

        Ok(site)
    }

    /// Delete a site, its rule and any countdown showing for it
    pub async fn remove_site(&self, id: SiteId) -> ServiceResult<RemovalOutcome> {
        let record = self.registry.remove(id).await?;
        metrics_channel::increment_counter("sites.removed");

        let rules = self.enforce_unblock(&record.site.hostname).await;
        debug!("Removed {} rule(s) with {}", rules, record.site.hostname);

        let overlay_stopped = record.site.is_timed();
        if overlay_stopped {
            self.tabs
                .broadcast_to_host(
                    &record.site.hostname,
                    TabEvent::StopTimerForHost {
                        hostname: record.site.hostname.clone(),
                    },
                )
                .await;
        }

        Ok(RemovalOutcome {
            removed_count: record.removed_count,
            overlay_stopped,
        })
    }

    /// All sites, oldest first
    pub async fn list_sites(&self) -> ServiceResult<Vec<SitePolicy>> {
        Ok(self.registry.list().await?)
    }

    /// Midnight pass: refill every stale timed budget in one write, line the
    /// rules up with the result and restart the countdown in open tabs.
    pub async fn daily_reset(&self, now: DateTime<Utc>) -> ServiceResult<DailyResetReport> {
        let today = self.clock.day_key(now);
        let results = self
            .registry
            .update_all(|s| budget::reconcile_daily(s, &today))
            .await?;
        metrics_channel::increment_counter("daily_reset.runs");

        let mut report = DailyResetReport::default();
        for (site, reset) in results.into_iter().filter(|(s, _)| s.is_timed()) {
            if reset {
                report.reset += 1;
            }

            if budget::is_exhausted(&site) {
                self.enforce_block(&site).await;
            } else {
                self.enforce_unblock(&site.hostname).await;
            }

            report.notified_tabs += self
                .tabs
                .broadcast_to_host(
                    &site.hostname,
                    TabEvent::DailyResetForHost {
                        hostname: site.hostname.clone(),
                        remaining_seconds: site.remaining_seconds().unwrap_or(0),
                    },
                )
                .await;
        }

        info!(
            "Daily reset for {}: {} budget(s) refilled, {} tab(s) notified",
            today, report.reset, report.notified_tabs
        );
        Ok(report)
    }

    /// Reconcile every site and rebuild the rule set from scratch
    pub async fn startup(&self) -> ServiceResult<SyncReport> {
        let today = self.clock.today();
        self.registry
            .update_all(|s| budget::reconcile_daily(s, &today))
            .await?;
        let sites = self.registry.list().await?;
        let report = self.enforcement.sync_all(&sites).await?;
        info!("Startup sync over {} site(s) complete", sites.len());
        Ok(report)
    }

    async fn site_for(&self, page_url: &str) -> ServiceResult<SitePolicy> {
        let origin = normalize_url(page_url)?;
        self.registry
            .find_matching(&origin.hostname)
            .await?
            .ok_or(ServiceError::UnknownSite(origin.hostname))
    }

    async fn timed_site_for(&self, page_url: &str) -> ServiceResult<SitePolicy> {
        let site = self.site_for(page_url).await?;
        if !site.is_timed() {
            return Err(ServiceError::UnknownSite(site.hostname));
        }
        Ok(site)
    }

    async fn enforce_block(&self, site: &SitePolicy) {
        if let Err(e) = self.enforcement.ensure_blocked(site).await {
            metrics_channel::increment_counter("enforcement.errors");
            warn!("Failed to install rule for {}: {}", site.hostname, e);
        }
    }

    async fn enforce_unblock(&self, hostname: &str) -> usize {
        match self.enforcement.ensure_unblocked(hostname).await {
            Ok(removed) => removed,
            Err(e) => {
                metrics_channel::increment_counter("enforcement.errors");
                warn!("Failed to remove rules for {}: {}", hostname, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn service_at(now: DateTime<Utc>) -> (BlockingService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let service = BlockingService::new(
            Arc::new(SiteRegistry::in_memory()),
            Arc::new(EnforcementChannel::in_memory("/blocked.html")),
            Arc::new(TabHub::new()),
            clock.clone(),
        );
        (service, clock)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn unknown_and_non_web_urls_are_allowed() {
        let (service, _) = service_at(noon());
        let d = service.decide("https://example.com/", noon()).await.unwrap();
        assert!(!d.block && d.site.is_none());
        let d = service.decide("chrome://settings", noon()).await.unwrap();
        assert!(!d.block);
    }

    #[tokio::test]
    async fn timed_site_with_budget_is_not_blocked() {
        let (service, _) = service_at(noon());
        service
            .add_site("https://news.example/", ModeKind::Timed, Some("0:30"), None)
            .await
            .unwrap();

        let d = service.decide("https://news.example/today", noon()).await.unwrap();
        assert!(!d.block);
        assert_eq!(d.site.unwrap().remaining_seconds(), Some(1800));
        assert!(!service.enforcement().is_blocked("news.example").await.unwrap());
    }

    #[tokio::test]
    async fn time_up_blocks_and_redirects_tab() {
        let (service, _) = service_at(noon());
        service
            .add_site("https://video.example", ModeKind::Timed, Some("0:0:5"), None)
            .await
            .unwrap();
        let mut rx = service.tabs().register(9, "https://video.example/watch").await;

        let target = service.time_up("https://video.example/watch", Some(9)).await.unwrap();
        assert_eq!(target, "/blocked.html?host=https%3A%2F%2Fvideo.example");

        assert!(service.enforcement().is_blocked("video.example").await.unwrap());
        assert_eq!(
            rx.recv().await,
            Some(TabEvent::Redirect {
                url: "/blocked.html?host=https%3A%2F%2Fvideo.example".to_string()
            })
        );
        let d = service.decide("https://video.example/", noon()).await.unwrap();
        assert!(d.block);
    }

    #[tokio::test]
    async fn late_checkpoint_cannot_lift_a_block() {
        let (service, _) = service_at(noon());
        service
            .add_site("https://video.example", ModeKind::Timed, Some("0:1"), None)
            .await
            .unwrap();
        service.time_up("https://video.example/", None).await.unwrap();

        // a second tab still thinks it has 40 seconds
        let stored = service.sync_remaining("https://video.example/", 40).await.unwrap();
        assert_eq!(stored, 0);

        let d = service.decide("https://video.example/", noon()).await.unwrap();
        assert!(d.block);
        assert!(service.enforcement().is_blocked("video.example").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_input_leaves_registry_untouched() {
        let (service, _) = service_at(noon());
        let err = service.add_site("not a url", ModeKind::Always, None, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Filter(_)));

        let err = service
            .add_site("https://example.com", ModeKind::Timed, Some("25:00:00"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Budget(_)));

        let err = service
            .add_site("https://example.com", ModeKind::Timed, Some(""), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Registry(RegistryError::InvalidBudget)));

        assert!(service.list_sites().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_remaining_requires_a_timed_site() {
        let (service, _) = service_at(noon());
        service.add_site("https://ads.example", ModeKind::Always, None, None).await.unwrap();

        let err = service.sync_remaining("https://ads.example/", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownSite(h) if h == "ads.example"));

        let err = service.sync_remaining("https://other.example/", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownSite(_)));
    }

    #[tokio::test]
    async fn remove_stops_overlay_only_for_timed_sites() {
        let (service, _) = service_at(noon());
        let timed = service
            .add_site("https://news.example", ModeKind::Timed, Some("1"), None)
            .await
            .unwrap();
        let always = service.add_site("https://ads.example", ModeKind::Always, None, None).await.unwrap();
        let mut rx = service.tabs().register(1, "https://news.example/").await;

        let outcome = service.remove_site(timed.id).await.unwrap();
        assert_eq!(outcome, RemovalOutcome { removed_count: 1, overlay_stopped: true });
        assert_eq!(
            rx.recv().await,
            Some(TabEvent::StopTimerForHost {
                hostname: "news.example".to_string()
            })
        );

        let outcome = service.remove_site(always.id).await.unwrap();
        assert!(!outcome.overlay_stopped);
        assert!(!service.enforcement().is_blocked("ads.example").await.unwrap());

        let err = service.remove_site(always.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn daily_reset_refills_and_notifies() {
        let (service, clock) = service_at(noon());
        service
            .add_site("https://video.example", ModeKind::Timed, Some("0:1"), None)
            .await
            .unwrap();
        service.time_up("https://video.example/", None).await.unwrap();
        assert!(service.enforcement().is_blocked("video.example").await.unwrap());

        let mut rx = service.tabs().register(3, "https://video.example/").await;
        clock.advance(chrono::Duration::hours(24));

        let report = service.daily_reset(clock.now()).await.unwrap();
        assert_eq!(report, DailyResetReport { reset: 1, notified_tabs: 1 });
        assert!(!service.enforcement().is_blocked("video.example").await.unwrap());
        assert_eq!(
            rx.recv().await,
            Some(TabEvent::DailyResetForHost {
                hostname: "video.example".to_string(),
                remaining_seconds: 60
            })
        );

        // second run the same day changes nothing
        let again = service.daily_reset(clock.now()).await.unwrap();
        assert_eq!(again.reset, 0);
    }
}
