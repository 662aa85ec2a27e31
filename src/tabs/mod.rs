//! Open tabs and the channels used to reach their sessions.
//!
//! The hub only knows which page each tab shows and how to deliver an event to
//! it. Delivery is fire-and-forget: a tab whose receiver is gone is pruned and
//! reported as unreachable, and callers are expected to shrug that off.
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::filter::{host_matches, normalize_url};

const TAB_QUEUE_DEPTH: usize = 32;

pub type TabId = u64;

/// Events pushed from the service to tabs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TabEvent {
    /// A new day started; restart the countdown at this value
    #[serde(rename_all = "camelCase")]
    DailyResetForHost { hostname: String, remaining_seconds: u32 },

    /// The site was deleted; tear the countdown down
    StopTimerForHost { hostname: String },

    /// Navigate the tab away, usually to the block page
    Redirect { url: String },
}

/// Tab messaging errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TabError {
    #[error("Tab {0} is unreachable")]
    Unreachable(TabId),
}

/// Result type for tab operations
pub type TabResult<T> = Result<T, TabError>;

struct TabEntry {
    page_url: String,
    hostname: Option<String>,
    sender: mpsc::Sender<TabEvent>,
}

/// Registry of open tabs
#[derive(Default)]
pub struct TabHub {
    tabs: RwLock<HashMap<TabId, TabEntry>>,
}

impl TabHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a tab showing `page_url`; events for it arrive on the receiver
    pub async fn register(&self, tab_id: TabId, page_url: &str) -> mpsc::Receiver<TabEvent> {
        let (sender, receiver) = mpsc::channel(TAB_QUEUE_DEPTH);
        let entry = TabEntry {
            page_url: page_url.to_string(),
            hostname: normalize_url(page_url).ok().map(|o| o.hostname),
            sender,
        };
        self.tabs.write().await.insert(tab_id, entry);
        debug!("Tab {} registered at {}", tab_id, page_url);
        receiver
    }

    pub async fn unregister(&self, tab_id: TabId) {
        if self.tabs.write().await.remove(&tab_id).is_some() {
            debug!("Tab {} unregistered", tab_id);
        }
    }

    /// Forget `tab_id` unless someone still listens on its queue. Returns
    /// whether the tab was dropped.
    pub async fn release(&self, tab_id: TabId) -> bool {
        let mut tabs = self.tabs.write().await;
        let closed = tabs.get(&tab_id).is_some_and(|e| e.sender.is_closed());
        if closed {
            tabs.remove(&tab_id);
            debug!("Tab {} released", tab_id);
        }
        closed
    }

    /// Record that a tab committed a navigation to `url`
    pub async fn navigated(&self, tab_id: TabId, url: &str) {
        if let Some(entry) = self.tabs.write().await.get_mut(&tab_id) {
            entry.page_url = url.to_string();
            entry.hostname = normalize_url(url).ok().map(|o| o.hostname);
        }
    }

    pub async fn page_url(&self, tab_id: TabId) -> Option<String> {
        self.tabs.read().await.get(&tab_id).map(|e| e.page_url.clone())
    }

    /// Tabs showing `policy_host` or one of its subdomains
    pub async fn tabs_for_host(&self, policy_host: &str) -> Vec<TabId> {
        let mut ids: Vec<TabId> = self
            .tabs
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.hostname.as_deref().is_some_and(|h| host_matches(policy_host, h)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Deliver one event to one tab
    pub async fn send(&self, tab_id: TabId, event: TabEvent) -> TabResult<()> {
        let sender = self
            .tabs
            .read()
            .await
            .get(&tab_id)
            .map(|e| e.sender.clone())
            .ok_or(TabError::Unreachable(tab_id))?;

        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TabError::Unreachable(tab_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(tab_id).await;
                Err(TabError::Unreachable(tab_id))
            }
        }
    }

    /// Deliver `event` to every tab on `policy_host`. Returns how many got it.
    pub async fn broadcast_to_host(&self, policy_host: &str, event: TabEvent) -> usize {
        let mut delivered = 0;
        for tab_id in self.tabs_for_host(policy_host).await {
            match self.send(tab_id, event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to tab {} skipped: {}", tab_id, e),
            }
        }
        delivered
    }

    /// Point a tab at `url`
    pub async fn redirect(&self, tab_id: TabId, url: &str) -> TabResult<()> {
        self.send(tab_id, TabEvent::Redirect { url: url.to_string() }).await?;
        self.navigated(tab_id, url).await;
        Ok(())
    }

    /// Redirect every tab on `policy_host`. Returns how many were redirected.
    pub async fn redirect_host(&self, policy_host: &str, url: &str) -> usize {
        let mut redirected = 0;
        for tab_id in self.tabs_for_host(policy_host).await {
            if self.redirect(tab_id, url).await.is_ok() {
                redirected += 1;
            }
        }
        redirected
    }

    pub async fn len(&self) -> usize {
        self.tabs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tabs.read().await.is_empty()
    }
}
