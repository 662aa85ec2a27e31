//! Per-tab countdown for a timed site.
//!
//! [`LiveSession`] is the state machine and does no I/O; it is fed ticks,
//! visibility changes and tab events, and answers with the call (if any) the
//! driver should make. [`run_session`] is the driver: one tokio task per page
//! with a 1 Hz ticker, a visibility watch and the tab's event queue.
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::decision::{BlockingService, BudgetLookup, ServiceResult};
use crate::tabs::{TabEvent, TabId};
use crate::time::format_budget;

pub const TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_CHECKPOINT_EVERY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No countdown on this page
    Idle,
    /// Counting down, page visible
    Running,
    /// Countdown paused while the page is hidden
    Suspended,
    /// Budget spent
    Exhausted,
    /// Torn down by unload or site removal
    Stopped,
}

/// Call the driver should make after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Checkpoint(u32),
    TimeUp,
}

#[derive(Debug, Clone)]
pub struct LiveSession {
    state: SessionState,
    remaining: u32,
    visible: bool,
    last_checkpoint: Instant,
    checkpoint_every: Duration,
}

impl LiveSession {
    pub fn new(checkpoint_every: Duration, visible: bool, now: Instant) -> Self {
        Self {
            state: SessionState::Idle,
            remaining: 0,
            visible,
            last_checkpoint: now,
            checkpoint_every,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Whether the ticker should be running
    pub fn is_counting(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Apply the budget returned at page load
    pub fn start(&mut self, lookup: BudgetLookup, now: Instant) {
        match lookup {
            BudgetLookup::NotTimed => self.state = SessionState::Idle,
            BudgetLookup::Active { block_now: true, .. } => {
                self.remaining = 0;
                self.state = SessionState::Exhausted;
            }
            BudgetLookup::Active { remaining_seconds, .. } => self.resume_at(remaining_seconds, now),
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        self.state = match (self.state, visible) {
            (SessionState::Running, false) => SessionState::Suspended,
            (SessionState::Suspended, true) => SessionState::Running,
            (state, _) => state,
        };
    }

    /// One second of visible time passed
    pub fn tick(&mut self, now: Instant) -> Option<SessionAction> {
        if self.state != SessionState::Running {
            return None;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.state = SessionState::Exhausted;
            return Some(SessionAction::TimeUp);
        }

        if now.duration_since(self.last_checkpoint) >= self.checkpoint_every {
            self.last_checkpoint = now;
            return Some(SessionAction::Checkpoint(self.remaining));
        }
        None
    }

    /// The page is going away
    pub fn unload(&mut self) -> Option<SessionAction> {
        let action = match self.state {
            SessionState::Running | SessionState::Suspended => Some(SessionAction::Checkpoint(self.remaining)),
            _ => None,
        };
        self.state = SessionState::Stopped;
        action
    }

    /// React to a broadcast for this tab's host. A stopped session stays stopped.
    pub fn handle_event(&mut self, event: &TabEvent, now: Instant) -> Option<SessionAction> {
        if self.state == SessionState::Stopped {
            return None;
        }

        match event {
            TabEvent::StopTimerForHost { .. } => {
                self.state = SessionState::Stopped;
                None
            }
            TabEvent::DailyResetForHost { remaining_seconds, .. } => {
                if *remaining_seconds == 0 {
                    self.remaining = 0;
                    self.state = SessionState::Exhausted;
                } else {
                    self.resume_at(*remaining_seconds, now);
                }
                None
            }
            TabEvent::Redirect { .. } => self.unload(),
        }
    }

    fn resume_at(&mut self, remaining: u32, now: Instant) {
        self.remaining = remaining;
        self.last_checkpoint = now;
        self.state = if self.visible {
            SessionState::Running
        } else {
            SessionState::Suspended
        };
    }
}

/// Calls a session makes back into the service
#[async_trait]
pub trait BudgetClient: Send + Sync {
    async fn get_budget(&self, page_url: &str) -> ServiceResult<BudgetLookup>;

    async fn sync_remaining(&self, page_url: &str, remaining_seconds: u32) -> ServiceResult<u32>;

    async fn time_up(&self, page_url: &str, tab_id: TabId) -> ServiceResult<()>;
}

#[async_trait]
impl BudgetClient for BlockingService {
    async fn get_budget(&self, page_url: &str) -> ServiceResult<BudgetLookup> {
        BlockingService::get_budget(self, page_url).await
    }

    async fn sync_remaining(&self, page_url: &str, remaining_seconds: u32) -> ServiceResult<u32> {
        BlockingService::sync_remaining(self, page_url, remaining_seconds).await
    }

    async fn time_up(&self, page_url: &str, tab_id: TabId) -> ServiceResult<()> {
        BlockingService::time_up(self, page_url, Some(tab_id)).await.map(|_| ())
    }
}

/// Drive a session for `page_url` in `tab_id` until the page goes away.
///
/// The page is gone when the visibility sender or the tab's event queue is
/// dropped, or when the tab is redirected. Returns the final state.
pub async fn run_session<C>(
    client: Arc<C>,
    tab_id: TabId,
    page_url: String,
    mut visibility: watch::Receiver<bool>,
    mut events: mpsc::Receiver<TabEvent>,
    checkpoint_every: Duration,
) -> SessionState
where
    C: BudgetClient + ?Sized,
{
    let visible = *visibility.borrow_and_update();
    let mut session = LiveSession::new(checkpoint_every, visible, Instant::now());

    match client.get_budget(&page_url).await {
        Ok(lookup) => session.start(lookup, Instant::now()),
        Err(e) => debug!("No session for {}: {}", page_url, e),
    }
    debug!("Session for tab {} starts {:?} with {}s", tab_id, session.state(), session.remaining());

    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick(), if session.is_counting() => {
                let action = session.tick(Instant::now());
                perform(client.as_ref(), tab_id, &page_url, action).await;
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    let action = session.unload();
                    perform(client.as_ref(), tab_id, &page_url, action).await;
                    break;
                }
                let visible = *visibility.borrow_and_update();
                session.set_visible(visible);
                if session.is_counting() {
                    ticker.reset();
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    let action = session.unload();
                    perform(client.as_ref(), tab_id, &page_url, action).await;
                    break;
                };
                let action = session.handle_event(&event, Instant::now());
                perform(client.as_ref(), tab_id, &page_url, action).await;
                if session.state() == SessionState::Stopped {
                    break;
                }
                if session.is_counting() {
                    ticker.reset();
                }
            }
        }
    }

    info!("Session for tab {} ended with {} left", tab_id, format_budget(session.remaining()));
    session.state()
}

async fn perform<C>(client: &C, tab_id: TabId, page_url: &str, action: Option<SessionAction>)
where
    C: BudgetClient + ?Sized,
{
    match action {
        Some(SessionAction::Checkpoint(remaining)) => {
            if let Err(e) = client.sync_remaining(page_url, remaining).await {
                debug!("Checkpoint from tab {} dropped: {}", tab_id, e);
            }
        }
        Some(SessionAction::TimeUp) => {
            if let Err(e) = client.time_up(page_url, tab_id).await {
                debug!("Time-up from tab {} dropped: {}", tab_id, e);
            }
        }
        None => {}
    }
}
