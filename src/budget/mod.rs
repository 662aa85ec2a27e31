//! Daily budget rules for a single site record.
//!
//! All functions operate in place on a [`SitePolicy`] and are no-ops for
//! `Always` sites, which count as permanently exhausted. After any of them
//! returns, `remaining_seconds` lies in `[0, daily_budget_seconds]`.

use crate::models::site::{BlockMode, BudgetState, SitePolicy};
use crate::time::DayKey;

/// Fresh budget state for a timed site created on `today`
pub fn initial_state(mode: &BlockMode, today: &DayKey) -> Option<BudgetState> {
    match *mode {
        BlockMode::Timed { daily_budget_seconds } => Some(BudgetState {
            remaining_seconds: daily_budget_seconds,
            last_reset_day: today.clone(),
        }),
        BlockMode::Always => None,
    }
}

/// Refill the budget if the record was last reset on another day.
///
/// Returns whether a reset happened. Calling it again on the same day is a
/// no-op. A timed record that lost its budget state is rebuilt as a reset.
pub fn reconcile_daily(site: &mut SitePolicy, today: &DayKey) -> bool {
    let BlockMode::Timed { daily_budget_seconds } = site.mode else {
        return false;
    };

    match site.budget.as_mut() {
        Some(state) if &state.last_reset_day == today => {
            // clamp records written by older builds
            state.remaining_seconds = state.remaining_seconds.min(daily_budget_seconds);
            false
        }
        Some(state) => {
            state.remaining_seconds = daily_budget_seconds;
            state.last_reset_day = today.clone();
            true
        }
        None => {
            site.budget = initial_state(&site.mode, today);
            true
        }
    }
}

/// Spend `delta_seconds` of the budget, never going below zero.
///
/// Returns the remaining seconds (0 for `Always` sites).
pub fn consume(site: &mut SitePolicy, delta_seconds: u32) -> u32 {
    let timed = site.is_timed();
    match site.budget.as_mut() {
        Some(state) if timed => {
            state.remaining_seconds = state.remaining_seconds.saturating_sub(delta_seconds);
            state.remaining_seconds
        }
        _ => 0,
    }
}

/// Store a value reported by a live session.
///
/// The stored value only ever goes down: a report above what is already
/// stored (a stale tab, or one racing a time-up) is ignored. Returns the
/// stored value.
pub fn checkpoint(site: &mut SitePolicy, reported_seconds: u32) -> u32 {
    if site.daily_budget().is_none() {
        return 0;
    }

    match site.budget.as_mut() {
        Some(state) => {
            state.remaining_seconds = state.remaining_seconds.min(reported_seconds);
            state.remaining_seconds
        }
        None => 0,
    }
}

/// Mark the budget as fully spent
pub fn exhaust(site: &mut SitePolicy) {
    if let Some(state) = site.budget.as_mut() {
        state.remaining_seconds = 0;
    }
}

/// Whether the site should be blocked, assuming [`reconcile_daily`] already ran
pub fn is_exhausted(site: &SitePolicy) -> bool {
    match site.mode {
        BlockMode::Always => true,
        BlockMode::Timed { .. } => site
            .budget
            .as_ref()
            .map_or(true, |state| state.remaining_seconds == 0),
    }
}
