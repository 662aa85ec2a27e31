use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::{format_budget, DayKey};

/// Default display color for new sites
pub const DEFAULT_COLOR: &str = "#ff3b3b";

/// Opaque, immutable site identifier
pub type SiteId = Uuid;

/// Enforcement rule id, unique for the lifetime of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a site is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockMode {
    /// Blocked unconditionally
    Always,

    /// Blocked once the daily budget is used up
    #[serde(rename_all = "camelCase")]
    Timed { daily_budget_seconds: u32 },
}

impl fmt::Display for BlockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockMode::Always => write!(f, "always"),
            BlockMode::Timed { daily_budget_seconds } => {
                write!(f, "timed, {} a day", format_budget(*daily_budget_seconds))
            }
        }
    }
}

/// Mode as requested by a client, before the budget text is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModeKind {
    Always,
    Timed,
}

/// Mutable budget fields of a timed site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub remaining_seconds: u32,
    pub last_reset_day: DayKey,
}

/// A hostname's blocking policy. Exactly one exists per hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitePolicy {
    pub id: SiteId,
    pub rule_id: RuleId,
    pub hostname: String,
    /// `scheme://host[:port]` as entered, shown on the block page
    pub origin: String,
    pub mode: BlockMode,
    /// Present iff `mode` is `Timed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetState>,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

impl SitePolicy {
    pub fn is_timed(&self) -> bool {
        matches!(self.mode, BlockMode::Timed { .. })
    }

    pub fn daily_budget(&self) -> Option<u32> {
        match self.mode {
            BlockMode::Timed { daily_budget_seconds } => Some(daily_budget_seconds),
            BlockMode::Always => None,
        }
    }

    pub fn remaining_seconds(&self) -> Option<u32> {
        self.budget.as_ref().map(|b| b.remaining_seconds)
    }
}

/// Validated input for creating a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSite {
    pub hostname: String,
    pub origin: String,
    pub mode: BlockMode,
    pub color: Option<String>,
}

/// What a successful removal took out of the registry
#[derive(Debug, Clone)]
pub struct RemovedRecord {
    pub site: SitePolicy,
    pub removed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_display_with_formatted_budget() {
        assert_eq!(BlockMode::Always.to_string(), "always");
        assert_eq!(
            BlockMode::Timed { daily_budget_seconds: 5400 }.to_string(),
            "timed, 01:30:00 a day"
        );
    }
}
