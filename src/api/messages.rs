use serde::{Deserialize, Serialize};

use crate::decision::NavigationOutcome;
use crate::models::site::{ModeKind, SiteId, SitePolicy};
use crate::tabs::TabId;

/// Requests accepted by the router, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    AddSite {
        url: String,
        mode: ModeKind,
        /// `HH:MM:SS` text as typed, required for timed sites
        #[serde(default)]
        daily_budget: Option<String>,
        #[serde(default)]
        color: Option<String>,
    },

    RemoveSite {
        id: SiteId,
    },

    ListSites,

    #[serde(rename_all = "camelCase")]
    GetBudget {
        page_url: String,
    },

    #[serde(rename_all = "camelCase")]
    SyncRemaining {
        page_url: String,
        /// Signed so a session that overshot can report a negative value
        remaining_seconds: i64,
    },

    #[serde(rename_all = "camelCase")]
    TimeUp {
        page_url: String,
        #[serde(default)]
        tab_id: Option<TabId>,
    },

    #[serde(rename_all = "camelCase")]
    Navigate {
        tab_id: TabId,
        url: String,
    },
}

/// Machine-readable failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    DuplicateHostname,
    InvalidUrl,
    InvalidBudget,
    NotFound,
    NotTimed,
    InvalidRequest,
    Internal,
}

/// Responses, serialized without a tag so each shape is the wire contract
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    SiteAdded {
        success: bool,
        site: SitePolicy,
    },

    #[serde(rename_all = "camelCase")]
    SiteRemoved {
        success: bool,
        removed_count: usize,
        overlay_stopped: bool,
    },

    Failed {
        success: bool,
        error: ErrorCode,
        message: String,
    },

    Sites {
        sites: Vec<SitePolicy>,
    },

    #[serde(rename_all = "camelCase")]
    Budget {
        ok: bool,
        remaining_seconds: u32,
        block_now: bool,
    },

    Ack {
        ok: bool,
    },

    /// Budget spent; the tab should show `redirect_to`
    #[serde(rename_all = "camelCase")]
    TimedOut {
        ok: bool,
        redirect_to: String,
    },

    Rejected {
        ok: bool,
        reason: ErrorCode,
    },

    Navigation(NavigationOutcome),
}

impl Response {
    pub fn failed(error: ErrorCode, message: impl Into<String>) -> Self {
        Response::Failed {
            success: false,
            error,
            message: message.into(),
        }
    }

    pub fn rejected(reason: ErrorCode) -> Self {
        Response::Rejected { ok: false, reason }
    }

    pub fn ack() -> Self {
        Response::Ack { ok: true }
    }
}
