use std::sync::Arc;
use tracing::{debug, error};

use super::messages::{ErrorCode, Request, Response};
use crate::decision::{BlockingService, BudgetLookup, ServiceError};
use crate::registry::RegistryError;
use crate::utils::metrics_channel;

/// Single entry point for every request type
pub struct Router {
    service: Arc<BlockingService>,
}

impl Router {
    pub fn new(service: Arc<BlockingService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<BlockingService> {
        &self.service
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let _timer = metrics_channel::start_timer("rpc.duration");
        debug!("Dispatching {:?}", request);

        match request {
            Request::AddSite {
                url,
                mode,
                daily_budget,
                color,
            } => match self
                .service
                .add_site(&url, mode, daily_budget.as_deref(), color)
                .await
            {
                Ok(site) => Response::SiteAdded { success: true, site },
                Err(e) => Response::failed(error_code(&e), e.to_string()),
            },

            Request::RemoveSite { id } => match self.service.remove_site(id).await {
                Ok(outcome) => Response::SiteRemoved {
                    success: true,
                    removed_count: outcome.removed_count,
                    overlay_stopped: outcome.overlay_stopped,
                },
                Err(e) => Response::failed(error_code(&e), e.to_string()),
            },

            Request::ListSites => match self.service.list_sites().await {
                Ok(sites) => Response::Sites { sites },
                Err(e) => Response::failed(error_code(&e), e.to_string()),
            },

            Request::GetBudget { page_url } => match self.service.get_budget(&page_url).await {
                Ok(BudgetLookup::NotTimed) => Response::rejected(ErrorCode::NotTimed),
                Ok(BudgetLookup::Active {
                    remaining_seconds,
                    block_now,
                }) => Response::Budget {
                    ok: true,
                    remaining_seconds,
                    block_now,
                },
                Err(e) => Response::rejected(error_code(&e)),
            },

            Request::SyncRemaining {
                page_url,
                remaining_seconds,
            } => {
                let remaining = remaining_seconds.clamp(0, u32::MAX as i64) as u32;
                match self.service.sync_remaining(&page_url, remaining).await {
                    Ok(_) => Response::ack(),
                    Err(e) => Response::rejected(error_code(&e)),
                }
            }

            Request::TimeUp { page_url, tab_id } => match self.service.time_up(&page_url, tab_id).await {
                Ok(redirect_to) => Response::TimedOut { ok: true, redirect_to },
                Err(e) => Response::rejected(error_code(&e)),
            },

            Request::Navigate { tab_id, url } => match self.service.on_navigation(tab_id, &url).await {
                Ok(outcome) => Response::Navigation(outcome),
                Err(e) => Response::rejected(error_code(&e)),
            },
        }
    }
}

fn error_code(e: &ServiceError) -> ErrorCode {
    match e {
        ServiceError::Filter(_) => ErrorCode::InvalidUrl,
        ServiceError::Budget(_) => ErrorCode::InvalidBudget,
        ServiceError::UnknownSite(_) => ErrorCode::NotFound,
        ServiceError::Registry(RegistryError::DuplicateHostname(_)) => ErrorCode::DuplicateHostname,
        ServiceError::Registry(RegistryError::InvalidBudget) => ErrorCode::InvalidBudget,
        ServiceError::Registry(RegistryError::NotFound(_)) => ErrorCode::NotFound,
        other => {
            error!("Request failed: {}", other);
            ErrorCode::Internal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::EnforcementChannel;
    use crate::models::ModeKind;
    use crate::registry::SiteRegistry;
    use crate::tabs::TabHub;
    use crate::time::SystemClock;

    fn router() -> Router {
        Router::new(Arc::new(BlockingService::new(
            Arc::new(SiteRegistry::in_memory()),
            Arc::new(EnforcementChannel::in_memory("/blocked.html")),
            Arc::new(TabHub::new()),
            Arc::new(SystemClock),
        )))
    }

    fn add(url: &str, mode: ModeKind, budget: Option<&str>) -> Request {
        Request::AddSite {
            url: url.to_string(),
            mode,
            daily_budget: budget.map(str::to_string),
            color: None,
        }
    }

    #[tokio::test]
    async fn add_reports_typed_failures() {
        let router = router();
        assert!(matches!(
            router.dispatch(add("https://example.com", ModeKind::Always, None)).await,
            Response::SiteAdded { success: true, .. }
        ));
        assert!(matches!(
            router.dispatch(add("https://example.com/other", ModeKind::Always, None)).await,
            Response::Failed { error: ErrorCode::DuplicateHostname, .. }
        ));
        assert!(matches!(
            router.dispatch(add("mailto:me@example.com", ModeKind::Always, None)).await,
            Response::Failed { error: ErrorCode::InvalidUrl, .. }
        ));
        assert!(matches!(
            router.dispatch(add("https://x.example", ModeKind::Timed, Some("1:99"))).await,
            Response::Failed { error: ErrorCode::InvalidBudget, .. }
        ));
    }

    #[tokio::test]
    async fn budget_lookup_and_sync_clamp_negative_values() {
        let router = router();
        router.dispatch(add("https://news.example", ModeKind::Timed, Some("0:1"))).await;

        let page = "https://news.example/a".to_string();
        assert_eq!(
            router.dispatch(Request::GetBudget { page_url: page.clone() }).await,
            Response::Budget {
                ok: true,
                remaining_seconds: 60,
                block_now: false
            }
        );

        let reply = router
            .dispatch(Request::SyncRemaining {
                page_url: page.clone(),
                remaining_seconds: -5,
            })
            .await;
        assert_eq!(reply, Response::ack());

        assert_eq!(
            router.dispatch(Request::GetBudget { page_url: page }).await,
            Response::Budget {
                ok: true,
                remaining_seconds: 0,
                block_now: true
            }
        );
        assert_eq!(
            router
                .dispatch(Request::GetBudget {
                    page_url: "https://elsewhere.example/".to_string()
                })
                .await,
            Response::rejected(ErrorCode::NotTimed)
        );
    }

    #[tokio::test]
    async fn time_up_answers_with_the_block_page() {
        let router = router();
        router.dispatch(add("https://video.example", ModeKind::Timed, Some("0:1"))).await;

        let reply = router
            .dispatch(Request::TimeUp {
                page_url: "https://video.example/watch".to_string(),
                tab_id: Some(7),
            })
            .await;
        assert_eq!(
            reply,
            Response::TimedOut {
                ok: true,
                redirect_to: "/blocked.html?host=https%3A%2F%2Fvideo.example".to_string()
            }
        );

        let reply = router
            .dispatch(Request::TimeUp {
                page_url: "https://nobody.example/".to_string(),
                tab_id: None,
            })
            .await;
        assert_eq!(reply, Response::rejected(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn sync_for_unknown_site_is_not_found() {
        let router = router();
        let reply = router
            .dispatch(Request::SyncRemaining {
                page_url: "https://nobody.example/".to_string(),
                remaining_seconds: 10,
            })
            .await;
        assert_eq!(reply, Response::rejected(ErrorCode::NotFound));
    }
}
