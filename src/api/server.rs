use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::messages::{ErrorCode, Request, Response};
use super::router::Router;
use super::tab_socket::{self, TabQuery};
use crate::tabs::TabId;
use crate::utils::metrics::{self, Metrics};

const MAX_BODY_BYTES: u64 = 64 * 1024;

fn with_router(router: Arc<Router>) -> impl Filter<Extract = (Arc<Router>,), Error = Infallible> + Clone {
    warp::any().map(move || router.clone())
}

/// All HTTP routes of the daemon. Tab sessions checkpoint every `checkpoint_every`.
pub fn routes(
    router: Arc<Router>,
    checkpoint_every: Duration,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let rpc = warp::path!("api" / "rpc")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_router(router.clone()))
        .and_then(handle_rpc);

    let sites = warp::path!("api" / "sites")
        .and(warp::get())
        .and(with_router(router.clone()))
        .and_then(|router: Arc<Router>| handle_rpc(Request::ListSites, router));

    let tabs = warp::path!("api" / "tabs" / TabId / "ws")
        .and(warp::ws())
        .and(warp::query::<TabQuery>())
        .and(with_router(router))
        .map(move |tab_id: TabId, ws: warp::ws::Ws, query: TabQuery, router: Arc<Router>| {
            let service = router.service().clone();
            ws.on_upgrade(move |socket| tab_socket::handle_socket(socket, service, tab_id, query, checkpoint_every))
        });

    let health = warp::path!("health").and(warp::get()).map(|| "OK");

    let metrics_route = warp::path!("metrics").and(warp::get()).and_then(handle_metrics);

    rpc.or(sites).or(tabs).or(health).or(metrics_route).recover(handle_rejection)
}

async fn handle_rpc(request: Request, router: Arc<Router>) -> Result<impl Reply, Rejection> {
    let response = router.dispatch(request).await;
    Ok(warp::reply::json(&response))
}

async fn handle_metrics() -> Result<impl Reply, Rejection> {
    let metrics = match metrics::registry() {
        Ok(registry) => registry.collect_metrics().await,
        Err(_) => Metrics::default(),
    };
    Ok(warp::reply::json(&metrics))
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "no such route".to_string())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", rejection))
    };

    let body = Response::failed(ErrorCode::InvalidRequest, message);
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(
    addr: SocketAddr,
    router: Arc<Router>,
    checkpoint_every: Duration,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(router, checkpoint_every))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()))?;

    info!("HTTP API listening on {}", bound);
    server.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::BlockingService;
    use crate::enforcement::EnforcementChannel;
    use crate::models::ModeKind;
    use crate::registry::SiteRegistry;
    use crate::session::DEFAULT_CHECKPOINT_EVERY;
    use crate::tabs::{TabEvent, TabHub};
    use crate::time::SystemClock;
    use serde_json::{json, Value};

    fn router() -> Arc<Router> {
        Arc::new(Router::new(Arc::new(BlockingService::new(
            Arc::new(SiteRegistry::in_memory()),
            Arc::new(EnforcementChannel::in_memory("/blocked.html")),
            Arc::new(TabHub::new()),
            Arc::new(SystemClock),
        ))))
    }

    #[tokio::test]
    async fn rpc_round_trip_over_http() {
        let api = routes(router(), DEFAULT_CHECKPOINT_EVERY);

        let reply = warp::test::request()
            .method("POST")
            .path("/api/rpc")
            .json(&json!({ "type": "addSite", "url": "https://ads.example", "mode": "always" }))
            .reply(&api)
            .await;
        assert_eq!(reply.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["site"]["hostname"], "ads.example");

        let reply = warp::test::request().method("GET").path("/api/sites").reply(&api).await;
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(body["sites"].as_array().map(Vec::len), Some(1));

        let reply = warp::test::request()
            .method("POST")
            .path("/api/rpc")
            .json(&json!({ "type": "navigate", "tabId": 4, "url": "https://ads.example/banner" }))
            .reply(&api)
            .await;
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(body["block"], true);
        assert_eq!(body["redirectTo"], "/blocked.html?host=https%3A%2F%2Fads.example");
    }

    #[tokio::test]
    async fn malformed_requests_get_a_json_error() {
        let api = routes(router(), DEFAULT_CHECKPOINT_EVERY);
        let reply = warp::test::request()
            .method("POST")
            .path("/api/rpc")
            .json(&json!({ "type": "launchRockets" }))
            .reply(&api)
            .await;
        assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(body["error"], "InvalidRequest");

        let reply = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(&reply.body()[..], b"OK");
    }

    async fn wait_for_tab(router: &Router, tab_id: TabId) {
        for _ in 0..200 {
            if router.service().tabs().page_url(tab_id).await.is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("tab {} never registered", tab_id);
    }

    fn next_event(msg: warp::ws::Message) -> TabEvent {
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn tab_socket_registers_the_tab_and_delivers_events() {
        let router = router();
        let api = routes(router.clone(), DEFAULT_CHECKPOINT_EVERY);
        router
            .service()
            .add_site("https://video.example", ModeKind::Timed, Some("0:1"), None)
            .await
            .unwrap();

        let mut client = warp::test::ws()
            .path("/api/tabs/7/ws?url=https%3A%2F%2Fvideo.example%2Fwatch&visible=false")
            .handshake(api.clone())
            .await
            .expect("handshake");
        wait_for_tab(&router, 7).await;

        let report = router.service().daily_reset(chrono::Utc::now()).await.unwrap();
        assert_eq!(report.notified_tabs, 1);
        assert_eq!(
            next_event(client.recv().await.unwrap()),
            TabEvent::DailyResetForHost {
                hostname: "video.example".to_string(),
                remaining_seconds: 60
            }
        );

        let reply = warp::test::request()
            .method("POST")
            .path("/api/rpc")
            .json(&json!({ "type": "timeUp", "pageUrl": "https://video.example/watch", "tabId": 7 }))
            .reply(&api)
            .await;
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["redirectTo"], "/blocked.html?host=https%3A%2F%2Fvideo.example");

        assert_eq!(
            next_event(client.recv().await.unwrap()),
            TabEvent::Redirect {
                url: "/blocked.html?host=https%3A%2F%2Fvideo.example".to_string()
            }
        );
    }

    #[tokio::test]
    async fn tab_socket_needs_a_page_url() {
        let api = routes(router(), DEFAULT_CHECKPOINT_EVERY);
        let result = warp::test::ws().path("/api/tabs/7/ws").handshake(api).await;
        assert!(result.is_err());
    }
}
