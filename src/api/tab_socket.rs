//! The tab's end of the hub.
//!
//! A tab opens `/api/tabs/{id}/ws?url=<page>` when a page commits. The socket
//! registers the tab, runs its live countdown server-side and pushes every
//! [`TabEvent`] for the tab down as JSON. The tab reports visibility changes
//! up the socket; closing it unloads the page.
use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};

use crate::decision::BlockingService;
use crate::session::run_session;
use crate::tabs::{TabEvent, TabId};

const SESSION_QUEUE_DEPTH: usize = 32;

/// Query string of the socket URL
#[derive(Debug, Clone, Deserialize)]
pub struct TabQuery {
    pub url: String,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

fn visible_by_default() -> bool {
    true
}

/// Messages a tab sends up its socket
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TabMessage {
    Visibility { visible: bool },
}

/// Serve one tab until its socket closes
pub async fn handle_socket(
    socket: WebSocket,
    service: Arc<BlockingService>,
    tab_id: TabId,
    query: TabQuery,
    checkpoint_every: Duration,
) {
    info!("Tab {} connected at {}", tab_id, query.url);

    let mut hub_events = service.tabs().register(tab_id, &query.url).await;
    let (visibility_tx, visibility_rx) = watch::channel(query.visible);
    let (session_tx, session_rx) = mpsc::channel::<TabEvent>(SESSION_QUEUE_DEPTH);

    let session = tokio::spawn(run_session(
        service.clone(),
        tab_id,
        query.url.clone(),
        visibility_rx,
        session_rx,
        checkpoint_every,
    ));

    let (mut sink, mut stream) = socket.split();

    // hub -> session and socket
    let forward = tokio::spawn(async move {
        while let Some(event) = hub_events.recv().await {
            // the session may already be over, the socket still wants the event
            let _ = session_tx.send(event.clone()).await;

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not encode event for tab {}: {}", tab_id, e);
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                debug!("Socket of tab {} closed", tab_id);
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => {
                let Ok(text) = msg.to_str() else {
                    continue;
                };
                match serde_json::from_str::<TabMessage>(text) {
                    Ok(TabMessage::Visibility { visible }) => {
                        let _ = visibility_tx.send(visible);
                    }
                    Err(e) => debug!("Ignoring message from tab {}: {}", tab_id, e),
                }
            }
            Err(e) => {
                debug!("Receive error on tab {}: {}", tab_id, e);
                break;
            }
        }
    }

    // page unload: the session flushes what is left and stops
    drop(visibility_tx);
    match session.await {
        Ok(state) => debug!("Session of tab {} finished {:?}", tab_id, state),
        Err(e) => warn!("Session of tab {} ended abnormally: {}", tab_id, e),
    }

    forward.abort();
    let _ = forward.await;
    service.tabs().release(tab_id).await;
    info!("Tab {} disconnected", tab_id);
}
