use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, warn};

use auto_react::EventBroadcaster;

use crate::AppState;
use crate::metrics::ServerMetrics;

/// Live event feed: the retained history first, then every new event
pub async fn logs_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.events.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| handle_feed(socket, events, metrics))
}

async fn handle_feed(
    socket: WebSocket,
    events: Arc<EventBroadcaster>,
    metrics: Arc<ServerMetrics>,
) {
    metrics.feed_opened();
    let mut observer = events.attach().await;
    let observer_id = observer.id();
    debug!("Feed client attached as {:?}", observer_id);

    let (mut ws_write, mut ws_read) = socket.split();

    loop {
        tokio::select! {
            message = observer.recv() => {
                // None means the broadcaster dropped us for falling behind
                let Some(message) = message else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode feed message: {}", e);
                        continue;
                    }
                };
                if ws_write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                metrics.feed_message_sent();
            }

            incoming = ws_read.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // The feed is read-only
                Some(Ok(_)) => {}
            },
        }
    }

    events.detach(observer_id).await;
    metrics.feed_closed();
    debug!("Feed client {:?} detached", observer_id);
}
