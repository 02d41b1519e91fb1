//! WebSocket subscription channel.
//!
//! The only transport surface the core owns: clients open a persistent
//! socket, send `{subscribe}` messages and receive snapshot / time-update
//! frames.  `{ping}` is answered with `{pong}`; optional `{bid}` messages
//! delegate to the bid engine and answer with `{bid_success}` /
//! `{bid_error}`.  The server pings every heartbeat interval and dead
//! sockets are garbage-collected through their closed channels.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::{sync::mpsc, task};
use tracing::{debug, error};
use uuid::Uuid;

use gavel_common::types::{Amount, AuctionId, UserId};

use crate::{bid_engine::BidEngine, fanout::FanoutRegistry, PlaceBidRequest};

/* -------------------------------------------------------------------------- */
/*                                  Protocol                                  */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        auction_id: AuctionId,
        user_id: Option<i64>,
    },
    Ping,
    Bid {
        auction_id: AuctionId,
        user_id: i64,
        amount: Amount,
        idempotency_key: String,
        #[serde(default)]
        add_to_existing: bool,
    },
}

/* -------------------------------------------------------------------------- */
/*                                   Router                                   */
/* -------------------------------------------------------------------------- */

pub struct GatewayState {
    pub engine: Arc<BidEngine>,
    pub registry: Arc<FanoutRegistry>,
    pub heartbeat: Duration,
}

/// Build the axum router exposing `/ws` and a liveness probe.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(Extension(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": chrono::Utc::now() }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move {
        if let Err(err) = handle_socket(state, socket).await {
            debug!(error = ?err, "websocket session ended with error");
        }
    })
}

/* -------------------------------------------------------------------------- */
/*                               Socket plumbing                              */
/* -------------------------------------------------------------------------- */

async fn handle_socket(state: Arc<GatewayState>, socket: WebSocket) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All outbound frames funnel through one channel so the sink has a
    // single owner.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Send-loop: outbound frames plus the server heartbeat.
    let heartbeat = state.heartbeat;
    let send_loop = task::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(frame).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Subscriptions this socket holds; released on close.
    let mut subscriptions: Vec<(AuctionId, Uuid)> = Vec::new();

    // A live client answers the heartbeat, so *some* frame arrives every
    // interval. Three missed heartbeats and the client is gone.
    let idle_cutoff = heartbeat * 3;

    loop {
        let msg = match tokio::time::timeout(idle_cutoff, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            // Stream closed or protocol error.
            Ok(_) => break,
            Err(_) => {
                debug!("client missed heartbeats; dropping idle socket");
                break;
            }
        };
        match msg {
            Message::Text(raw) => {
                let parsed: ClientMessage = match serde_json::from_str(&raw) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        let _ = out_tx.send(Message::Text(
                            json!({ "type": "error", "error": "VALIDATION", "message": err.to_string() })
                                .to_string(),
                        ));
                        continue;
                    }
                };
                handle_message(&state, &out_tx, &mut subscriptions, parsed);
            }
            Message::Ping(payload) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            // Heartbeat reply; receipt alone resets the idle window.
            Message::Pong(_) => {}
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (auction_id, id) in subscriptions {
        state.registry.unsubscribe(auction_id, id);
    }
    drop(out_tx);
    let _ = send_loop.await;
    Ok(())
}

fn handle_message(
    state: &Arc<GatewayState>,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &mut Vec<(AuctionId, Uuid)>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Subscribe { auction_id, user_id } => {
            let (id, mut rx) = state
                .registry
                .subscribe(auction_id, user_id.map(UserId));
            subscriptions.push((auction_id, id));

            // Bridge registry frames onto this socket. The task ends when
            // the subscription is dropped or the socket goes away.
            let out_tx = out_tx.clone();
            task::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if out_tx.send(Message::Text(frame)).is_err() {
                        break;
                    }
                }
            });
        }
        ClientMessage::Ping => {
            let _ = out_tx.send(Message::Text(json!({ "type": "pong" }).to_string()));
        }
        ClientMessage::Bid { auction_id, user_id, amount, idempotency_key, add_to_existing } => {
            let result = state.engine.place_bid(PlaceBidRequest {
                auction_id,
                user_id: UserId(user_id),
                amount,
                idempotency_key,
                add_to_existing,
            });
            let frame = match result {
                Ok(response) => match serde_json::to_value(&response) {
                    Ok(mut value) => {
                        if let Some(object) = value.as_object_mut() {
                            object.insert("type".into(), json!("bid_success"));
                        }
                        value
                    }
                    Err(err) => {
                        error!(error = %err, "bid response serialization failed");
                        json!({ "type": "bid_error", "error": "INTERNAL" })
                    }
                },
                Err(err) => {
                    let mut envelope = err.envelope();
                    if let Some(object) = envelope.as_object_mut() {
                        object.insert("type".into(), json!("bid_error"));
                    }
                    envelope
                }
            };
            let _ = out_tx.send(Message::Text(frame.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize() {
        let subscribe: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","auction_id":"6f9d31f0-8c7a-4b9e-9f59-0a2b1c3d4e5f","user_id":7}"#,
        )
        .unwrap();
        assert!(matches!(subscribe, ClientMessage::Subscribe { user_id: Some(7), .. }));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let bid: ClientMessage = serde_json::from_str(
            r#"{"type":"bid","auction_id":"6f9d31f0-8c7a-4b9e-9f59-0a2b1c3d4e5f","user_id":7,"amount":200,"idempotency_key":"k"}"#,
        )
        .unwrap();
        assert!(matches!(
            bid,
            ClientMessage::Bid { amount: 200, add_to_existing: false, .. }
        ));
    }

    #[test]
    fn fractional_amounts_are_rejected_at_the_boundary() {
        let err = serde_json::from_str::<ClientMessage>(
            r#"{"type":"bid","auction_id":"6f9d31f0-8c7a-4b9e-9f59-0a2b1c3d4e5f","user_id":7,"amount":200.5,"idempotency_key":"k"}"#,
        );
        assert!(err.is_err());
    }
}
