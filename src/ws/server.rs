// WebSocket ingress: one reader and one writer task per client, a bounded
// outbound queue between the router and the socket, and the subscribe /
// query message protocol.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{balance_frame, error_frame, pong_frame, position_frame, WsEvent};
use crate::types::canonical_address;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    trader: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| client_connection(socket, state)).into_response()
}

async fn client_connection(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.engine.config.ws_outbound_queue);
    state.engine.registry.register(id, outbound_tx.clone());

    let (mut sink, mut stream) = socket.split();

    // Writer: the only task touching the sink; serialized per client.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Reader: client commands mutate this connection's subscriptions.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let reply = handle_client_message(&state, &id, &text).await;
                for frame in reply {
                    if outbound_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!("ws client {} sent close", id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("ws read error for {}: {}", id, e);
                break;
            }
        }
    }

    state.engine.registry.unregister(&id);
    writer.abort();
    info!("ws connection {} closed", id);
}

/// One request, zero or more reply frames. Every subscribe answers with a
/// snapshot; malformed input answers with an error frame.
async fn handle_client_message(state: &AppState, client: &Uuid, text: &str) -> Vec<String> {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let message = match parsed {
        Ok(m) => m,
        Err(e) => return vec![error_frame(&format!("malformed message: {}", e)).to_string()],
    };

    match message.kind.as_str() {
        "ping" => vec![pong_frame().to_string()],

        "subscribe" => {
            let Some(token) = canonical_token(&message) else {
                return vec![error_frame("subscribe requires a valid token").to_string()];
            };
            state.engine.registry.update(client, |subs| {
                subs.tokens.insert(token.clone());
            });
            token_snapshot(state, &token).await
        }
        "unsubscribe" => {
            let Some(token) = canonical_token(&message) else {
                return vec![error_frame("unsubscribe requires a valid token").to_string()];
            };
            state.engine.registry.update(client, |subs| {
                subs.tokens.remove(&token);
            });
            Vec::new()
        }

        "subscribe_trader" => {
            let Some(trader) = message.trader.as_deref().and_then(canonical_address) else {
                return vec![error_frame("subscribe_trader requires a valid trader").to_string()];
            };
            state.engine.registry.update(client, |subs| {
                subs.trader = Some(trader.clone());
            });
            trader_snapshot(state, &trader).await
        }
        "unsubscribe_trader" => {
            state.engine.registry.update(client, |subs| {
                subs.trader = None;
            });
            Vec::new()
        }

        "subscribe_risk" => {
            state.engine.registry.update(client, |subs| {
                subs.risk = true;
            });
            Vec::new()
        }
        "unsubscribe_risk" => {
            state.engine.registry.update(client, |subs| {
                subs.risk = false;
            });
            Vec::new()
        }

        "get_orderbook" => {
            let Some(token) = canonical_token(&message) else {
                return vec![error_frame("get_orderbook requires a valid token").to_string()];
            };
            match state.engine.depth(&token, 20).await {
                Ok(depth) => vec![WsEvent::Orderbook { token, depth }.to_frame().to_string()],
                Err(e) => vec![error_frame(&e.to_string()).to_string()],
            }
        }
        "get_positions" => {
            let Some(trader) = message.trader.as_deref().and_then(canonical_address) else {
                return vec![error_frame("get_positions requires a valid trader").to_string()];
            };
            match state.engine.repos.positions.open_for_user(&trader).await {
                Ok(positions) => {
                    let frames = positions.iter().map(position_frame).collect::<Vec<_>>();
                    vec![json!({
                        "type": "position",
                        "trader": trader,
                        "data": frames,
                        "timestamp": chrono::Utc::now().timestamp_millis(),
                    })
                    .to_string()]
                }
                Err(e) => vec![error_frame(&e.to_string()).to_string()],
            }
        }
        "get_balance" => {
            let Some(trader) = message.trader.as_deref().and_then(canonical_address) else {
                return vec![error_frame("get_balance requires a valid trader").to_string()];
            };
            match state.engine.repos.balances.get(&trader).await {
                Ok(balance) => vec![json!({
                    "type": "balance",
                    "trader": trader,
                    "data": balance_frame(&balance),
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                })
                .to_string()],
                Err(e) => vec![error_frame(&e.to_string()).to_string()],
            }
        }
        "get_funding" => {
            let Some(token) = canonical_token(&message) else {
                return vec![error_frame("get_funding requires a valid token").to_string()];
            };
            match state.engine.repos.market_stats.get(&token).await {
                Ok(stats) => vec![WsEvent::FundingRate { token, stats }.to_frame().to_string()],
                Err(e) => vec![error_frame(&e.to_string()).to_string()],
            }
        }

        other => vec![error_frame(&format!("unknown message type {}", other)).to_string()],
    }
}

fn canonical_token(message: &ClientMessage) -> Option<String> {
    let raw = message.token.as_deref().or(message.channel.as_deref())?;
    canonical_address(raw)
}

/// Snapshot sent on token subscribe: one market_data and one orderbook
/// frame.
async fn token_snapshot(state: &AppState, token: &str) -> Vec<String> {
    let mut frames = Vec::new();
    if let Ok(stats) = state.engine.repos.market_stats.get(token).await {
        frames.push(
            WsEvent::MarketData {
                token: token.to_string(),
                stats,
            }
            .to_frame()
            .to_string(),
        );
    }
    if let Ok(depth) = state.engine.depth(token, 20).await {
        frames.push(
            WsEvent::Orderbook {
                token: token.to_string(),
                depth,
            }
            .to_frame()
            .to_string(),
        );
    }
    frames
}

/// Snapshot sent on trader subscribe: balance, open positions, open orders.
async fn trader_snapshot(state: &AppState, trader: &str) -> Vec<String> {
    let mut frames = Vec::new();
    if let Ok(balance) = state.engine.repos.balances.get(trader).await {
        frames.push(
            WsEvent::Balance {
                trader: trader.to_string(),
                balance,
            }
            .to_frame()
            .to_string(),
        );
    }
    if let Ok(positions) = state.engine.repos.positions.open_for_user(trader).await {
        for position in positions {
            frames.push(
                WsEvent::Position {
                    trader: trader.to_string(),
                    position,
                }
                .to_frame()
                .to_string(),
            );
        }
    }
    frames
}

pub async fn health_check() -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "service": "perp-engine",
        "timestamp": chrono::Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_parses_known_shapes() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","channel":"orderbook","token":"0xAbC"}"#)
                .unwrap();
        assert_eq!(m.kind, "subscribe");
        assert_eq!(m.token.as_deref(), Some("0xAbC"));

        let m: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(m.kind, "ping");
        assert!(m.token.is_none());
    }
}
