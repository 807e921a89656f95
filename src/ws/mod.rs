// WebSocket fan-out plane: a subscription registry shared by every client
// connection, a router task draining the engine's broadcast bus into
// per-client bounded queues, and the 1 Hz pusher. Slow clients overflow
// their queue and are dropped rather than stalling a broadcast batch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod messages;
pub mod pusher;
pub mod server;

use messages::WsEvent;

/// What one connected client wants to hear.
#[derive(Debug, Default, Clone)]
pub struct Subscriptions {
    pub tokens: HashSet<String>,
    pub trader: Option<String>,
    pub risk: bool,
}

struct ClientState {
    outbound: mpsc::Sender<String>,
    subs: Subscriptions,
}

/// Read-mostly subscription map; broadcasts snapshot the membership before
/// sending so a disconnect mid-batch never fails the batch.
#[derive(Default)]
pub struct Registry {
    clients: Mutex<HashMap<Uuid, ClientState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, outbound: mpsc::Sender<String>) {
        let mut clients = self.clients.lock().expect("registry poisoned");
        clients.insert(
            id,
            ClientState {
                outbound,
                subs: Subscriptions::default(),
            },
        );
        info!("ws client {} connected ({} total)", id, clients.len());
    }

    pub fn unregister(&self, id: &Uuid) {
        let mut clients = self.clients.lock().expect("registry poisoned");
        if clients.remove(id).is_some() {
            info!("ws client {} disconnected ({} left)", id, clients.len());
        }
    }

    pub fn update<F: FnOnce(&mut Subscriptions)>(&self, id: &Uuid, mutate: F) {
        let mut clients = self.clients.lock().expect("registry poisoned");
        if let Some(state) = clients.get_mut(id) {
            mutate(&mut state.subs);
        }
    }

    pub fn subscriptions(&self, id: &Uuid) -> Option<Subscriptions> {
        let clients = self.clients.lock().expect("registry poisoned");
        clients.get(id).map(|state| state.subs.clone())
    }

    /// Tokens at least one client subscribes to; drives the 1 Hz pusher.
    pub fn subscribed_tokens(&self) -> HashSet<String> {
        let clients = self.clients.lock().expect("registry poisoned");
        clients
            .values()
            .flat_map(|state| state.subs.tokens.iter().cloned())
            .collect()
    }

    /// Route one event to every matching client. Queue overflow drops the
    /// client; a closed queue is skipped and reaped.
    pub fn route(&self, event: &WsEvent) {
        let frame = event.to_frame().to_string();
        let targets: Vec<(Uuid, mpsc::Sender<String>)> = {
            let clients = self.clients.lock().expect("registry poisoned");
            clients
                .iter()
                .filter(|(_, state)| Self::matches(&state.subs, event))
                .map(|(id, state)| (*id, state.outbound.clone()))
                .collect()
        };

        let mut dropped = Vec::new();
        for (id, outbound) in targets {
            match outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("ws client {} outbound queue full; dropping client", id);
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("ws client {} already closed", id);
                    dropped.push(id);
                }
            }
        }
        for id in dropped {
            self.unregister(&id);
        }
    }

    fn matches(subs: &Subscriptions, event: &WsEvent) -> bool {
        if let Some(token) = event.token() {
            return subs.tokens.contains(token);
        }
        if let Some(trader) = event.trader() {
            let trader_match = subs.trader.as_deref() == Some(trader);
            if event.is_risk_scoped() {
                return trader_match && subs.risk;
            }
            return trader_match;
        }
        false
    }
}

/// Drain the engine broadcast bus into the registry until the bus closes.
pub fn spawn_router(
    registry: std::sync::Arc<Registry>,
    mut events: broadcast::Receiver<WsEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => registry.route(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("ws router lagged; {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("ws router stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests_support::sample_position;

    fn risk_event() -> WsEvent {
        let p = sample_position();
        WsEvent::Risk {
            trader: p.trader.clone(),
            position: p,
        }
    }

    #[tokio::test]
    async fn routes_by_token_subscription() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(id, tx);
        registry.update(&id, |subs| {
            subs.tokens.insert("0xt".to_string());
        });

        let depth = crate::types::DepthSnapshot {
            token: "0xt".into(),
            bids: vec![],
            asks: vec![],
            last_price: 0,
            timestamp: chrono::Utc::now(),
        };
        registry.route(&WsEvent::Orderbook {
            token: "0xt".into(),
            depth: depth.clone(),
        });
        assert!(rx.try_recv().is_ok());

        // Different token: nothing delivered.
        registry.route(&WsEvent::Orderbook {
            token: "0xother".into(),
            depth,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn risk_frames_require_risk_flag() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register(id, tx);
        let trader = sample_position().trader;
        registry.update(&id, |subs| {
            subs.trader = Some(trader);
        });

        registry.route(&risk_event());
        assert!(rx.try_recv().is_err());

        registry.update(&id, |subs| {
            subs.risk = true;
        });
        registry.route(&risk_event());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn overflowing_client_is_dropped() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(id, tx);
        registry.update(&id, |subs| {
            subs.tokens.insert("0xt".to_string());
        });

        let event = WsEvent::Orderbook {
            token: "0xt".into(),
            depth: crate::types::DepthSnapshot {
                token: "0xt".into(),
                bids: vec![],
                asks: vec![],
                last_price: 0,
                timestamp: chrono::Utc::now(),
            },
        };
        registry.route(&event); // fills the queue
        registry.route(&event); // overflow drops the client
        assert!(registry.subscriptions(&id).is_none());
    }
}
