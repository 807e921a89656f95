// Engine root: a single value owned by the runtime that wires the store,
// repositories, matching tasks, risk loop, funding loop, liquidation
// service, and fan-out plane together. No process-wide state; every timer
// is a task torn down by the shutdown watch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::funding::FundingEngine;
use crate::liquidation::LiquidationService;
use crate::matching::{MatchingEngine, MatchingHandle};
use crate::position::PositionManager;
use crate::repo::Repositories;
use crate::risk::{RiskCandidate, RiskEngine};
use crate::settlement::{Journal, SettlementService};
use crate::store::{LockManager, SharedStore};
use crate::types::{DepositObserved, DepthSnapshot, Order, Trade, TradeType};
use crate::ws::messages::WsEvent;
use crate::ws::{pusher::Pusher, spawn_router, Registry};

const EVENT_BUS_CAPACITY: usize = 4096;
const CANDIDATE_BUFFER: usize = 1024;
/// Cleanup cadence for leaked order-margin records.
const MARGIN_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Latest book price per token, written by each matching task and read by
/// the risk and funding loops without a store round-trip.
#[derive(Default)]
pub struct PriceBoard {
    prices: RwLock<HashMap<String, i128>>,
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: &str, price: i128) {
        if price > 0 {
            let mut prices = self.prices.write().expect("price board poisoned");
            prices.insert(token.to_string(), price);
        }
    }

    pub fn get(&self, token: &str) -> i128 {
        let prices = self.prices.read().expect("price board poisoned");
        prices.get(token).copied().unwrap_or(0)
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub repos: Repositories,
    pub locks: LockManager,
    pub events: broadcast::Sender<WsEvent>,
    pub prices: Arc<PriceBoard>,
    pub registry: Arc<Registry>,
    pub positions: PositionManager,
    pub journal: Journal,
    pub settlement: SettlementService,
    matching: HashMap<String, MatchingHandle>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Build every component and start all periodic tasks.
    pub async fn start(config: EngineConfig, store: SharedStore) -> EngineResult<Arc<Engine>> {
        let repos = Repositories::new(store.clone(), &config.key_prefix);
        let locks = LockManager::new(store, config.lock_ttl, config.lock_retries);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let prices = Arc::new(PriceBoard::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let journal = Journal::new(repos.clone(), events.clone());
        let positions = PositionManager::new(
            repos.clone(),
            journal.clone(),
            locks.clone(),
            events.clone(),
            &config,
        );
        let settlement = SettlementService::new(repos.clone(), journal.clone(), locks.clone());

        // Seed per-token stats so funding schedules exist from the start.
        for token in &config.tokens {
            let mut stats = repos.market_stats.get(token).await?;
            if stats.next_funding_time <= Utc::now() {
                stats.next_funding_time = Utc::now()
                    + chrono::Duration::from_std(config.funding_interval)
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                stats.funding_rate = config.funding_rate;
                repos.market_stats.save(&stats).await?;
            }
        }

        let mut matching = HashMap::new();
        for token in &config.tokens {
            let handle = MatchingEngine::spawn(
                token,
                repos.clone(),
                positions.clone(),
                locks.clone(),
                events.clone(),
                prices.clone(),
                shutdown_rx.clone(),
                &config,
            );
            matching.insert(token.clone(), handle);
        }

        let (candidates_tx, candidates_rx) = mpsc::channel::<RiskCandidate>(CANDIDATE_BUFFER);
        RiskEngine::spawn(
            repos.clone(),
            events.clone(),
            prices.clone(),
            candidates_tx,
            shutdown_rx.clone(),
            &config,
        );
        LiquidationService::spawn(
            repos.clone(),
            positions.clone(),
            journal.clone(),
            locks.clone(),
            events.clone(),
            prices.clone(),
            matching.clone(),
            candidates_rx,
            shutdown_rx.clone(),
            &config,
        );
        FundingEngine::spawn(
            repos.clone(),
            journal.clone(),
            locks.clone(),
            events.clone(),
            prices.clone(),
            config.tokens.clone(),
            shutdown_rx.clone(),
            &config,
        );

        let registry = Arc::new(Registry::new());
        spawn_router(registry.clone(), events.subscribe());
        Pusher::spawn(
            registry.clone(),
            repos.clone(),
            matching.clone(),
            prices.clone(),
            shutdown_rx.clone(),
            &config,
        );

        Self::spawn_margin_sweeper(repos.clone(), shutdown_rx);

        info!(
            "engine started with {} tokens, prefix '{}'",
            config.tokens.len(),
            config.key_prefix
        );
        Ok(Arc::new(Engine {
            config,
            repos,
            locks,
            events,
            prices,
            registry,
            positions,
            journal,
            settlement,
            matching,
            shutdown,
        }))
    }

    fn spawn_margin_sweeper(repos: Repositories, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MARGIN_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match repos.order_margins.sweep().await {
                            Ok(0) => {}
                            Ok(removed) => info!("order-margin sweep reaped {} records", removed),
                            Err(e) => error!("order-margin sweep failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    pub fn handle(&self, token: &str) -> EngineResult<&MatchingHandle> {
        self.matching
            .get(token)
            .ok_or_else(|| EngineError::Validation(format!("unsupported token {}", token)))
    }

    pub async fn submit_order(&self, order: Order) -> EngineResult<Order> {
        self.handle(&order.token)?.submit_order(order).await
    }

    pub async fn cancel_order(&self, token: &str, order_id: Uuid, trader: &str) -> EngineResult<bool> {
        self.handle(token)?.cancel_order(order_id, trader).await
    }

    pub async fn depth(&self, token: &str, levels: usize) -> EngineResult<DepthSnapshot> {
        self.handle(token)?.depth(levels).await
    }

    pub async fn apply_deposit(&self, event: &DepositObserved) -> EngineResult<()> {
        self.settlement.apply_deposit(event).await
    }

    /// Spot-side interface: record an AMM trade on a token so its history,
    /// stats, and candles stay live even without book activity.
    pub async fn record_amm_trade(&self, token: &str, price: i128, size: i128) -> EngineResult<Trade> {
        if price <= 0 || size <= 0 {
            return Err(EngineError::Validation("amm trade needs positive price and size".into()));
        }
        let mut stats = self.repos.market_stats.get(token).await?;
        stats.last_price = price;
        if stats.index_price == 0 {
            stats.index_price = price;
        }
        if stats.high_24h < price {
            stats.high_24h = price;
        }
        if stats.low_24h == 0 || stats.low_24h > price {
            stats.low_24h = price;
        }
        stats.volume_24h += size;
        stats.updated_at = Utc::now();
        self.repos.market_stats.save(&stats).await?;
        self.prices.set(token, price);

        let trade = Trade {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            token: token.to_string(),
            trader: String::new(),
            is_long: true,
            is_maker: false,
            size,
            price,
            fee: 0,
            realized_pnl: 0,
            trade_type: TradeType::Normal,
            created_at: Utc::now(),
        };
        self.repos.trades.save(&trade).await?;
        let _ = self.events.send(WsEvent::Trade {
            token: token.to_string(),
            trade: trade.clone(),
        });
        Ok(trade)
    }

    /// Quiesce every task: matching loops drain their channels, timers stop,
    /// the router finishes with the bus.
    pub fn shutdown(&self) {
        info!("engine shutdown requested");
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{PRICE_SCALE, SIZE_SCALE};
    use crate::store::MemoryStore;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";

    async fn start_engine() -> Arc<Engine> {
        let mut config = EngineConfig::default();
        config.tokens = vec![TOKEN.to_string()];
        let store: SharedStore = Arc::new(MemoryStore::new());
        Engine::start(config, store).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn amm_trade_lands_in_history_and_moves_stats() {
        let engine = start_engine().await;

        let first = engine
            .record_amm_trade(TOKEN, 2 * PRICE_SCALE, SIZE_SCALE)
            .await
            .unwrap();
        let second = engine
            .record_amm_trade(TOKEN, 3 * PRICE_SCALE, 2 * SIZE_SCALE)
            .await
            .unwrap();

        // Both trades are persisted and readable from the per-token index.
        let history = engine.repos.trades.recent_for_token(TOKEN, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|t| t.id == first.id && t.price == 2 * PRICE_SCALE));
        assert!(history.iter().any(|t| t.id == second.id && t.size == 2 * SIZE_SCALE));
        assert_eq!(
            engine.repos.trades.get(&first.id).await.unwrap().unwrap().price,
            2 * PRICE_SCALE
        );

        // Stats and the price board follow the latest print.
        let stats = engine.repos.market_stats.get(TOKEN).await.unwrap();
        assert_eq!(stats.last_price, 3 * PRICE_SCALE);
        assert_eq!(stats.high_24h, 3 * PRICE_SCALE);
        assert_eq!(stats.low_24h, 2 * PRICE_SCALE);
        assert_eq!(stats.volume_24h, 3 * SIZE_SCALE);
        assert_eq!(engine.prices.get(TOKEN), 3 * PRICE_SCALE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn amm_trade_rejects_non_positive_inputs() {
        let engine = start_engine().await;
        assert!(engine.record_amm_trade(TOKEN, 0, SIZE_SCALE).await.is_err());
        assert!(engine.record_amm_trade(TOKEN, PRICE_SCALE, -1).await.is_err());
        assert!(engine
            .repos
            .trades
            .recent_for_token(TOKEN, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
