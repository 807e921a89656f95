// Central 1 Hz pusher: market_data and orderbook snapshots for every token
// someone subscribes to, a per-minute kline state machine fed by each tick's
// current price, and funding_rate frames every five seconds. Frames go
// straight through the registry so unsubscribed tokens cost nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use super::messages::{KlineBar, WsEvent};
use super::Registry;
use crate::config::EngineConfig;
use crate::engine::PriceBoard;
use crate::error::EngineResult;
use crate::fixed::PRICE_SCALE;
use crate::matching::MatchingHandle;
use crate::repo::Repositories;

pub struct Pusher {
    registry: Arc<Registry>,
    repos: Repositories,
    matching: HashMap<String, MatchingHandle>,
    prices: Arc<PriceBoard>,
    shutdown: watch::Receiver<bool>,
    push_interval: std::time::Duration,
    funding_interval: std::time::Duration,
    klines: HashMap<String, KlineBar>,
    volume_seen: HashMap<String, i128>,
}

impl Pusher {
    pub fn spawn(
        registry: Arc<Registry>,
        repos: Repositories,
        matching: HashMap<String, MatchingHandle>,
        prices: Arc<PriceBoard>,
        shutdown: watch::Receiver<bool>,
        config: &EngineConfig,
    ) {
        let mut pusher = Pusher {
            registry,
            repos,
            matching,
            prices,
            shutdown,
            push_interval: config.ws_push_interval,
            funding_interval: config.ws_funding_interval,
            klines: HashMap::new(),
            volume_seen: HashMap::new(),
        };
        tokio::spawn(async move {
            pusher.run().await;
        });
    }

    async fn run(&mut self) {
        info!("ws pusher started");
        let mut push = tokio::time::interval(self.push_interval);
        push.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut funding = tokio::time::interval(self.funding_interval);
        funding.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = push.tick() => {
                    if let Err(e) = self.push_market_data().await {
                        error!("market-data push failed: {}", e);
                    }
                }
                _ = funding.tick() => {
                    if let Err(e) = self.push_funding().await {
                        error!("funding push failed: {}", e);
                    }
                }
            }
        }
        info!("ws pusher stopped");
    }

    async fn push_market_data(&mut self) -> EngineResult<()> {
        let tokens = self.registry.subscribed_tokens();
        for token in tokens {
            let stats = self.repos.market_stats.get(&token).await?;
            let volume_total = stats.volume_24h;
            self.registry.route(&WsEvent::MarketData {
                token: token.clone(),
                stats,
            });

            if let Some(handle) = self.matching.get(&token) {
                if let Ok(depth) = handle.depth(20).await {
                    self.registry.route(&WsEvent::Orderbook {
                        token: token.clone(),
                        depth,
                    });
                }
            }

            let price = self.prices.get(&token);
            if price > 0 {
                self.advance_kline(&token, price, volume_total);
            }
        }
        Ok(())
    }

    /// Per-minute bar: open = previous close on the first tick of a minute,
    /// high/low track every tick, close follows the last tick. The finished
    /// bar is broadcast exactly once on rollover.
    fn advance_kline(&mut self, token: &str, price: i128, volume_total: i128) {
        let price_f = price as f64 / PRICE_SCALE as f64;
        let minute_ms = (Utc::now().timestamp_millis() / 60_000) * 60_000;

        let seen = self.volume_seen.entry(token.to_string()).or_insert(volume_total);
        let volume_delta = ((volume_total - *seen).max(0)) as f64 / PRICE_SCALE as f64;
        *seen = volume_total;

        match self.klines.get_mut(token) {
            Some(bar) if bar.minute_start_ms == minute_ms => {
                bar.high = bar.high.max(price_f);
                bar.low = bar.low.min(price_f);
                bar.close = price_f;
                bar.volume += volume_delta;
            }
            Some(bar) => {
                let finished = bar.clone();
                self.registry.route(&WsEvent::Kline {
                    token: token.to_string(),
                    bar: finished.clone(),
                });
                *bar = KlineBar {
                    minute_start_ms: minute_ms,
                    open: finished.close,
                    high: price_f.max(finished.close),
                    low: price_f.min(finished.close),
                    close: price_f,
                    volume: volume_delta,
                };
            }
            None => {
                self.klines.insert(
                    token.to_string(),
                    KlineBar {
                        minute_start_ms: minute_ms,
                        open: price_f,
                        high: price_f,
                        low: price_f,
                        close: price_f,
                        volume: volume_delta,
                    },
                );
            }
        }
    }

    async fn push_funding(&mut self) -> EngineResult<()> {
        for token in self.registry.subscribed_tokens() {
            let stats = self.repos.market_stats.get(&token).await?;
            self.registry.route(&WsEvent::FundingRate { token, stats });
        }
        Ok(())
    }
}
