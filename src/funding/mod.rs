// Funding settlement: every five minutes each open position pays a fixed
// one-basis-point fee on its collateral into the insurance fund. A
// ten-second scheduler fires per-token settlements whose next-time has
// passed; the settlement itself runs under the token's funding lease so it
// excludes the risk loop during the mutation.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::config::{EngineConfig, FundingMarginCheck};
use crate::engine::PriceBoard;
use crate::error::EngineResult;
use crate::fixed::{mul_div, notional, RATE_SCALE};
use crate::position::{initial_margin_rate, recompute};
use crate::repo::Repositories;
use crate::settlement::Journal;
use crate::store::LockManager;
use crate::types::{Position, SettlementType};
use crate::ws::messages::WsEvent;

pub struct FundingEngine {
    repos: Repositories,
    journal: Journal,
    locks: LockManager,
    events: broadcast::Sender<WsEvent>,
    prices: Arc<PriceBoard>,
    tokens: Vec<String>,
    shutdown: watch::Receiver<bool>,
    interval: chrono::Duration,
    poll: std::time::Duration,
    rate: i128,
    base_mmr: i128,
    margin_check: FundingMarginCheck,
    insurance_account: String,
}

impl FundingEngine {
    pub fn spawn(
        repos: Repositories,
        journal: Journal,
        locks: LockManager,
        events: broadcast::Sender<WsEvent>,
        prices: Arc<PriceBoard>,
        tokens: Vec<String>,
        shutdown: watch::Receiver<bool>,
        config: &EngineConfig,
    ) {
        let mut engine = FundingEngine {
            repos,
            journal,
            locks,
            events,
            prices,
            tokens,
            shutdown,
            interval: ChronoDuration::from_std(config.funding_interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(5)),
            poll: config.funding_poll,
            rate: config.funding_rate,
            base_mmr: config.base_mmr,
            margin_check: config.funding_margin_check,
            insurance_account: config.insurance_account.clone(),
        };
        tokio::spawn(async move {
            engine.run().await;
        });
    }

    async fn run(&mut self) {
        info!(
            "funding engine started ({}s interval, rate {}bp)",
            self.interval.num_seconds(),
            self.rate
        );
        let mut poll = tokio::time::interval(self.poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    for token in self.tokens.clone() {
                        if let Err(e) = self.settle_if_due(&token).await {
                            error!("funding settlement for {} failed: {}", token, e);
                        }
                    }
                }
            }
        }
        info!("funding engine stopped");
    }

    async fn settle_if_due(&mut self, token: &str) -> EngineResult<()> {
        let stats = self.repos.market_stats.get(token).await?;
        if stats.next_funding_time > Utc::now() {
            return Ok(());
        }
        self.settle(token).await
    }

    /// One funding settlement for a token. Both sides pay; the flow lands
    /// in the insurance fund.
    pub async fn settle(&mut self, token: &str) -> EngineResult<()> {
        let lock_key = self.repos.keys.lock(&format!("funding:{}", token));
        let guard = match self.locks.try_acquire(&lock_key).await? {
            Some(guard) => guard,
            None => {
                warn!("funding lease for {} contended; skipping this pass", token);
                return Ok(());
            }
        };

        let positions = self.repos.positions.open_for_token(token).await?;
        let mut total_collected: i128 = 0;
        for mut position in positions {
            match self.charge_position(&mut position).await {
                Ok(amount) => total_collected += amount,
                Err(e) => error!(
                    "funding charge failed for position {}: {}",
                    position.id, e
                ),
            }
        }

        if total_collected > 0 {
            self.credit_insurance(token, total_collected).await?;
        }

        // Monotone: the next settlement time advances by exactly one
        // interval per settlement.
        let mut stats = self.repos.market_stats.get(token).await?;
        stats.funding_rate = self.rate;
        stats.next_funding_time = stats.next_funding_time + self.interval;
        if stats.next_funding_time <= Utc::now() {
            stats.next_funding_time = Utc::now() + self.interval;
        }
        stats.updated_at = Utc::now();
        self.repos.market_stats.save(&stats).await?;
        let _ = self.events.send(WsEvent::FundingRate {
            token: token.to_string(),
            stats,
        });

        guard.release().await;
        info!(
            "funding settled on {}: collected {} across positions",
            token, total_collected
        );
        Ok(())
    }

    /// Deduct one funding fee from a position's collateral, journal it, and
    /// re-derive the liquidation price from the smaller collateral.
    async fn charge_position(&self, position: &mut Position) -> EngineResult<i128> {
        let amount = mul_div(position.collateral, self.rate, RATE_SCALE);
        if amount <= 0 {
            return Ok(0);
        }

        position.collateral -= amount;
        position.funding_fee -= amount;
        position.funding_index += 1;
        let board = self.prices.get(&position.token);
        let mark = if board > 0 {
            board
        } else if position.mark_price > 0 {
            position.mark_price
        } else {
            position.avg_entry_price
        };
        recompute(position, mark, self.base_mmr);
        if self.margin_breached(position) {
            position.is_liquidatable = true;
        }
        self.repos.positions.save(position).await?;

        let balance_key = self.repos.keys.lock(&format!("balance:{}", position.trader));
        let guard = self.locks.acquire(&balance_key).await?;
        let mut balance = self.repos.balances.get(&position.trader).await?;
        let before = balance.wallet_balance;
        balance.wallet_balance -= amount;
        balance.used_margin -= amount;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        guard.release().await;

        self.journal
            .record(
                &position.trader,
                Some(position.token.as_str()),
                -amount,
                before,
                before - amount,
                SettlementType::FundingFee,
                json!({
                    "positionId": position.id,
                    "fundingRate": self.rate.to_string(),
                    "amount": amount.to_string(),
                    "destination": "insurance_fund",
                }),
            )
            .await?;

        let _ = self.events.send(WsEvent::Position {
            trader: position.trader.clone(),
            position: position.clone(),
        });
        Ok(amount)
    }

    /// Post-funding liquidation check. The leverage-based strategy keeps
    /// the historical formula that ignores the current mark; the mark-aware
    /// strategy uses the freshly recomputed ratio.
    fn margin_breached(&self, position: &Position) -> bool {
        match self.margin_check {
            FundingMarginCheck::LeverageBased => {
                let required_rate = initial_margin_rate(position.leverage) / 2;
                let required = mul_div(
                    notional(position.size, position.avg_entry_price),
                    required_rate,
                    RATE_SCALE,
                );
                position.collateral < required
            }
            FundingMarginCheck::MarkAware => position.margin_ratio >= 10_000,
        }
    }

    async fn credit_insurance(&self, token: &str, amount: i128) -> EngineResult<()> {
        let key = self
            .repos
            .keys
            .lock(&format!("balance:{}", self.insurance_account));
        let guard = self.locks.acquire(&key).await?;
        let mut fund = self.repos.balances.get(&self.insurance_account).await?;
        let before = fund.wallet_balance;
        fund.wallet_balance += amount;
        fund.updated_at = Utc::now();
        self.repos.balances.save(&fund).await?;
        self.journal
            .record(
                &self.insurance_account,
                Some(token),
                amount,
                before,
                fund.wallet_balance,
                SettlementType::InsuranceInjection,
                json!({ "source": "funding", "token": token }),
            )
            .await?;
        guard.release().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::PRICE_SCALE;
    use crate::risk::tests_support::sample_position;
    use crate::store::{MemoryStore, SharedStore};
    use crate::types::MarketStats;
    use std::time::Duration;

    const TOKEN: &str = "0xbbb0000000000000000000000000000000000002";

    fn engine(store: SharedStore) -> FundingEngine {
        let repos = Repositories::new(store.clone(), "t");
        let (events, _) = broadcast::channel(256);
        let journal = Journal::new(repos.clone(), events.clone());
        let locks = LockManager::new(store, Duration::from_millis(500), 3);
        let (_tx, shutdown) = watch::channel(false);
        let config = EngineConfig::default();
        FundingEngine {
            repos,
            journal,
            locks,
            events,
            prices: Arc::new(PriceBoard::new()),
            tokens: vec![TOKEN.to_string()],
            shutdown,
            interval: ChronoDuration::minutes(5),
            poll: Duration::from_secs(10),
            rate: 1,
            base_mmr: config.base_mmr,
            margin_check: FundingMarginCheck::LeverageBased,
            insurance_account: config.insurance_account.clone(),
        }
    }

    #[tokio::test]
    async fn settlement_deducts_rate_and_credits_fund() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut funding = engine(store.clone());
        let repos = funding.repos.clone();

        // Three positions with collaterals 1e18, 2e18, 5e18.
        for collateral in [PRICE_SCALE, 2 * PRICE_SCALE, 5 * PRICE_SCALE] {
            let mut p = sample_position();
            p.id = uuid::Uuid::new_v4();
            p.trader = format!("0x{:040x}", collateral % 977);
            p.collateral = collateral;
            repos.positions.save(&p).await.unwrap();
        }
        let stats = MarketStats::empty(TOKEN);
        repos.market_stats.save(&stats).await.unwrap();

        funding.settle(TOKEN).await.unwrap();

        let fund = repos
            .balances
            .get(&funding.insurance_account)
            .await
            .unwrap();
        // 1bp of 8e18 total
        assert_eq!(fund.wallet_balance, 8 * PRICE_SCALE / 10_000);

        let open = repos.positions.open_for_token(TOKEN).await.unwrap();
        for p in &open {
            // collateral shrank by exactly 1bp
            assert_eq!(p.funding_fee, -(p.collateral / 9_999));
            assert!(p.liquidation_price > 0);
            let logs = repos.settlements.list_for(&p.trader, 5).await.unwrap();
            assert!(logs
                .iter()
                .any(|l| l.log_type == SettlementType::FundingFee && l.amount < 0));
        }
    }

    #[tokio::test]
    async fn next_funding_time_is_monotone() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut funding = engine(store.clone());
        let repos = funding.repos.clone();
        repos
            .market_stats
            .save(&MarketStats::empty(TOKEN))
            .await
            .unwrap();

        funding.settle(TOKEN).await.unwrap();
        let first = repos.market_stats.get(TOKEN).await.unwrap().next_funding_time;
        assert!(first > Utc::now());

        funding.settle(TOKEN).await.unwrap();
        let second = repos.market_stats.get(TOKEN).await.unwrap().next_funding_time;
        assert_eq!(second - first, ChronoDuration::minutes(5));
    }

    #[test]
    fn leverage_based_breach_ignores_mark() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let funding = engine(store);
        let mut p = sample_position();
        // imr/2 for 10x = 500bp of entry notional 100e18 = 5e18
        p.collateral = 4 * PRICE_SCALE;
        assert!(funding.margin_breached(&p));
        p.collateral = 6 * PRICE_SCALE;
        assert!(!funding.margin_breached(&p));
    }
}
