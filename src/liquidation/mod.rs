// Liquidation service: consumes risk-engine candidates, force-closes
// against the book inside a price corridor, and falls back to ADL against
// top-ranked profitable positions at the failing position's bankruptcy
// price. Shortfalls draw on the insurance fund; surplus equity flows into
// it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::engine::PriceBoard;
use crate::error::{EngineError, EngineResult};
use crate::fixed::{mul_div, pnl, RATE_SCALE};
use crate::matching::{EngineCommand, MatchingHandle};
use crate::position::{FillParams, PositionManager};
use crate::repo::Repositories;
use crate::risk::{adl_score, RiskCandidate};
use crate::settlement::Journal;
use crate::store::LockManager;
use crate::types::{
    MarginMode, OrderSide, Position, SettlementType, TradeType,
};
use crate::ws::messages::WsEvent;

pub struct LiquidationService {
    repos: Repositories,
    positions: PositionManager,
    journal: Journal,
    locks: LockManager,
    events: broadcast::Sender<WsEvent>,
    prices: Arc<PriceBoard>,
    matching: HashMap<String, MatchingHandle>,
    rx: mpsc::Receiver<RiskCandidate>,
    shutdown: watch::Receiver<bool>,
    corridor: i128,
    insurance_account: String,
}

impl LiquidationService {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        repos: Repositories,
        positions: PositionManager,
        journal: Journal,
        locks: LockManager,
        events: broadcast::Sender<WsEvent>,
        prices: Arc<PriceBoard>,
        matching: HashMap<String, MatchingHandle>,
        rx: mpsc::Receiver<RiskCandidate>,
        shutdown: watch::Receiver<bool>,
        config: &EngineConfig,
    ) {
        let mut service = LiquidationService {
            repos,
            positions,
            journal,
            locks,
            events,
            prices,
            matching,
            rx,
            shutdown,
            corridor: config.liquidation_corridor,
            insurance_account: config.insurance_account.clone(),
        };
        tokio::spawn(async move {
            service.run().await;
        });
    }

    async fn run(&mut self) {
        info!("liquidation service started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                candidate = self.rx.recv() => {
                    match candidate {
                        Some(candidate) => {
                            let id = candidate.position_id;
                            if let Err(e) = self.liquidate(candidate).await {
                                error!("liquidation of {} failed: {}", id, e);
                                // Let the next risk cycle re-enqueue.
                                let _ = self.repos.positions.release_liquidation(&id).await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        info!("liquidation service stopped");
    }

    async fn liquidate(&mut self, candidate: RiskCandidate) -> EngineResult<()> {
        let Some(position) = self.repos.positions.get(&candidate.position_id).await? else {
            return Ok(());
        };
        if !position.is_open() || !position.is_liquidatable {
            return Ok(());
        }
        // Idempotence: only the claimer of the latch proceeds.
        if position.is_liquidating
            || !self.repos.positions.claim_liquidation(&position.id).await?
        {
            return Ok(());
        }

        info!(
            "liquidating position {} ({} {} on {}, ratio {}bp)",
            position.id,
            if position.is_long { "long" } else { "short" },
            position.size,
            position.token,
            candidate.margin_ratio
        );

        let collateral_baseline = position.collateral;
        let realized_baseline = position.realized_pnl;

        // Phase 1: force-close against the book inside the corridor.
        let mark = self.prices.get(&position.token);
        let limit_price = corridor_price(mark, candidate.close_side, self.corridor);
        if let Some(handle) = self.matching.get(&position.token) {
            let (ack, ack_rx) = tokio::sync::oneshot::channel();
            handle
                .send(EngineCommand::Liquidate {
                    position_id: position.id,
                    trader: position.trader.clone(),
                    side: candidate.close_side,
                    size: position.size,
                    leverage: position.leverage,
                    limit_price,
                    respond: Some(ack),
                })
                .await?;
            // The forced close is serialized with the token's other work;
            // wait for it before measuring what ADL must absorb.
            if let Ok(Err(e)) = ack_rx.await {
                warn!("book phase of liquidation {} failed: {}", position.id, e);
            }
        }

        // Phase 2: whatever the book could not absorb is unwound by ADL.
        let mut remaining = self
            .repos
            .positions
            .get(&position.id)
            .await?
            .filter(|p| p.is_open())
            .map(|p| p.size)
            .unwrap_or(0);
        if remaining > 0 {
            remaining = self
                .auto_deleverage(&position, candidate.close_side, remaining)
                .await?;
        }
        if remaining > 0 {
            warn!(
                "position {} still has {} after ADL; leaving for next cycle",
                position.id, remaining
            );
        }

        // Phase 3: settle the equity left in the failing position. A
        // partial unwind releases the latch and waits for the next cycle.
        let closed = self.repos.positions.get(&position.id).await?;
        if closed.as_ref().map(|p| p.size > 0).unwrap_or(false) {
            self.repos.positions.release_liquidation(&position.id).await?;
            return Ok(());
        }
        let realized_delta = closed
            .as_ref()
            .map(|p| p.realized_pnl - realized_baseline)
            .unwrap_or(0);
        let equity_left = collateral_baseline + realized_delta;
        self.settle_equity(&position, equity_left).await?;

        if let Some(mut final_position) = closed {
            final_position.is_liquidating = false;
            final_position.is_liquidatable = false;
            final_position.status = crate::types::PositionStatus::Liquidated;
            final_position.updated_at = Utc::now();
            self.repos.positions.save(&final_position).await?;
            self.repos
                .positions
                .deindex_liquidation_candidate(&final_position)
                .await?;
            let _ = self.events.send(WsEvent::Position {
                trader: final_position.trader.clone(),
                position: final_position,
            });
        }
        Ok(())
    }

    /// Unwind top-ranked profitable opposite positions at the failing
    /// position's bankruptcy price until the size is covered. Returns the
    /// size that could not be covered.
    async fn auto_deleverage(
        &mut self,
        failing: &Position,
        close_side: OrderSide,
        mut remaining: i128,
    ) -> EngineResult<i128> {
        let price = if failing.bankruptcy_price > 0 {
            failing.bankruptcy_price
        } else {
            self.prices.get(&failing.token)
        };
        if price == 0 {
            return Err(EngineError::PriceUnavailable(failing.token.clone()));
        }
        let mark = {
            let board = self.prices.get(&failing.token);
            if board > 0 {
                board
            } else {
                price
            }
        };

        // Revalue candidates here: the risk loop's store write-back is
        // batched to 1 Hz and may lag the price that made this necessary.
        let mut counterparties: Vec<Position> = self
            .repos
            .positions
            .open_for_token(&failing.token)
            .await?
            .into_iter()
            // The failing long is bought out by profitable shorts and vice
            // versa: counterparties sit on the opposite side.
            .filter(|p| p.is_long != failing.is_long && !p.is_liquidating)
            .map(|mut p| {
                p.unrealized_pnl = pnl(p.avg_entry_price, mark, p.size, p.is_long);
                p.adl_score = adl_score(&p);
                p
            })
            .filter(|p| p.unrealized_pnl > 0)
            .collect();
        counterparties.sort_by(|a, b| {
            b.adl_score.cmp(&a.adl_score).then(a.id.cmp(&b.id))
        });

        for counterparty in counterparties {
            if remaining <= 0 {
                break;
            }
            let unwind = remaining.min(counterparty.size);

            // Counterparty closes at the bankruptcy price.
            let (_, _trade) = self
                .positions
                .apply_trade(
                    &counterparty.trader,
                    &failing.token,
                    counterparty.id,
                    FillParams {
                        side: close_side.opposite(),
                        size: unwind,
                        price,
                        leverage: counterparty.leverage,
                        margin_mode: MarginMode::Isolated,
                    },
                    true,
                    TradeType::Adl,
                    Some(failing.trader.as_str()),
                )
                .await?;

            // Failing side closes the same slice.
            self.positions
                .apply_trade(
                    &failing.trader,
                    &failing.token,
                    failing.id,
                    FillParams {
                        side: close_side,
                        size: unwind,
                        price,
                        leverage: failing.leverage,
                        margin_mode: MarginMode::Isolated,
                    },
                    false,
                    TradeType::Liquidation,
                    Some(counterparty.trader.as_str()),
                )
                .await?;

            if let Some(updated) = self.repos.positions.get(&counterparty.id).await? {
                let _ = self.events.send(WsEvent::AdlTriggered {
                    trader: counterparty.trader.clone(),
                    position: updated,
                });
            }
            info!(
                "adl unwound {} of {} against {}",
                unwind, failing.id, counterparty.id
            );
            remaining -= unwind;
        }
        Ok(remaining)
    }

    /// Shortfall is debited from the insurance fund; surplus equity of the
    /// liquidated position is credited to it. Either way a LIQUIDATION
    /// journal entry records the movement for the failing trader.
    async fn settle_equity(&self, position: &Position, equity_left: i128) -> EngineResult<()> {
        let trader_key = self.repos.keys.lock(&format!("balance:{}", position.trader));
        let fund_key = self
            .repos
            .keys
            .lock(&format!("balance:{}", self.insurance_account));

        let trader_guard = self.locks.acquire(&trader_key).await?;
        let fund_guard = self.locks.acquire(&fund_key).await?;

        let mut trader_balance = self.repos.balances.get(&position.trader).await?;
        let mut fund = self.repos.balances.get(&self.insurance_account).await?;
        let trader_before = trader_balance.wallet_balance;
        let fund_before = fund.wallet_balance;

        if equity_left < 0 {
            // Bad debt: the fund makes the trader whole.
            let shortfall = -equity_left;
            fund.wallet_balance -= shortfall;
            trader_balance.wallet_balance += shortfall;
        } else if equity_left > 0 {
            // Leftover equity is forfeited to the fund.
            trader_balance.wallet_balance -= equity_left;
            fund.wallet_balance += equity_left;
        }
        trader_balance.updated_at = Utc::now();
        fund.updated_at = Utc::now();
        self.repos.balances.save(&trader_balance).await?;
        self.repos.balances.save(&fund).await?;

        self.journal
            .record(
                &position.trader,
                Some(position.token.as_str()),
                trader_balance.wallet_balance - trader_before,
                trader_before,
                trader_balance.wallet_balance,
                SettlementType::Liquidation,
                json!({
                    "positionId": position.id,
                    "equityLeft": equity_left.to_string(),
                    "destination": "insurance_fund",
                }),
            )
            .await?;
        if fund.wallet_balance != fund_before {
            self.journal
                .record(
                    &self.insurance_account,
                    Some(position.token.as_str()),
                    fund.wallet_balance - fund_before,
                    fund_before,
                    fund.wallet_balance,
                    SettlementType::InsuranceInjection,
                    json!({ "positionId": position.id }),
                )
                .await?;
        }

        fund_guard.release().await;
        trader_guard.release().await;
        Ok(())
    }
}

/// Worst acceptable price for a forced close: `corridor` basis points past
/// the mark on the taker's adverse side. Zero mark degrades to an unbounded
/// market order.
pub fn corridor_price(mark: i128, close_side: OrderSide, corridor: i128) -> i128 {
    if mark <= 0 {
        return 0;
    }
    match close_side {
        // Closing a long sells down into bids.
        OrderSide::Short => mul_div(mark, RATE_SCALE - corridor, RATE_SCALE),
        // Closing a short buys up into asks.
        OrderSide::Long => mul_div(mark, RATE_SCALE + corridor, RATE_SCALE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::PRICE_SCALE;

    #[test]
    fn corridor_bounds_follow_close_side() {
        let mark = 100 * PRICE_SCALE;
        let sell_floor = corridor_price(mark, OrderSide::Short, 500);
        assert_eq!(sell_floor, 95 * PRICE_SCALE);
        let buy_cap = corridor_price(mark, OrderSide::Long, 500);
        assert_eq!(buy_cap, 105 * PRICE_SCALE);
        assert_eq!(corridor_price(0, OrderSide::Short, 500), 0);
    }
}
