// Risk engine: the 100 ms assessment loop. Revalues every open position at
// the current book price, classifies risk, ranks ADL candidates, and feeds
// the liquidation service. Indicator write-back is batched to 1 Hz to bound
// write amplification; broadcast happens every tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::PriceBoard;
use crate::error::EngineResult;
use crate::fixed::mul_div;
use crate::position::recompute;
use crate::repo::{bool_field, field, Fields, Repositories};
use crate::types::{OrderSide, Position, RiskLevel};
use crate::ws::messages::WsEvent;

/// ADL scores are clamped here; a zero-collateral position would otherwise
/// rank unbounded.
const ADL_SCORE_CAP: i128 = 1_000_000_000;

const LEVEL_MEDIUM: i128 = 5_000;
const LEVEL_HIGH: i128 = 8_000;
const LEVEL_CRITICAL: i128 = 10_000;

/// A position the liquidation service should force-close.
#[derive(Debug, Clone)]
pub struct RiskCandidate {
    pub position_id: Uuid,
    pub trader: String,
    pub token: String,
    /// Side of the forced close order (opposite of the position).
    pub close_side: OrderSide,
    pub size: i128,
    pub leverage: i128,
    pub margin_ratio: i128,
    pub bankruptcy_price: i128,
    /// 0..=100, from how far past the critical threshold the ratio sits.
    pub urgency: i128,
}

pub fn classify(margin_ratio: i128) -> RiskLevel {
    if margin_ratio >= LEVEL_CRITICAL {
        RiskLevel::Critical
    } else if margin_ratio >= LEVEL_HIGH {
        RiskLevel::High
    } else if margin_ratio >= LEVEL_MEDIUM {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// |unrealizedPnL| * leverage / collateral, bounded. The denominator is the
/// initial collateral, not current margin: a position whose margin has
/// eroded keeps ranking by what it was funded with.
pub fn adl_score(position: &Position) -> i128 {
    if position.collateral <= 0 {
        return ADL_SCORE_CAP;
    }
    mul_div(
        position.unrealized_pnl.abs(),
        position.leverage,
        position.collateral,
    )
    .min(ADL_SCORE_CAP)
}

/// Quintile buckets over profitable positions: bucket 1 = top 20% by score
/// (first to unwind), bucket 5 = bottom. Ties break by position id.
pub fn assign_adl_ranks(positions: &mut [&mut Position]) {
    let mut ranked: Vec<(i128, Uuid)> = positions
        .iter()
        .filter(|p| p.unrealized_pnl > 0)
        .map(|p| (p.adl_score, p.id))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let total = ranked.len();
    let mut rank_of: HashMap<Uuid, u8> = HashMap::new();
    for (index, (_, id)) in ranked.iter().enumerate() {
        // index/total in [0,1) -> bucket 1..=5
        let bucket = (index * 5 / total.max(1)) as u8 + 1;
        rank_of.insert(*id, bucket.min(5));
    }

    for position in positions.iter_mut() {
        if position.unrealized_pnl > 0 {
            position.adl_rank = *rank_of.get(&position.id).unwrap_or(&5);
            position.is_adl_candidate = true;
        } else {
            position.adl_rank = 0;
            position.is_adl_candidate = false;
        }
    }
}

pub struct RiskEngine {
    repos: Repositories,
    events: broadcast::Sender<WsEvent>,
    prices: Arc<PriceBoard>,
    candidates: mpsc::Sender<RiskCandidate>,
    shutdown: watch::Receiver<bool>,
    base_mmr: i128,
    tick: std::time::Duration,
    slow_tick: std::time::Duration,
    flush_every: u32,
    /// Last broadcast level per position, for exactly-once transition
    /// warnings between store flushes.
    last_levels: HashMap<Uuid, RiskLevel>,
}

impl RiskEngine {
    pub fn spawn(
        repos: Repositories,
        events: broadcast::Sender<WsEvent>,
        prices: Arc<PriceBoard>,
        candidates: mpsc::Sender<RiskCandidate>,
        shutdown: watch::Receiver<bool>,
        config: &EngineConfig,
    ) {
        let mut engine = RiskEngine {
            repos,
            events,
            prices,
            candidates,
            shutdown,
            base_mmr: config.base_mmr,
            tick: config.risk_tick,
            slow_tick: config.risk_slow_tick,
            flush_every: config.risk_flush_every.max(1),
            last_levels: HashMap::new(),
        };
        tokio::spawn(async move {
            engine.run().await;
        });
    }

    async fn run(&mut self) {
        info!("risk engine started ({}ms tick)", self.tick.as_millis());
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let started = Instant::now();
                    let flush = tick_count % self.flush_every as u64 == 0;
                    if let Err(e) = self.cycle(flush).await {
                        // One bad cycle never halts the loop.
                        error!("risk cycle failed: {}", e);
                    }
                    let elapsed = started.elapsed();
                    if elapsed > self.slow_tick {
                        warn!("slow risk tick: {}ms", elapsed.as_millis());
                    }
                    tick_count += 1;
                }
            }
        }
        info!("risk engine stopped");
    }

    async fn cycle(&mut self, flush: bool) -> EngineResult<()> {
        let mut positions = self.repos.positions.open_positions().await?;
        if positions.is_empty() {
            return Ok(());
        }

        let mut revalued: Vec<&mut Position> = Vec::with_capacity(positions.len());
        for position in positions.iter_mut() {
            let price = self.prices.get(&position.token);
            if price == 0 {
                // No book price this tick; skip the token's positions.
                debug!("no price for {}, skipping risk pass", position.token);
                continue;
            }
            recompute(position, price, self.base_mmr);
            position.adl_score = adl_score(position);
            position.risk_level = classify(position.margin_ratio);
            position.is_liquidatable = position.margin_ratio >= LEVEL_CRITICAL;
            revalued.push(position);
        }
        if revalued.is_empty() {
            return Ok(());
        }

        assign_adl_ranks(&mut revalued);

        // Candidates sorted most-distressed first.
        let mut candidates: Vec<RiskCandidate> = Vec::new();

        for position in revalued.iter() {
            let previous = self
                .last_levels
                .get(&position.id)
                .copied()
                .unwrap_or(RiskLevel::Low);
            let current = position.risk_level;

            if current == RiskLevel::High && previous < RiskLevel::High {
                let _ = self.events.send(WsEvent::MarginWarning {
                    trader: position.trader.clone(),
                    position: (*position).clone(),
                });
            }
            if current == RiskLevel::Critical && previous < RiskLevel::Critical {
                let _ = self.events.send(WsEvent::LiquidationWarning {
                    trader: position.trader.clone(),
                    position: (*position).clone(),
                });
            }

            if position.is_liquidatable && !position.is_liquidating {
                candidates.push(RiskCandidate {
                    position_id: position.id,
                    trader: position.trader.clone(),
                    token: position.token.clone(),
                    close_side: if position.is_long {
                        OrderSide::Short
                    } else {
                        OrderSide::Long
                    },
                    size: position.size,
                    leverage: position.leverage,
                    margin_ratio: position.margin_ratio,
                    bankruptcy_price: position.bankruptcy_price,
                    urgency: ((position.margin_ratio - LEVEL_CRITICAL) / 100).clamp(0, 100),
                });
            }

            // Risk data goes out every tick regardless of flush cadence.
            let _ = self.events.send(WsEvent::Risk {
                trader: position.trader.clone(),
                position: (*position).clone(),
            });
        }

        self.last_levels = revalued
            .iter()
            .map(|p| (p.id, p.risk_level))
            .collect();

        candidates.sort_by(|a, b| b.margin_ratio.cmp(&a.margin_ratio));
        for candidate in candidates {
            if let Some(position) = revalued.iter().find(|p| p.id == candidate.position_id) {
                if let Err(e) = self
                    .repos
                    .positions
                    .index_liquidation_candidate(position)
                    .await
                {
                    warn!("liquidation index write failed: {}", e);
                }
            }
            if self.candidates.send(candidate).await.is_err() {
                warn!("liquidation service unavailable; dropping candidates");
                break;
            }
        }

        if flush {
            let updates: Vec<(Uuid, Fields)> = revalued
                .iter()
                .map(|p| (p.id, indicator_fields(p)))
                .collect();
            self.repos.positions.write_risk_batch(&updates).await?;
        }
        Ok(())
    }
}

/// The indicator subset the risk loop owns in the store.
fn indicator_fields(p: &Position) -> Fields {
    vec![
        field("markPrice", p.mark_price),
        field("unrealizedPnl", p.unrealized_pnl),
        field("margin", p.margin),
        field("marginRatio", p.margin_ratio),
        field("mmr", p.mmr),
        field("maintenanceMargin", p.maintenance_margin),
        field("roe", p.roe),
        field("adlScore", p.adl_score),
        field("adlRank", p.adl_rank),
        field("riskLevel", p.risk_level.as_str()),
        field("isLiquidatable", bool_field(p.is_liquidatable)),
        field("isAdlCandidate", bool_field(p.is_adl_candidate)),
        field("liquidationPrice", p.liquidation_price),
        field("updatedAt", p.updated_at.timestamp_millis()),
    ]
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::fixed::{PRICE_SCALE, RATE_SCALE, SIZE_SCALE};
    use crate::types::{MarginMode, PositionStatus};
    use chrono::Utc;

    pub fn sample_position() -> Position {
        Position {
            id: Uuid::new_v4(),
            trader: "0xaaa0000000000000000000000000000000000001".into(),
            token: "0xbbb0000000000000000000000000000000000002".into(),
            counterparty: None,
            is_long: true,
            size: SIZE_SCALE,
            entry_price: 100 * PRICE_SCALE,
            avg_entry_price: 100 * PRICE_SCALE,
            leverage: 10 * RATE_SCALE,
            margin_mode: MarginMode::Isolated,
            mark_price: 100 * PRICE_SCALE,
            collateral: 10 * PRICE_SCALE,
            margin: 10 * PRICE_SCALE,
            mmr: 500,
            maintenance_margin: 5 * PRICE_SCALE,
            liquidation_price: 0,
            bankruptcy_price: 90 * PRICE_SCALE,
            break_even_price: 100 * PRICE_SCALE,
            unrealized_pnl: 0,
            realized_pnl: 0,
            funding_fee: 0,
            take_profit_price: 0,
            stop_loss_price: 0,
            margin_ratio: 0,
            roe: 0,
            adl_rank: 0,
            adl_score: 0,
            risk_level: RiskLevel::Low,
            is_liquidatable: false,
            is_adl_candidate: false,
            is_liquidating: false,
            funding_index: 0,
            status: PositionStatus::Open,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::sample_position;
    use super::*;
    use crate::fixed::{PRICE_SCALE, RATE_SCALE};

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(0), RiskLevel::Low);
        assert_eq!(classify(4_999), RiskLevel::Low);
        assert_eq!(classify(5_000), RiskLevel::Medium);
        assert_eq!(classify(7_999), RiskLevel::Medium);
        assert_eq!(classify(8_000), RiskLevel::High);
        assert_eq!(classify(9_999), RiskLevel::High);
        assert_eq!(classify(10_000), RiskLevel::Critical);
        assert_eq!(classify(45_500), RiskLevel::Critical);
    }

    #[test]
    fn adl_score_uses_initial_collateral() {
        let mut p = sample_position();
        p.unrealized_pnl = 5 * PRICE_SCALE;
        p.collateral = 10 * PRICE_SCALE;
        p.leverage = 10 * RATE_SCALE;
        // |5| * 100000 / 10 = 50000
        assert_eq!(adl_score(&p), 50_000);

        p.collateral = 0;
        assert_eq!(adl_score(&p), ADL_SCORE_CAP);
    }

    #[test]
    fn adl_ranks_split_into_quintiles() {
        let mut positions: Vec<Position> = (0..10)
            .map(|i| {
                let mut p = sample_position();
                p.unrealized_pnl = PRICE_SCALE;
                p.adl_score = 1000 - i as i128; // descending scores
                p
            })
            .collect();
        let mut refs: Vec<&mut Position> = positions.iter_mut().collect();
        assign_adl_ranks(&mut refs);

        assert_eq!(positions[0].adl_rank, 1);
        assert_eq!(positions[1].adl_rank, 1);
        assert_eq!(positions[4].adl_rank, 3);
        assert_eq!(positions[9].adl_rank, 5);
        assert!(positions.iter().all(|p| p.is_adl_candidate));
    }

    #[test]
    fn losing_positions_are_unranked() {
        let mut positions: Vec<Position> = (0..2)
            .map(|_| {
                let mut p = sample_position();
                p.unrealized_pnl = -PRICE_SCALE;
                p
            })
            .collect();
        let mut refs: Vec<&mut Position> = positions.iter_mut().collect();
        assign_adl_ranks(&mut refs);
        assert!(positions.iter().all(|p| p.adl_rank == 0 && !p.is_adl_candidate));
    }
}
