// Position manager: maintains the per-(trader, token) paired position
// record. The math is pure; persistence and balance/journal effects live on
// the manager so the matching loop stays the only writer per token.

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fixed::{mul_div, notional, pnl, PRICE_SCALE, RATE_SCALE};
use crate::repo::Repositories;
use crate::settlement::Journal;
use crate::store::LockManager;
use crate::types::{
    MarginMode, OrderSide, Position, PositionStatus, RiskLevel, SettlementType, Trade, TradeType,
};
use crate::ws::messages::WsEvent;

/// Margin-ratio value reported when current margin is gone entirely.
pub const RATIO_CEILING: i128 = 999_999;

#[derive(Debug, Clone, Copy)]
pub struct FillParams {
    pub side: OrderSide,
    pub size: i128,
    pub price: i128,
    pub leverage: i128,
    pub margin_mode: MarginMode,
}

/// What a single fill did to the position and to collateral flows.
#[derive(Debug)]
pub struct FillEffect {
    pub position: Position,
    pub realized_pnl: i128,
    /// Collateral returned to the trader by the closed portion.
    pub released_collateral: i128,
    /// Collateral newly committed by the opened portion.
    pub added_collateral: i128,
    pub flipped: bool,
    /// The closed record a flip superseded; persisted before the new one.
    pub closed_predecessor: Option<Position>,
}

/// Price at which margin(P) equals the maintenance margin.
pub fn liquidation_price(avg_entry: i128, size: i128, collateral: i128, mmr: i128, is_long: bool) -> i128 {
    if size == 0 {
        return 0;
    }
    let entry_notional = notional(size, avg_entry);
    let price = if is_long {
        let numerator = entry_notional - collateral;
        if numerator <= 0 {
            return 0;
        }
        mul_div(numerator, RATE_SCALE * PRICE_SCALE, size * (RATE_SCALE - mmr))
    } else {
        mul_div(
            entry_notional + collateral,
            RATE_SCALE * PRICE_SCALE,
            size * (RATE_SCALE + mmr),
        )
    };
    price.max(0)
}

/// Price at which the entire collateral is consumed (margin = 0).
pub fn bankruptcy_price(avg_entry: i128, size: i128, collateral: i128, is_long: bool) -> i128 {
    if size == 0 {
        return 0;
    }
    let offset = mul_div(collateral, PRICE_SCALE, size);
    let price = if is_long {
        avg_entry - offset
    } else {
        avg_entry + offset
    };
    price.max(0)
}

/// Entry adjusted for accumulated costs (funding paid so far).
pub fn break_even_price(avg_entry: i128, size: i128, costs: i128, is_long: bool) -> i128 {
    if size == 0 {
        return avg_entry;
    }
    let offset = mul_div(costs.abs(), PRICE_SCALE, size);
    let price = if is_long {
        avg_entry + offset
    } else {
        avg_entry - offset
    };
    price.max(0)
}

/// Initial-margin rate in basis points: 10000^2 / leverage.
pub fn initial_margin_rate(leverage: i128) -> i128 {
    if leverage <= 0 {
        return RATE_SCALE;
    }
    RATE_SCALE * RATE_SCALE / leverage
}

pub fn maintenance_margin_rate(leverage: i128, base_mmr: i128) -> i128 {
    base_mmr.min(initial_margin_rate(leverage) / 2)
}

/// Revalue every derived field at the given mark price.
pub fn recompute(position: &mut Position, mark_price: i128, base_mmr: i128) {
    position.mark_price = mark_price;
    position.unrealized_pnl = pnl(
        position.avg_entry_price,
        mark_price,
        position.size,
        position.is_long,
    );
    position.margin = position.collateral + position.unrealized_pnl;
    position.mmr = maintenance_margin_rate(position.leverage, base_mmr);
    position.maintenance_margin = mul_div(
        notional(position.size, mark_price),
        position.mmr,
        RATE_SCALE,
    );
    position.margin_ratio = if position.margin > 0 {
        mul_div(position.maintenance_margin, RATE_SCALE, position.margin)
    } else {
        RATIO_CEILING
    };
    position.roe = if position.collateral > 0 {
        mul_div(position.unrealized_pnl, RATE_SCALE, position.collateral)
    } else {
        0
    };
    position.liquidation_price = liquidation_price(
        position.avg_entry_price,
        position.size,
        position.collateral,
        position.mmr,
        position.is_long,
    );
    position.bankruptcy_price = bankruptcy_price(
        position.avg_entry_price,
        position.size,
        position.collateral,
        position.is_long,
    );
    position.break_even_price = break_even_price(
        position.avg_entry_price,
        position.size,
        position.funding_fee,
        position.is_long,
    );
    position.updated_at = Utc::now();
}

fn fresh_position(trader: &str, token: &str, params: FillParams) -> Position {
    let collateral = mul_div(notional(params.size, params.price), RATE_SCALE, params.leverage);
    Position {
        id: Uuid::new_v4(),
        trader: trader.to_string(),
        token: token.to_string(),
        counterparty: None,
        is_long: params.side.is_long(),
        size: params.size,
        entry_price: params.price,
        avg_entry_price: params.price,
        leverage: params.leverage,
        margin_mode: params.margin_mode,
        mark_price: params.price,
        collateral,
        margin: collateral,
        mmr: 0,
        maintenance_margin: 0,
        liquidation_price: 0,
        bankruptcy_price: 0,
        break_even_price: params.price,
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

/// Apply one fill to the trader's position on this token. Open, add with
/// volume-weighted entry, partial close with pro-rata collateral release,
/// or flip through zero onto the other side.
pub fn apply_fill(
    existing: Option<Position>,
    trader: &str,
    token: &str,
    params: FillParams,
    base_mmr: i128,
    liquidated: bool,
) -> FillEffect {
    let mut position = match existing {
        Some(p) if p.is_open() => p,
        _ => {
            let mut opened = fresh_position(trader, token, params);
            let added = opened.collateral;
            recompute(&mut opened, params.price, base_mmr);
            return FillEffect {
                position: opened,
                realized_pnl: 0,
                released_collateral: 0,
                added_collateral: added,
                flipped: false,
                closed_predecessor: None,
            };
        }
    };

    let same_side = position.is_long == params.side.is_long();
    if same_side {
        // Add: VWAP the entry, grow collateral by the new portion.
        let new_size = position.size + params.size;
        position.avg_entry_price = mul_div(position.avg_entry_price, position.size, new_size)
            + mul_div(params.price, params.size, new_size);
        let added = mul_div(notional(params.size, params.price), RATE_SCALE, params.leverage);
        position.size = new_size;
        position.collateral += added;
        recompute(&mut position, params.price, base_mmr);
        return FillEffect {
            position,
            realized_pnl: 0,
            released_collateral: 0,
            added_collateral: added,
            flipped: false,
            closed_predecessor: None,
        };
    }

    // Opposite side: close up to the existing size.
    let close_size = params.size.min(position.size);
    let realized = pnl(
        position.avg_entry_price,
        params.price,
        close_size,
        position.is_long,
    );
    let released = mul_div(position.collateral, close_size, position.size);
    position.size -= close_size;
    position.collateral -= released;
    position.realized_pnl += realized;

    if position.size == 0 {
        position.status = if liquidated {
            PositionStatus::Liquidated
        } else {
            PositionStatus::Closed
        };
        position.margin = 0;
        position.unrealized_pnl = 0;
        position.maintenance_margin = 0;
        position.margin_ratio = 0;
        position.is_liquidatable = false;
        position.is_adl_candidate = false;
        position.updated_at = Utc::now();
    } else {
        recompute(&mut position, params.price, base_mmr);
    }

    let remainder = params.size - close_size;
    if remainder > 0 {
        // Flip: the closed record is superseded by a fresh one on the
        // opposite side; callers persist the closed state first.
        let flip_params = FillParams {
            size: remainder,
            ..params
        };
        let mut flipped = fresh_position(trader, token, flip_params);
        let added = flipped.collateral;
        flipped.realized_pnl = position.realized_pnl;
        recompute(&mut flipped, params.price, base_mmr);
        return FillEffect {
            position: flipped,
            realized_pnl: realized,
            released_collateral: released,
            added_collateral: added,
            flipped: true,
            closed_predecessor: Some(position),
        };
    }

    FillEffect {
        position,
        realized_pnl: realized,
        released_collateral: released,
        added_collateral: 0,
        flipped: false,
        closed_predecessor: None,
    }
}

/// Persisting wrapper used by the matching loop and the liquidation service.
#[derive(Clone)]
pub struct PositionManager {
    repos: Repositories,
    journal: Journal,
    locks: LockManager,
    events: broadcast::Sender<WsEvent>,
    base_mmr: i128,
    taker_fee: i128,
    maker_fee: i128,
    insurance_fee_share: i128,
    insurance_account: String,
    collateral_safety_multiple: i128,
}

impl PositionManager {
    pub fn new(
        repos: Repositories,
        journal: Journal,
        locks: LockManager,
        events: broadcast::Sender<WsEvent>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repos,
            journal,
            locks,
            events,
            base_mmr: config.base_mmr,
            taker_fee: config.taker_fee,
            maker_fee: config.maker_fee,
            insurance_fee_share: config.insurance_fee_share,
            insurance_account: config.insurance_account.clone(),
            collateral_safety_multiple: config.collateral_safety_multiple,
        }
    }

    pub fn base_mmr(&self) -> i128 {
        self.base_mmr
    }

    /// Apply one side of a match: mutate the position, settle balances,
    /// journal realized PnL and fees, persist the trade, broadcast.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_trade(
        &self,
        trader: &str,
        token: &str,
        order_id: Uuid,
        params: FillParams,
        is_maker: bool,
        trade_type: TradeType,
        counterparty: Option<&str>,
    ) -> EngineResult<(Position, Trade)> {
        let fee_rate = if is_maker { self.maker_fee } else { self.taker_fee };
        let fee = mul_div(notional(params.size, params.price), fee_rate, RATE_SCALE);

        let existing = self.repos.positions.open_for(trader, token).await?;
        let liquidated = trade_type == TradeType::Liquidation;
        let effect = apply_fill(existing, trader, token, params, self.base_mmr, liquidated);

        // Token-lock is held by the calling matching task; balance-lock is
        // acquired second, never the reverse.
        let balance_key = self.repos.keys.lock(&format!("balance:{}", trader));
        let guard = self.locks.acquire(&balance_key).await?;

        let mut balance = self.repos.balances.get(trader).await?;
        let wallet_before = balance.wallet_balance;
        balance.used_margin += effect.added_collateral - effect.released_collateral;
        balance.wallet_balance += effect.realized_pnl;
        balance.wallet_balance -= fee;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;

        if let Some(closed) = &effect.closed_predecessor {
            // Persist the closed predecessor before the flip record.
            self.repos.positions.save(closed).await?;
        }
        self.repos.positions.save(&effect.position).await?;

        let trade = Trade {
            id: Uuid::new_v4(),
            order_id,
            token: token.to_string(),
            trader: trader.to_string(),
            is_long: params.side.is_long(),
            is_maker,
            size: params.size,
            price: params.price,
            fee,
            realized_pnl: effect.realized_pnl,
            trade_type,
            created_at: Utc::now(),
        };
        self.repos.trades.save(&trade).await?;

        if effect.realized_pnl != 0 || fee != 0 {
            self.journal
                .record(
                    trader,
                    Some(token),
                    effect.realized_pnl - fee,
                    wallet_before,
                    balance.wallet_balance,
                    SettlementType::SettlePnl,
                    json!({
                        "positionId": effect.position.id,
                        "tradeId": trade.id,
                        "realizedPnl": effect.realized_pnl.to_string(),
                        "fee": fee.to_string(),
                    }),
                )
                .await?;
        }

        guard.release().await;

        // Insurance fund takes its share of the fee, outside the user lock.
        let insurance_cut = mul_div(fee, self.insurance_fee_share, RATE_SCALE);
        if insurance_cut > 0 {
            self.credit_insurance(insurance_cut, &trade, counterparty).await?;
        }

        let _ = self.events.send(WsEvent::Position {
            trader: trader.to_string(),
            position: effect.position.clone(),
        });
        let _ = self.events.send(WsEvent::Balance {
            trader: trader.to_string(),
            balance,
        });

        debug!(
            "applied {} fill {}@{} for {} on {} (realized {})",
            params.side.as_str(),
            params.size,
            params.price,
            trader,
            token,
            effect.realized_pnl
        );
        Ok((effect.position, trade))
    }

    async fn credit_insurance(
        &self,
        amount: i128,
        trade: &Trade,
        counterparty: Option<&str>,
    ) -> EngineResult<()> {
        let key = self.repos.keys.lock(&format!("balance:{}", self.insurance_account));
        let guard = self.locks.acquire(&key).await?;
        let mut fund = self.repos.balances.get(&self.insurance_account).await?;
        let before = fund.wallet_balance;
        fund.wallet_balance += amount;
        fund.updated_at = Utc::now();
        self.repos.balances.save(&fund).await?;
        self.journal
            .record(
                &self.insurance_account,
                Some(trade.token.as_str()),
                amount,
                before,
                fund.wallet_balance,
                SettlementType::InsuranceInjection,
                json!({
                    "tradeId": trade.id,
                    "source": trade.trader,
                    "counterparty": counterparty,
                }),
            )
            .await?;
        guard.release().await;
        Ok(())
    }

    /// Add collateral to an open position and re-derive its prices.
    pub async fn add_collateral(&self, trader: &str, token: &str, amount: i128) -> EngineResult<Position> {
        if amount <= 0 {
            return Err(EngineError::Validation("collateral amount must be positive".into()));
        }
        let mut position = self
            .repos
            .positions
            .open_for(trader, token)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(format!("{}:{}", trader, token)))?;

        let balance_key = self.repos.keys.lock(&format!("balance:{}", trader));
        let guard = self.locks.acquire(&balance_key).await?;
        let mut balance = self.repos.balances.get(trader).await?;
        if balance.available() < amount {
            guard.release().await;
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: balance.available(),
            });
        }
        let before = balance.wallet_balance;
        balance.used_margin += amount;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;

        position.collateral += amount;
        let mark_price = position.mark_price;
        recompute(&mut position, mark_price, self.base_mmr);
        self.repos.positions.save(&position).await?;

        self.journal
            .record(
                trader,
                Some(token),
                amount,
                before,
                balance.wallet_balance,
                SettlementType::MarginAdd,
                json!({ "positionId": position.id, "amount": amount.to_string() }),
            )
            .await?;
        guard.release().await;

        let _ = self.events.send(WsEvent::Position {
            trader: trader.to_string(),
            position: position.clone(),
        });
        Ok(position)
    }

    /// Remove collateral; refused when the remaining margin would sit within
    /// the safety multiple of the maintenance requirement.
    pub async fn remove_collateral(&self, trader: &str, token: &str, amount: i128) -> EngineResult<Position> {
        if amount <= 0 {
            return Err(EngineError::Validation("collateral amount must be positive".into()));
        }
        let mut position = self
            .repos
            .positions
            .open_for(trader, token)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(format!("{}:{}", trader, token)))?;

        let mut trial = position.clone();
        trial.collateral -= amount;
        let trial_mark_price = trial.mark_price;
        recompute(&mut trial, trial_mark_price, self.base_mmr);
        if trial.collateral <= 0
            || trial.margin < trial.maintenance_margin * self.collateral_safety_multiple
        {
            return Err(EngineError::Validation(
                "margin ratio too close to maintenance after removal".into(),
            ));
        }

        let balance_key = self.repos.keys.lock(&format!("balance:{}", trader));
        let guard = self.locks.acquire(&balance_key).await?;
        let mut balance = self.repos.balances.get(trader).await?;
        let before = balance.wallet_balance;
        balance.used_margin -= amount;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;

        position.collateral -= amount;
        let mark_price = position.mark_price;
        recompute(&mut position, mark_price, self.base_mmr);
        self.repos.positions.save(&position).await?;

        self.journal
            .record(
                trader,
                Some(token),
                -amount,
                before,
                balance.wallet_balance,
                SettlementType::MarginRemove,
                json!({ "positionId": position.id, "amount": amount.to_string() }),
            )
            .await?;
        guard.release().await;

        let _ = self.events.send(WsEvent::Position {
            trader: trader.to_string(),
            position: position.clone(),
        });
        Ok(position)
    }
}
