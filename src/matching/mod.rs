// Per-token matching engine. One task owns the token's book and serializes
// every mutation to it and to positions on that token; tokens run in
// parallel. Each batch processes expired orders, fired triggers, user
// ingests, then risk-emitted liquidation orders.

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::book::{Fill, OrderBook, SubmitResult};
use crate::config::EngineConfig;
use crate::engine::PriceBoard;
use crate::error::{EngineError, EngineResult};
use crate::fixed::{mul_div, notional, price_to_score, RATE_SCALE};
use crate::position::{FillParams, PositionManager};
use crate::repo::Repositories;
use crate::store::LockManager;
use crate::types::{
    required_margin, MarginMode, Order, OrderMargin, OrderSide, OrderStatus, TradeType,
};
use crate::ws::messages::WsEvent;

const COMMAND_BUFFER: usize = 1024;
/// Cadence of the expiry/trigger sweep between command arrivals.
const SWEEP_INTERVAL_MS: u64 = 100;
/// Upper bound on any single request/response round-trip with the task.
const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Commands accepted by a token's matching task.
pub enum EngineCommand {
    Submit {
        order: Order,
        respond: Option<oneshot::Sender<EngineResult<Order>>>,
    },
    Cancel {
        order_id: Uuid,
        trader: String,
        respond: Option<oneshot::Sender<EngineResult<bool>>>,
    },
    /// Force-close emitted by the liquidation service; bypasses the margin
    /// freeze and carries liquidation priority. A nonzero limit price bounds
    /// how deep the forced close may eat into the book.
    Liquidate {
        position_id: Uuid,
        trader: String,
        side: OrderSide,
        size: i128,
        leverage: i128,
        limit_price: i128,
        respond: Option<oneshot::Sender<EngineResult<()>>>,
    },
    /// Serialized depth read for snapshots and the 1 Hz pusher.
    Snapshot {
        levels: usize,
        respond: oneshot::Sender<crate::types::DepthSnapshot>,
    },
}

impl EngineCommand {
    fn is_liquidation(&self) -> bool {
        matches!(self, EngineCommand::Liquidate { .. })
    }
}

/// Cloneable handle to a token's matching task.
#[derive(Clone)]
pub struct MatchingHandle {
    token: String,
    tx: mpsc::Sender<EngineCommand>,
}

impl MatchingHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn submit_order(&self, order: Order) -> EngineResult<Order> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Submit {
                order,
                respond: Some(respond),
            })
            .await
            .map_err(|_| EngineError::Internal("matching task gone".into()))?;
        tokio::time::timeout(RPC_TIMEOUT, rx)
            .await
            .map_err(|_| EngineError::Internal("matching rpc timed out".into()))?
            .map_err(|_| EngineError::Internal("matching task dropped response".into()))?
    }

    pub async fn cancel_order(&self, order_id: Uuid, trader: &str) -> EngineResult<bool> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Cancel {
                order_id,
                trader: trader.to_string(),
                respond: Some(respond),
            })
            .await
            .map_err(|_| EngineError::Internal("matching task gone".into()))?;
        tokio::time::timeout(RPC_TIMEOUT, rx)
            .await
            .map_err(|_| EngineError::Internal("matching rpc timed out".into()))?
            .map_err(|_| EngineError::Internal("matching task dropped response".into()))?
    }

    pub async fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::Internal("matching task gone".into()))
    }

    pub async fn depth(&self, levels: usize) -> EngineResult<crate::types::DepthSnapshot> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Snapshot { levels, respond })
            .await
            .map_err(|_| EngineError::Internal("matching task gone".into()))?;
        tokio::time::timeout(RPC_TIMEOUT, rx)
            .await
            .map_err(|_| EngineError::Internal("matching rpc timed out".into()))?
            .map_err(|_| EngineError::Internal("matching task dropped response".into()))
    }
}

pub struct MatchingEngine {
    token: String,
    book: OrderBook,
    repos: Repositories,
    positions: PositionManager,
    locks: LockManager,
    events: broadcast::Sender<WsEvent>,
    prices: std::sync::Arc<PriceBoard>,
    rx: mpsc::Receiver<EngineCommand>,
    shutdown: watch::Receiver<bool>,
    min_order_size: i128,
    min_leverage: i128,
    max_leverage: i128,
    taker_fee: i128,
    book_dirty: bool,
}

impl MatchingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        token: &str,
        repos: Repositories,
        positions: PositionManager,
        locks: LockManager,
        events: broadcast::Sender<WsEvent>,
        prices: std::sync::Arc<PriceBoard>,
        shutdown: watch::Receiver<bool>,
        config: &EngineConfig,
    ) -> MatchingHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let mut engine = MatchingEngine {
            token: token.to_string(),
            book: OrderBook::new(token),
            repos,
            positions,
            locks,
            events,
            prices,
            rx,
            shutdown,
            min_order_size: config.min_order_size,
            min_leverage: config.min_leverage,
            max_leverage: config.max_leverage,
            taker_fee: config.taker_fee,
            book_dirty: false,
        };
        let handle = MatchingHandle {
            token: token.to_string(),
            tx,
        };
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                error!("matching engine for {} crashed: {}", engine.token, e);
            }
        });
        handle
    }

    async fn run(&mut self) -> EngineResult<()> {
        info!("matching engine started for {}", self.token);
        self.rebuild_book().await?;

        let mut sweep = tokio::time::interval(std::time::Duration::from_millis(SWEEP_INTERVAL_MS));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        error!("expiry sweep failed on {}: {}", self.token, e);
                    }
                    if let Err(e) = self.fire_triggers().await {
                        error!("trigger sweep failed on {}: {}", self.token, e);
                    }
                    self.prices.set(&self.token, self.book.current_price());
                    self.publish_book_if_dirty();
                }
                command = self.rx.recv() => {
                    match command {
                        Some(first) => {
                            self.process_batch(first).await;
                            self.prices.set(&self.token, self.book.current_price());
                            self.publish_book_if_dirty();
                        }
                        None => break,
                    }
                }
            }
        }

        // Quiesce: drain buffered commands so accepted ingests are persisted.
        while let Ok(command) = self.rx.try_recv() {
            self.process_batch(command).await;
        }
        self.publish_book_if_dirty();
        info!("matching engine stopped for {}", self.token);
        Ok(())
    }

    /// The book is rebuilt from the durable pending-order index; it is not
    /// persisted itself.
    async fn rebuild_book(&mut self) -> EngineResult<()> {
        let pending = self.repos.orders.pending_for_token(&self.token).await?;
        let count = pending.len();
        for order in pending {
            if order.trigger_price > 0 && order.status == OrderStatus::Pending {
                // Untriggered conditionals stay in the trigger index only.
                continue;
            }
            self.book.restore(order);
        }
        if count > 0 {
            info!("rebuilt {} book with {} pending orders", self.token, count);
        }
        Ok(())
    }

    /// Drain everything already queued and run user ingests before
    /// liquidation orders, as one serialized batch.
    async fn process_batch(&mut self, first: EngineCommand) {
        let mut user = Vec::new();
        let mut liquidations = Vec::new();
        let mut push = |cmd: EngineCommand, user: &mut Vec<EngineCommand>, liq: &mut Vec<EngineCommand>| {
            if cmd.is_liquidation() {
                liq.push(cmd);
            } else {
                user.push(cmd);
            }
        };
        push(first, &mut user, &mut liquidations);
        while let Ok(command) = self.rx.try_recv() {
            push(command, &mut user, &mut liquidations);
        }

        for command in user.into_iter().chain(liquidations) {
            self.process_command(command).await;
        }
    }

    async fn process_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Submit { order, respond } => {
                let result = self.handle_submit(order).await;
                if let Err(e) = &result {
                    debug!("submit on {} rejected: {}", self.token, e);
                }
                if let Some(tx) = respond {
                    let _ = tx.send(result);
                }
            }
            EngineCommand::Cancel {
                order_id,
                trader,
                respond,
            } => {
                let result = self.handle_cancel(order_id, &trader).await;
                if let Some(tx) = respond {
                    let _ = tx.send(result);
                }
            }
            EngineCommand::Liquidate {
                position_id,
                trader,
                side,
                size,
                leverage,
                limit_price,
                respond,
            } => {
                let result = self
                    .handle_liquidation(position_id, &trader, side, size, leverage, limit_price)
                    .await;
                if let Err(e) = &result {
                    error!("liquidation order for {} failed: {}", position_id, e);
                }
                if let Some(tx) = respond {
                    let _ = tx.send(result);
                }
            }
            EngineCommand::Snapshot { levels, respond } => {
                let _ = respond.send(self.book.depth(levels));
            }
        }
    }

    /// Validate, freeze margin, and run the order. Validation failures are
    /// persisted as REJECTED with a reason and have no side-effects.
    async fn handle_submit(&mut self, mut order: Order) -> EngineResult<Order> {
        if let Err(reason) = self.validate(&order).await {
            order.status = OrderStatus::Rejected;
            order.reason = Some(reason.clone());
            order.updated_at = Utc::now();
            self.repos.orders.save(&order).await?;
            self.emit_order(&order);
            return Err(EngineError::Validation(reason));
        }

        // Reduce-only: clamp to the opposite-direction open position.
        if order.reduce_only {
            let opposite = self
                .repos
                .positions
                .open_for(&order.trader, &self.token)
                .await?
                .filter(|p| p.is_long != order.side.is_long());
            let cap = opposite.map(|p| p.size).unwrap_or(0);
            if cap <= 0 {
                return self.reject(order, "reduce-only with no opposing position").await;
            }
            if order.size > cap {
                order.size = cap;
            }
        }

        let nonce_fresh = self
            .repos
            .orders
            .record_nonce(&order.trader, order.nonce)
            .await?;
        if !nonce_fresh {
            return self.reject(order, "nonce replayed").await;
        }

        if !order.reduce_only {
            self.freeze_margin(&mut order).await?;
        }

        if order.order_type.is_conditional() && order.trigger_price > 0 {
            // Conditional orders wait in the trigger index, not the book.
            order.status = OrderStatus::Pending;
            self.repos.orders.save(&order).await?;
            self.repos.orders.index_trigger(&order).await?;
            self.emit_order(&order);
            return Ok(order);
        }

        self.run_book_order(order, TradeType::Normal).await
    }

    /// Submit to the book and settle every produced fill on both sides.
    async fn run_book_order(&mut self, order: Order, taker_type: TradeType) -> EngineResult<Order> {
        let submitted_size = order.size;
        let result = self.book.submit(order);
        self.book_dirty = self.book_dirty || !result.fills.is_empty() || result.resting;

        let SubmitResult {
            taker,
            fills,
            rejected,
            resting,
            self_cancelled,
        } = result;

        for stale in self_cancelled {
            if let Err(e) = self.settle_self_cancel(stale).await {
                error!("self-match cancel failed on {}: {}", self.token, e);
            }
        }

        if let Some(reason) = rejected {
            self.release_freeze(&taker, submitted_size).await?;
            self.repos.orders.save(&taker).await?;
            self.emit_order(&taker);
            return Err(EngineError::Validation(reason));
        }

        for fill in &fills {
            if let Err(e) = self.settle_fill(&taker, fill, taker_type).await {
                // A failed settlement on a critical path is fatal for the
                // batch; journal what happened and surface it.
                error!("fill settlement failed on {}: {}", self.token, e);
                return Err(e);
            }
        }

        // IOC/market remainders are discarded: release their freeze.
        let mut taker = taker;
        if !resting && taker.remaining_size() > 0 {
            self.release_freeze(&taker, taker.remaining_size()).await?;
            taker.status = OrderStatus::Cancelled;
        }

        self.repos.orders.save(&taker).await?;
        self.emit_order(&taker);
        if !fills.is_empty() {
            self.refresh_market_stats(&fills).await?;
        }
        Ok(taker)
    }

    /// Apply one fill: maker order bookkeeping, then position mutation and
    /// balance settlement for both traders.
    async fn settle_fill(&mut self, taker: &Order, fill: &Fill, taker_type: TradeType) -> EngineResult<()> {
        // Maker order state mirrors what the book already did in memory.
        let maker_leverage = if let Some(mut maker_order) = self.repos.orders.get(&fill.maker_order_id).await? {
            let prev_filled = maker_order.filled_size;
            maker_order.filled_size += fill.size;
            maker_order.status = if maker_order.remaining_size() <= 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            maker_order.avg_fill_price = if prev_filled == 0 {
                fill.price
            } else {
                mul_div(maker_order.avg_fill_price, prev_filled, maker_order.filled_size)
                    + mul_div(fill.price, fill.size, maker_order.filled_size)
            };
            maker_order.updated_at = Utc::now();
            self.repos.orders.save(&maker_order).await?;
            self.consume_freeze(&maker_order, fill.size).await?;
            self.emit_order(&maker_order);
            maker_order.leverage
        } else {
            RATE_SCALE * 10
        };

        self.consume_freeze(taker, fill.size).await?;

        let maker_params = FillParams {
            side: fill.taker_side.opposite(),
            size: fill.size,
            price: fill.price,
            leverage: maker_leverage,
            margin_mode: MarginMode::Isolated,
        };
        self.positions
            .apply_trade(
                &fill.maker,
                &self.token,
                fill.maker_order_id,
                maker_params,
                true,
                TradeType::Normal,
                Some(fill.taker.as_str()),
            )
            .await?;

        let taker_params = FillParams {
            side: fill.taker_side,
            size: fill.size,
            price: fill.price,
            leverage: taker.leverage,
            margin_mode: MarginMode::Isolated,
        };
        let (_, trade) = self
            .positions
            .apply_trade(
                &fill.taker,
                &self.token,
                taker.id,
                taker_params,
                false,
                taker_type,
                Some(fill.maker.as_str()),
            )
            .await?;

        let _ = self.events.send(WsEvent::Trade {
            token: self.token.clone(),
            trade,
        });
        Ok(())
    }

    async fn handle_cancel(&mut self, order_id: Uuid, trader: &str) -> EngineResult<bool> {
        let mut order = match self.repos.orders.get(&order_id).await? {
            Some(o) => o,
            None => return Ok(false),
        };
        if order.trader != trader {
            return Err(EngineError::Unauthorized(format!(
                "order {} belongs to another trader",
                order_id
            )));
        }
        if !order.status.is_open() {
            return Ok(false);
        }

        let in_book = self.book.remove(&order_id).is_some();
        if !in_book && order.trigger_price > 0 {
            self.repos.orders.deindex_trigger(&order).await?;
        }
        self.book_dirty = self.book_dirty || in_book;

        self.release_freeze(&order, order.remaining_size()).await?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        self.repos.orders.save(&order).await?;
        self.emit_order(&order);
        info!("order {} cancelled by {}", order_id, trader);
        Ok(true)
    }

    /// A resting order removed by self-match prevention: release its
    /// remaining freeze and persist the cancellation.
    async fn settle_self_cancel(&mut self, stale: Order) -> EngineResult<()> {
        let mut order = self.repos.orders.get(&stale.id).await?.unwrap_or(stale);
        self.release_freeze(&order, order.remaining_size()).await?;
        order.status = OrderStatus::Cancelled;
        order.reason = Some("self-match prevented".to_string());
        order.updated_at = Utc::now();
        self.repos.orders.save(&order).await?;
        self.emit_order(&order);
        self.book_dirty = true;
        Ok(())
    }

    /// Liquidation order: full remaining size, market, margin freeze
    /// bypassed entirely.
    async fn handle_liquidation(
        &mut self,
        position_id: Uuid,
        trader: &str,
        side: OrderSide,
        size: i128,
        leverage: i128,
        limit_price: i128,
    ) -> EngineResult<()> {
        let order = Order {
            id: Uuid::new_v4(),
            trader: trader.to_string(),
            token: self.token.clone(),
            side,
            size,
            price: limit_price.max(0),
            leverage,
            margin: 0,
            order_type: crate::types::OrderType::Market,
            time_in_force: crate::types::TimeInForce::Ioc,
            reduce_only: true,
            post_only: false,
            trigger_price: 0,
            filled_size: 0,
            avg_fill_price: 0,
            status: OrderStatus::Pending,
            reason: None,
            deadline: None,
            nonce: 0,
            signature: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        info!(
            "liquidation order on {}: close {} {} for position {}",
            self.token,
            size,
            side.as_str(),
            position_id
        );
        self.run_book_order(order, TradeType::Liquidation).await?;
        Ok(())
    }

    /// Validation per ingest: signature digest, bounds, leverage window.
    async fn validate(&self, order: &Order) -> Result<(), String> {
        if order.size < self.min_order_size {
            return Err(format!(
                "size {} below minimum {}",
                order.size, self.min_order_size
            ));
        }
        if order.leverage < self.min_leverage || order.leverage > self.max_leverage {
            return Err(format!("leverage {} out of range", order.leverage));
        }
        if order.price < 0 || order.trigger_price < 0 {
            return Err("negative price".to_string());
        }
        if order.trigger_price > 0 && price_to_score(order.trigger_price).is_none() {
            return Err("trigger price exceeds representable maximum".to_string());
        }
        if order.signature != order.sign_digest() {
            return Err("bad signature".to_string());
        }
        Ok(())
    }

    async fn reject(&mut self, mut order: Order, reason: &str) -> EngineResult<Order> {
        order.status = OrderStatus::Rejected;
        order.reason = Some(reason.to_string());
        order.updated_at = Utc::now();
        self.repos.orders.save(&order).await?;
        self.emit_order(&order);
        Err(EngineError::Validation(reason.to_string()))
    }

    /// Freeze margin plus fee reserve for a new order under the trader's
    /// balance lease. Token-lock (this task) is always taken first.
    async fn freeze_margin(&mut self, order: &mut Order) -> EngineResult<()> {
        let reference_price = if order.is_market() {
            let p = self.book.current_price();
            if p == 0 {
                return self
                    .reject(order.clone(), "no market price for market order")
                    .await
                    .map(|_| ());
            }
            p
        } else {
            order.price
        };

        let margin = required_margin(order.size, reference_price, order.leverage);
        let fee_reserve = mul_div(notional(order.size, reference_price), self.taker_fee, RATE_SCALE);
        let total = margin + fee_reserve;

        let key = self.repos.keys.lock(&format!("balance:{}", order.trader));
        let guard = self.locks.acquire(&key).await?;
        let mut balance = self.repos.balances.get(&order.trader).await?;
        if balance.available() < total {
            guard.release().await;
            let available = balance.available();
            self.reject(order.clone(), "insufficient available balance").await.ok();
            return Err(EngineError::InsufficientBalance {
                required: total,
                available,
            });
        }
        balance.frozen_margin += total;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        guard.release().await;

        order.margin = margin;
        self.repos
            .order_margins
            .save(&OrderMargin {
                order_id: order.id,
                trader: order.trader.clone(),
                token: self.token.clone(),
                frozen_margin: margin,
                fee_reserve,
                settled_size: 0,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Move the filled share of an order's freeze out of frozen margin.
    async fn consume_freeze(&self, order: &Order, fill_size: i128) -> EngineResult<()> {
        let Some(mut om) = self.repos.order_margins.get(&order.id).await? else {
            return Ok(()); // liquidation orders have no freeze
        };
        let share = mul_div(om.frozen_margin + om.fee_reserve, fill_size, order.size);
        om.settled_size += fill_size;
        self.repos.order_margins.save(&om).await?;

        let key = self.repos.keys.lock(&format!("balance:{}", order.trader));
        let guard = self.locks.acquire(&key).await?;
        let mut balance = self.repos.balances.get(&order.trader).await?;
        balance.frozen_margin = (balance.frozen_margin - share).max(0);
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        guard.release().await;

        if om.settled_size >= order.size {
            self.repos.order_margins.remove(&order.id).await?;
        }
        Ok(())
    }

    /// Release the frozen share covering `unfilled` units (cancel, expiry,
    /// IOC remainder, rejection after freeze).
    async fn release_freeze(&self, order: &Order, unfilled: i128) -> EngineResult<()> {
        if unfilled <= 0 {
            return Ok(());
        }
        let Some(om) = self.repos.order_margins.get(&order.id).await? else {
            return Ok(());
        };
        let share = mul_div(om.frozen_margin + om.fee_reserve, unfilled, order.size);

        let key = self.repos.keys.lock(&format!("balance:{}", order.trader));
        let guard = self.locks.acquire(&key).await?;
        let mut balance = self.repos.balances.get(&order.trader).await?;
        balance.frozen_margin = (balance.frozen_margin - share).max(0);
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        guard.release().await;

        self.repos.order_margins.remove(&order.id).await?;
        Ok(())
    }

    /// (i) expired GTD sweep.
    async fn sweep_expired(&mut self) -> EngineResult<()> {
        let now = Utc::now();
        for id in self.book.expired_ids(now) {
            if let Some(book_order) = self.book.remove(&id) {
                self.book_dirty = true;
                let mut order = self.repos.orders.get(&id).await?.unwrap_or(book_order);
                self.release_freeze(&order, order.remaining_size()).await?;
                order.status = OrderStatus::Expired;
                order.updated_at = now;
                self.repos.orders.save(&order).await?;
                self.emit_order(&order);
                debug!("expired order {} on {}", id, self.token);
            }
        }
        Ok(())
    }

    /// (ii) conditional orders whose trigger the current price has crossed.
    async fn fire_triggers(&mut self) -> EngineResult<()> {
        let price = self.book.current_price();
        if price == 0 {
            return Ok(());
        }
        for side in [OrderSide::Long, OrderSide::Short] {
            let ids = self.repos.orders.triggered_ids(&self.token, side, price).await?;
            for id in ids {
                let Some(mut order) = self.repos.orders.get(&id).await? else {
                    continue;
                };
                if !order.status.is_open() {
                    self.repos.orders.deindex_trigger(&order).await?;
                    continue;
                }
                self.repos.orders.deindex_trigger(&order).await?;
                // Announce the transition without persisting the transient
                // state; the run below writes the final status.
                order.status = OrderStatus::Triggered;
                order.updated_at = Utc::now();
                self.emit_order(&order);
                info!(
                    "trigger fired on {}: order {} at price {}",
                    self.token, id, price
                );
                // Promote to active matching; freeze already happened at
                // ingest.
                order.status = OrderStatus::Pending;
                if let Err(e) = self.run_book_order(order, TradeType::Normal).await {
                    warn!("triggered order {} failed to run: {}", id, e);
                }
            }
        }
        Ok(())
    }

    /// Refresh the per-token rollup after a batch that produced fills.
    async fn refresh_market_stats(&self, fills: &[Fill]) -> EngineResult<()> {
        let mut stats = self.repos.market_stats.get(&self.token).await?;
        let last = self.book.current_price();
        stats.last_price = last;
        stats.mark_price = last;
        if stats.index_price == 0 {
            stats.index_price = last;
        }
        if stats.high_24h < last {
            stats.high_24h = last;
        }
        if stats.low_24h == 0 || stats.low_24h > last {
            stats.low_24h = last;
        }
        for fill in fills {
            stats.volume_24h += fill.size;
        }

        let open = self.repos.positions.open_for_token(&self.token).await?;
        stats.open_interest_long = open.iter().filter(|p| p.is_long).map(|p| p.size).sum();
        stats.open_interest_short = open.iter().filter(|p| !p.is_long).map(|p| p.size).sum();
        stats.updated_at = Utc::now();
        self.repos.market_stats.save(&stats).await?;
        Ok(())
    }

    fn publish_book_if_dirty(&mut self) {
        if self.book_dirty {
            let _ = self.events.send(WsEvent::Orderbook {
                token: self.token.clone(),
                depth: self.book.depth(20),
            });
            self.book_dirty = false;
        }
    }

    fn emit_order(&self, order: &Order) {
        let _ = self.events.send(WsEvent::Orders {
            trader: order.trader.clone(),
            order: order.clone(),
        });
    }
}
