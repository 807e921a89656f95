// Per-token limit-order book: two price-keyed level maps with FIFO order
// queues inside each level. Owned exclusively by the token's matching task;
// nothing here touches the store.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::types::{DepthSnapshot, Order, OrderSide, OrderStatus, PriceLevel, TimeInForce};

const TRADE_RING_CAPACITY: usize = 1000;

/// One maker/taker pairing produced by the matching routine.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub taker_order_id: Uuid,
    pub maker: String,
    pub taker: String,
    pub taker_side: OrderSide,
    /// Resting (maker) order's price.
    pub price: i128,
    pub size: i128,
    pub maker_remaining: i128,
}

/// Outcome of submitting an order to the book.
#[derive(Debug)]
pub struct SubmitResult {
    /// The taker order with filled size, average price, and status applied.
    pub taker: Order,
    pub fills: Vec<Fill>,
    /// Set when the book refused the order (post-only cross, FOK shortfall).
    pub rejected: Option<String>,
    /// Whether the remainder now rests in the book.
    pub resting: bool,
    /// Stale same-trader makers removed instead of self-matching; the
    /// caller settles their cancellation.
    pub self_cancelled: Vec<Order>,
}

/// Entry in the recent-trade ring.
#[derive(Debug, Clone)]
pub struct BookTrade {
    pub price: i128,
    pub size: i128,
    pub taker_side: OrderSide,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Level {
    total_size: i128,
    queue: VecDeque<Uuid>,
}

pub struct OrderBook {
    token: String,
    // Bids iterated descending, asks ascending.
    bids: BTreeMap<i128, Level>,
    asks: BTreeMap<i128, Level>,
    orders: HashMap<Uuid, Order>,
    trades: VecDeque<BookTrade>,
    last_trade_price: i128,
}

impl OrderBook {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
            trades: VecDeque::with_capacity(TRADE_RING_CAPACITY),
            last_trade_price: 0,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Last-trade price, or the bid/ask midpoint while no trade has printed.
    pub fn current_price(&self) -> i128 {
        if self.last_trade_price > 0 {
            return self.last_trade_price;
        }
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => (bid + ask) / 2,
            _ => 0,
        }
    }

    pub fn best_bid(&self) -> Option<i128> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<i128> {
        self.asks.keys().next().copied()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.orders.contains_key(id)
    }

    pub fn order(&self, id: &Uuid) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn resting_count(&self) -> usize {
        self.orders.len()
    }

    /// Submit an order: match against the opposite side, then rest any
    /// remainder if the time-in-force allows it.
    pub fn submit(&mut self, order: Order) -> SubmitResult {
        let mut taker = order;

        if taker.post_only && self.would_cross(&taker) {
            taker.status = OrderStatus::Rejected;
            taker.reason = Some("post-only order would cross".to_string());
            return SubmitResult {
                taker,
                fills: Vec::new(),
                rejected: Some("post-only order would cross".to_string()),
                resting: false,
                self_cancelled: Vec::new(),
            };
        }

        if taker.time_in_force == TimeInForce::Fok {
            let fillable = self.fillable_size(taker.side, taker.price);
            if fillable < taker.remaining_size() {
                taker.status = OrderStatus::Rejected;
                taker.reason = Some("FOK size not fully available".to_string());
                return SubmitResult {
                    taker,
                    fills: Vec::new(),
                    rejected: Some("FOK size not fully available".to_string()),
                    resting: false,
                    self_cancelled: Vec::new(),
                };
            }
        }

        let mut self_cancelled = Vec::new();
        let fills = self.match_order(&mut taker, &mut self_cancelled);

        let resting = if taker.remaining_size() > 0 {
            match taker.time_in_force {
                // IOC discards the remainder; market orders never rest.
                TimeInForce::Ioc => false,
                _ if taker.is_market() => false,
                _ => {
                    self.rest(taker.clone());
                    true
                }
            }
        } else {
            false
        };

        SubmitResult {
            taker,
            fills,
            rejected: None,
            resting,
            self_cancelled,
        }
    }

    /// Re-seat a pending order during book rebuild without running the
    /// matching routine (the durable pending set cannot cross itself).
    pub fn restore(&mut self, order: Order) {
        if order.remaining_size() > 0 {
            self.rest(order);
        }
    }

    /// Walk the opposite side while the crossing condition holds. The trade
    /// price is always the maker's.
    fn match_order(&mut self, taker: &mut Order, self_cancelled: &mut Vec<Order>) -> Vec<Fill> {
        let mut fills = Vec::new();

        while taker.remaining_size() > 0 {
            let best = match taker.side {
                OrderSide::Long => self.best_ask(),
                OrderSide::Short => self.best_bid(),
            };
            let level_price = match best {
                Some(p) => p,
                None => break,
            };
            if !crosses(taker, level_price) {
                break;
            }

            let maker_id = {
                let level = match taker.side {
                    OrderSide::Long => self.asks.get(&level_price),
                    OrderSide::Short => self.bids.get(&level_price),
                };
                match level.and_then(|l| l.queue.front()) {
                    Some(id) => *id,
                    None => break,
                }
            };

            // Self-match: cancel the stale resting maker instead of
            // trading a trader against themselves.
            if self
                .orders
                .get(&maker_id)
                .map(|m| m.trader == taker.trader)
                .unwrap_or(false)
            {
                if let Some(removed) = self.remove(&maker_id) {
                    self_cancelled.push(removed);
                }
                continue;
            }

            let (fill, maker_done) = {
                let maker = self
                    .orders
                    .get_mut(&maker_id)
                    .expect("queued order missing from order map");
                let size = taker.remaining_size().min(maker.remaining_size());
                maker.filled_size += size;
                maker.avg_fill_price = weighted_avg(
                    maker.avg_fill_price,
                    maker.filled_size - size,
                    level_price,
                    size,
                );
                maker.status = if maker.remaining_size() == 0 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                maker.updated_at = Utc::now();
                (
                    Fill {
                        maker_order_id: maker_id,
                        taker_order_id: taker.id,
                        maker: maker.trader.clone(),
                        taker: taker.trader.clone(),
                        taker_side: taker.side,
                        price: level_price,
                        size,
                        maker_remaining: maker.remaining_size(),
                    },
                    maker.remaining_size() == 0,
                )
            };

            taker.filled_size += fill.size;
            taker.avg_fill_price = weighted_avg(
                taker.avg_fill_price,
                taker.filled_size - fill.size,
                level_price,
                fill.size,
            );
            taker.status = if taker.remaining_size() == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            taker.updated_at = Utc::now();

            self.shrink_level(level_price, fill.size, taker.side.opposite(), maker_done);
            if maker_done {
                self.orders.remove(&maker_id);
            }

            self.record_trade(level_price, fill.size, taker.side);
            fills.push(fill);
        }

        fills
    }

    fn would_cross(&self, order: &Order) -> bool {
        if order.is_market() {
            return match order.side {
                OrderSide::Long => self.best_ask().is_some(),
                OrderSide::Short => self.best_bid().is_some(),
            };
        }
        match order.side {
            OrderSide::Long => self.best_ask().map(|a| a <= order.price).unwrap_or(false),
            OrderSide::Short => self.best_bid().map(|b| b >= order.price).unwrap_or(false),
        }
    }

    /// Total opposite-side size fillable at or better than the limit price.
    /// FOK pre-walk and the liquidation corridor check both use this.
    pub fn fillable_size(&self, side: OrderSide, limit_price: i128) -> i128 {
        let mut total = 0;
        match side {
            OrderSide::Long => {
                for (price, level) in self.asks.iter() {
                    if limit_price != 0 && *price > limit_price {
                        break;
                    }
                    total += level.total_size;
                }
            }
            OrderSide::Short => {
                for (price, level) in self.bids.iter().rev() {
                    if limit_price != 0 && *price < limit_price {
                        break;
                    }
                    total += level.total_size;
                }
            }
        }
        total
    }

    fn rest(&mut self, order: Order) {
        let side_map = match order.side {
            OrderSide::Long => &mut self.bids,
            OrderSide::Short => &mut self.asks,
        };
        let level = side_map.entry(order.price).or_default();
        level.total_size += order.remaining_size();
        level.queue.push_back(order.id);
        debug!(
            "rested order {} {} {}@{} on {}",
            order.id,
            order.side.as_str(),
            order.remaining_size(),
            order.price,
            self.token
        );
        self.orders.insert(order.id, order);
    }

    /// Remove a resting order. Returns the order as it rested, or None when
    /// it is not in the book.
    pub fn remove(&mut self, id: &Uuid) -> Option<Order> {
        let order = self.orders.remove(id)?;
        let side_map = match order.side {
            OrderSide::Long => &mut self.bids,
            OrderSide::Short => &mut self.asks,
        };
        if let Some(level) = side_map.get_mut(&order.price) {
            level.queue.retain(|queued| queued != id);
            level.total_size -= order.remaining_size();
            if level.queue.is_empty() {
                side_map.remove(&order.price);
            }
        }
        Some(order)
    }

    fn shrink_level(&mut self, price: i128, size: i128, side: OrderSide, pop_front: bool) {
        let side_map = match side {
            OrderSide::Long => &mut self.bids,
            OrderSide::Short => &mut self.asks,
        };
        if let Some(level) = side_map.get_mut(&price) {
            level.total_size -= size;
            if pop_front {
                level.queue.pop_front();
            }
            if level.queue.is_empty() {
                side_map.remove(&price);
            }
        }
    }

    fn record_trade(&mut self, price: i128, size: i128, taker_side: OrderSide) {
        self.last_trade_price = price;
        if self.trades.len() == TRADE_RING_CAPACITY {
            self.trades.pop_back();
        }
        self.trades.push_front(BookTrade {
            price,
            size,
            taker_side,
            timestamp: Utc::now(),
        });
    }

    /// Recent trades, newest first.
    pub fn trades(&self, limit: usize) -> Vec<BookTrade> {
        self.trades.iter().take(limit).cloned().collect()
    }

    /// Top-N aggregated levels per side.
    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .map(|(price, level)| PriceLevel {
                price: *price,
                total_size: level.total_size,
                order_count: level.queue.len() as u32,
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(levels)
            .map(|(price, level)| PriceLevel {
                price: *price,
                total_size: level.total_size,
                order_count: level.queue.len() as u32,
            })
            .collect();
        DepthSnapshot {
            token: self.token.clone(),
            bids,
            asks,
            last_price: self.last_trade_price,
            timestamp: Utc::now(),
        }
    }

    /// Pending GTD orders whose deadline has passed.
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.orders
            .values()
            .filter(|o| {
                o.time_in_force == TimeInForce::Gtd
                    && o.deadline.map(|d| now >= d).unwrap_or(false)
            })
            .map(|o| o.id)
            .collect()
    }
}

fn crosses(taker: &Order, level_price: i128) -> bool {
    if taker.is_market() {
        return true;
    }
    match taker.side {
        OrderSide::Long => level_price <= taker.price,
        OrderSide::Short => level_price >= taker.price,
    }
}

fn weighted_avg(prev_avg: i128, prev_size: i128, price: i128, size: i128) -> i128 {
    if prev_size + size == 0 {
        return 0;
    }
    crate::fixed::mul_div(prev_avg, prev_size, prev_size + size)
        + crate::fixed::mul_div(price, size, prev_size + size)
}
