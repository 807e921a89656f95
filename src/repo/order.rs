// Order repository: hash per order, per-token pending set, price-sorted
// trigger indexes for conditional orders, per-user nonce replay set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::position::millis;
use super::{bool_field, field, read_bool, read_i128, read_string, Fields, Keys};
use crate::error::{EngineError, EngineResult};
use crate::fixed::price_to_score;
use crate::store::SharedStore;
use crate::types::{Order, OrderSide, OrderStatus, OrderType, TimeInForce};

/// Terminal orders stay readable for this long before the sweeper drops them.
const ARCHIVE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct OrderRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl OrderRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn save(&self, order: &Order) -> EngineResult<()> {
        let id = order.id.to_string();
        self.store.hset(&self.keys.order(&id), &to_fields(order)).await?;
        if order.status.is_open() {
            self.store
                .sadd(&self.keys.pending_orders(&order.token), &id)
                .await?;
        } else {
            self.store
                .srem(&self.keys.pending_orders(&order.token), &id)
                .await?;
            self.store.expire(&self.keys.order(&id), ARCHIVE_TTL).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> EngineResult<Option<Order>> {
        let map = self.store.hgetall(&self.keys.order(&id.to_string())).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(from_fields(&map)))
    }

    pub async fn pending_for_token(&self, token: &str) -> EngineResult<Vec<Order>> {
        let ids = self.store.smembers(&self.keys.pending_orders(token)).await?;
        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(parsed) = Uuid::parse_str(&id) {
                if let Some(order) = self.get(&parsed).await? {
                    if order.status.is_open() {
                        orders.push(order);
                    }
                }
            }
        }
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// Record a nonce; false means replay.
    pub async fn record_nonce(&self, trader: &str, nonce: u64) -> EngineResult<bool> {
        self.store
            .sadd(&self.keys.nonces(trader), &nonce.to_string())
            .await
    }

    /// Index a conditional order by trigger price. Prices above the f64
    /// score bound are rejected at ingress, so this only fails on a race.
    pub async fn index_trigger(&self, order: &Order) -> EngineResult<()> {
        let score = price_to_score(order.trigger_price).ok_or_else(|| {
            EngineError::Validation(format!(
                "trigger price {} exceeds representable maximum",
                order.trigger_price
            ))
        })?;
        let key = self.trigger_key(&order.token, order.side);
        self.store.zadd(&key, score, &order.id.to_string()).await
    }

    pub async fn deindex_trigger(&self, order: &Order) -> EngineResult<()> {
        let key = self.trigger_key(&order.token, order.side);
        self.store.zrem(&key, &order.id.to_string()).await?;
        Ok(())
    }

    /// Conditional orders activated by the current price. Long triggers fire
    /// when the price falls to or below the trigger (score >= price); short
    /// triggers when it rises to or above (score <= price).
    pub async fn triggered_ids(
        &self,
        token: &str,
        side: OrderSide,
        current_price: i128,
    ) -> EngineResult<Vec<Uuid>> {
        let score = match price_to_score(current_price) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        let key = self.trigger_key(token, side);
        let ids = match side {
            OrderSide::Long => self.store.zrangebyscore(&key, score, f64::INFINITY).await?,
            OrderSide::Short => {
                self.store
                    .zrangebyscore(&key, f64::NEG_INFINITY, score)
                    .await?
            }
        };
        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }

    fn trigger_key(&self, token: &str, side: OrderSide) -> String {
        match side {
            OrderSide::Long => self.keys.trigger_long(token),
            OrderSide::Short => self.keys.trigger_short(token),
        }
    }
}

pub(crate) fn to_fields(o: &Order) -> Fields {
    vec![
        field("id", o.id),
        field("trader", &o.trader),
        field("token", &o.token),
        field("side", o.side.as_str()),
        field("size", o.size),
        field("price", o.price),
        field("leverage", o.leverage),
        field("margin", o.margin),
        field("orderType", o.order_type.as_str()),
        field("timeInForce", o.time_in_force.as_str()),
        field("reduceOnly", bool_field(o.reduce_only)),
        field("postOnly", bool_field(o.post_only)),
        field("triggerPrice", o.trigger_price),
        field("filledSize", o.filled_size),
        field("avgFillPrice", o.avg_fill_price),
        field("status", o.status.as_str()),
        field("reason", o.reason.clone().unwrap_or_default()),
        field(
            "deadline",
            o.deadline.map(|d| d.timestamp_millis()).unwrap_or(0),
        ),
        field("nonce", o.nonce),
        field("signature", &o.signature),
        field("createdAt", o.created_at.timestamp_millis()),
        field("updatedAt", o.updated_at.timestamp_millis()),
    ]
}

pub(crate) fn from_fields(map: &HashMap<String, String>) -> Order {
    let deadline_ms = read_i128(map, "deadline", &[]);
    let reason = read_string(map, "reason", &[]);
    Order {
        id: Uuid::parse_str(&read_string(map, "id", &[])).unwrap_or_default(),
        trader: read_string(map, "trader", &["userAddress"]),
        token: read_string(map, "token", &["symbol"]),
        side: OrderSide::parse(&read_string(map, "side", &[])).unwrap_or(OrderSide::Long),
        size: read_i128(map, "size", &[]),
        price: read_i128(map, "price", &[]),
        leverage: read_i128(map, "leverage", &[]),
        margin: read_i128(map, "margin", &[]),
        order_type: OrderType::parse(&read_string(map, "orderType", &[]))
            .unwrap_or(OrderType::Limit),
        time_in_force: TimeInForce::parse(&read_string(map, "timeInForce", &[]))
            .unwrap_or(TimeInForce::Gtc),
        reduce_only: read_bool(map, "reduceOnly"),
        post_only: read_bool(map, "postOnly"),
        trigger_price: read_i128(map, "triggerPrice", &[]),
        filled_size: read_i128(map, "filledSize", &[]),
        avg_fill_price: read_i128(map, "avgFillPrice", &[]),
        status: OrderStatus::parse(&read_string(map, "status", &[])).unwrap_or(OrderStatus::Pending),
        reason: if reason.is_empty() { None } else { Some(reason) },
        deadline: if deadline_ms == 0 {
            None
        } else {
            Some(millis(deadline_ms))
        },
        nonce: read_i128(map, "nonce", &[]) as u64,
        signature: read_string(map, "signature", &[]),
        created_at: millis(read_i128(map, "createdAt", &[])),
        updated_at: millis(read_i128(map, "updatedAt", &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{PRICE_SCALE, SIZE_SCALE};
    use chrono::Utc;

    fn sample(token: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            trader: "0xaaa0000000000000000000000000000000000001".into(),
            token: token.into(),
            side: OrderSide::Long,
            size: SIZE_SCALE,
            price: 2 * PRICE_SCALE,
            leverage: 100_000,
            margin: PRICE_SCALE / 5,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
            trigger_price: 0,
            filled_size: 0,
            avg_fill_price: 0,
            status: OrderStatus::Pending,
            reason: None,
            deadline: None,
            nonce: 1,
            signature: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fields_roundtrip() {
        let mut o = sample("0xbbb0000000000000000000000000000000000002");
        o.deadline = Some(Utc::now());
        o.reason = Some("bad signature".into());
        let map: HashMap<String, String> = to_fields(&o).into_iter().collect();
        let back = from_fields(&map);
        assert_eq!(back.id, o.id);
        assert_eq!(back.side, o.side);
        assert_eq!(back.price, o.price);
        assert_eq!(back.time_in_force, o.time_in_force);
        assert_eq!(back.reason.as_deref(), Some("bad signature"));
        assert!(back.deadline.is_some());
    }

    #[tokio::test]
    async fn pending_index_follows_status() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = OrderRepo::new(store, Arc::new(Keys::new("t")));
        let token = "0xbbb0000000000000000000000000000000000002";
        let mut o = sample(token);
        repo.save(&o).await.unwrap();
        assert_eq!(repo.pending_for_token(token).await.unwrap().len(), 1);

        o.status = OrderStatus::Cancelled;
        repo.save(&o).await.unwrap();
        assert!(repo.pending_for_token(token).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nonce_replay_detected() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = OrderRepo::new(store, Arc::new(Keys::new("t")));
        assert!(repo.record_nonce("0xa", 7).await.unwrap());
        assert!(!repo.record_nonce("0xa", 7).await.unwrap());
        assert!(repo.record_nonce("0xa", 8).await.unwrap());
    }

    #[tokio::test]
    async fn trigger_index_fires_by_side() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = OrderRepo::new(store, Arc::new(Keys::new("t")));
        let token = "0xbbb0000000000000000000000000000000000002";

        // Short-side take-profit at 150: fires once price reaches 150.
        let mut tp = sample(token);
        tp.side = OrderSide::Short;
        tp.order_type = OrderType::TakeProfit;
        tp.trigger_price = 150 * PRICE_SCALE;
        repo.index_trigger(&tp).await.unwrap();

        let quiet = repo
            .triggered_ids(token, OrderSide::Short, 149 * PRICE_SCALE)
            .await
            .unwrap();
        assert!(quiet.is_empty());

        let fired = repo
            .triggered_ids(token, OrderSide::Short, 150 * PRICE_SCALE)
            .await
            .unwrap();
        assert_eq!(fired, vec![tp.id]);

        repo.deindex_trigger(&tp).await.unwrap();
        let gone = repo
            .triggered_ids(token, OrderSide::Short, 150 * PRICE_SCALE)
            .await
            .unwrap();
        assert!(gone.is_empty());
    }
}
