// Trade repository: 30-day hashes plus timestamp-sorted per-user and
// per-token indexes capped at 1000 entries each.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::position::millis;
use super::{bool_field, field, read_bool, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::{Trade, TradeType};

const TRADE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const INDEX_CAP: u64 = 1000;

#[derive(Clone)]
pub struct TradeRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl TradeRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn save(&self, trade: &Trade) -> EngineResult<()> {
        let id = trade.id.to_string();
        let key = self.keys.trade(&id);
        self.store.hset(&key, &to_fields(trade)).await?;
        self.store.expire(&key, TRADE_TTL).await?;

        let score = trade.created_at.timestamp_millis() as f64;
        self.push_index(&self.keys.user_trades(&trade.trader), score, &id)
            .await?;
        self.push_index(&self.keys.token_trades(&trade.token), score, &id)
            .await?;
        Ok(())
    }

    async fn push_index(&self, key: &str, score: f64, id: &str) -> EngineResult<()> {
        self.store.zadd(key, score, id).await?;
        let count = self.store.zcard(key).await?;
        if count > INDEX_CAP {
            // Drop the oldest entries beyond the cap.
            self.store
                .zremrangebyrank(key, 0, (count - INDEX_CAP - 1) as i64)
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> EngineResult<Option<Trade>> {
        let map = self.store.hgetall(&self.keys.trade(&id.to_string())).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(from_fields(&map)))
    }

    /// Newest-first trades for a trader.
    pub async fn recent_for_user(&self, trader: &str, limit: usize) -> EngineResult<Vec<Trade>> {
        self.recent(&self.keys.user_trades(trader), limit).await
    }

    /// Newest-first trades on a token.
    pub async fn recent_for_token(&self, token: &str, limit: usize) -> EngineResult<Vec<Trade>> {
        self.recent(&self.keys.token_trades(token), limit).await
    }

    async fn recent(&self, index_key: &str, limit: usize) -> EngineResult<Vec<Trade>> {
        let ids = self
            .store
            .zrangebyscore(index_key, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        let mut trades = Vec::new();
        for id in ids.iter().rev().take(limit) {
            if let Ok(parsed) = Uuid::parse_str(id) {
                if let Some(trade) = self.get(&parsed).await? {
                    trades.push(trade);
                }
            }
        }
        Ok(trades)
    }
}

fn to_fields(t: &Trade) -> Fields {
    vec![
        field("id", t.id),
        field("orderId", t.order_id),
        field("token", &t.token),
        field("trader", &t.trader),
        field("isLong", bool_field(t.is_long)),
        field("isMaker", bool_field(t.is_maker)),
        field("size", t.size),
        field("price", t.price),
        field("fee", t.fee),
        field("realizedPnl", t.realized_pnl),
        field("type", t.trade_type.as_str()),
        field("createdAt", t.created_at.timestamp_millis()),
    ]
}

fn from_fields(map: &HashMap<String, String>) -> Trade {
    Trade {
        id: Uuid::parse_str(&read_string(map, "id", &[])).unwrap_or_default(),
        order_id: Uuid::parse_str(&read_string(map, "orderId", &[])).unwrap_or_default(),
        token: read_string(map, "token", &["symbol"]),
        trader: read_string(map, "trader", &["userAddress"]),
        is_long: read_bool(map, "isLong"),
        is_maker: read_bool(map, "isMaker"),
        size: read_i128(map, "size", &[]),
        price: read_i128(map, "price", &[]),
        fee: read_i128(map, "fee", &[]),
        realized_pnl: read_i128(map, "realizedPnl", &[]),
        trade_type: TradeType::parse(&read_string(map, "type", &[])).unwrap_or(TradeType::Normal),
        created_at: millis(read_i128(map, "createdAt", &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{PRICE_SCALE, SIZE_SCALE};
    use chrono::{Duration as ChronoDuration, Utc};

    fn sample(ts_offset_ms: i64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            token: "0xbbb0000000000000000000000000000000000002".into(),
            trader: "0xaaa0000000000000000000000000000000000001".into(),
            is_long: true,
            is_maker: false,
            size: SIZE_SCALE,
            price: 2 * PRICE_SCALE,
            fee: PRICE_SCALE / 1000,
            realized_pnl: 0,
            trade_type: TradeType::Normal,
            created_at: Utc::now() + ChronoDuration::milliseconds(ts_offset_ms),
        }
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = TradeRepo::new(store, Arc::new(Keys::new("t")));
        let older = sample(0);
        let newer = sample(5000);
        repo.save(&older).await.unwrap();
        repo.save(&newer).await.unwrap();

        let recent = repo.recent_for_user(&older.trader, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, newer.id);
        assert_eq!(recent[1].id, older.id);
    }
}
