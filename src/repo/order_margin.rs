// Order-margin bookkeeping: per-order frozen margin and fee reserve, 7-day
// TTL, indexed in a process-wide set so a sweeper can reap leaked records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::position::millis;
use super::{field, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::OrderMargin;

const MARGIN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct OrderMarginRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl OrderMarginRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn save(&self, margin: &OrderMargin) -> EngineResult<()> {
        let id = margin.order_id.to_string();
        let key = self.keys.order_margin(&id);
        self.store.hset(&key, &to_fields(margin)).await?;
        self.store.expire(&key, MARGIN_TTL).await?;
        self.store.sadd(&self.keys.order_margins_all(), &id).await?;
        Ok(())
    }

    pub async fn get(&self, order_id: &Uuid) -> EngineResult<Option<OrderMargin>> {
        let map = self
            .store
            .hgetall(&self.keys.order_margin(&order_id.to_string()))
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(from_fields(&map)))
    }

    pub async fn remove(&self, order_id: &Uuid) -> EngineResult<()> {
        let id = order_id.to_string();
        self.store.del(&self.keys.order_margin(&id)).await?;
        self.store.srem(&self.keys.order_margins_all(), &id).await?;
        Ok(())
    }

    /// Ids currently in the cleanup index; records whose hash already
    /// expired show up here as dangling and should be dropped by the sweep.
    pub async fn all_ids(&self) -> EngineResult<Vec<Uuid>> {
        let ids = self.store.smembers(&self.keys.order_margins_all()).await?;
        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }

    /// Drop index entries whose backing hash has expired.
    pub async fn sweep(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for id in self.all_ids().await? {
            if self.get(&id).await?.is_none() {
                self.store
                    .srem(&self.keys.order_margins_all(), &id.to_string())
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn to_fields(m: &OrderMargin) -> Fields {
    vec![
        field("orderId", m.order_id),
        field("trader", &m.trader),
        field("token", &m.token),
        field("frozenMargin", m.frozen_margin),
        field("feeReserve", m.fee_reserve),
        field("settledSize", m.settled_size),
        field("createdAt", m.created_at.timestamp_millis()),
    ]
}

fn from_fields(map: &HashMap<String, String>) -> OrderMargin {
    OrderMargin {
        order_id: Uuid::parse_str(&read_string(map, "orderId", &[])).unwrap_or_default(),
        trader: read_string(map, "trader", &["userAddress"]),
        token: read_string(map, "token", &["symbol"]),
        frozen_margin: read_i128(map, "frozenMargin", &[]),
        fee_reserve: read_i128(map, "feeReserve", &[]),
        settled_size: read_i128(map, "settledSize", &[]),
        created_at: millis(read_i128(map, "createdAt", &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::PRICE_SCALE;
    use chrono::Utc;

    #[tokio::test]
    async fn save_get_remove() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = OrderMarginRepo::new(store, Arc::new(Keys::new("t")));
        let m = OrderMargin {
            order_id: Uuid::new_v4(),
            trader: "0xa".into(),
            token: "0xb".into(),
            frozen_margin: PRICE_SCALE,
            fee_reserve: PRICE_SCALE / 100,
            settled_size: 0,
            created_at: Utc::now(),
        };
        repo.save(&m).await.unwrap();
        assert!(repo.get(&m.order_id).await.unwrap().is_some());
        assert_eq!(repo.all_ids().await.unwrap().len(), 1);

        repo.remove(&m.order_id).await.unwrap();
        assert!(repo.get(&m.order_id).await.unwrap().is_none());
        assert!(repo.all_ids().await.unwrap().is_empty());
    }
}
