// Market-stats repository: one rollup hash per token.

use std::collections::HashMap;
use std::sync::Arc;

use super::position::millis;
use super::{field, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::MarketStats;

#[derive(Clone)]
pub struct MarketStatsRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl MarketStatsRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn get(&self, token: &str) -> EngineResult<MarketStats> {
        let map = self.store.hgetall(&self.keys.market_stats(token)).await?;
        if map.is_empty() {
            return Ok(MarketStats::empty(token));
        }
        Ok(from_fields(token, &map))
    }

    pub async fn save(&self, stats: &MarketStats) -> EngineResult<()> {
        self.store
            .hset(&self.keys.market_stats(&stats.token), &to_fields(stats))
            .await
    }
}

fn to_fields(s: &MarketStats) -> Fields {
    vec![
        field("token", &s.token),
        field("lastPrice", s.last_price),
        field("markPrice", s.mark_price),
        field("indexPrice", s.index_price),
        field("high24h", s.high_24h),
        field("low24h", s.low_24h),
        field("volume24h", s.volume_24h),
        field("openInterestLong", s.open_interest_long),
        field("openInterestShort", s.open_interest_short),
        field("fundingRate", s.funding_rate),
        field("nextFundingTime", s.next_funding_time.timestamp_millis()),
        field("updatedAt", s.updated_at.timestamp_millis()),
    ]
}

fn from_fields(token: &str, map: &HashMap<String, String>) -> MarketStats {
    let stored = read_string(map, "token", &["symbol"]);
    MarketStats {
        token: if stored.is_empty() {
            token.to_string()
        } else {
            stored
        },
        last_price: read_i128(map, "lastPrice", &[]),
        mark_price: read_i128(map, "markPrice", &[]),
        index_price: read_i128(map, "indexPrice", &[]),
        high_24h: read_i128(map, "high24h", &[]),
        low_24h: read_i128(map, "low24h", &[]),
        volume_24h: read_i128(map, "volume24h", &[]),
        open_interest_long: read_i128(map, "openInterestLong", &[]),
        open_interest_short: read_i128(map, "openInterestShort", &[]),
        funding_rate: read_i128(map, "fundingRate", &[]),
        next_funding_time: millis(read_i128(map, "nextFundingTime", &[])),
        updated_at: millis(read_i128(map, "updatedAt", &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::PRICE_SCALE;
    use chrono::Utc;

    #[tokio::test]
    async fn roundtrip_and_default() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = MarketStatsRepo::new(store, Arc::new(Keys::new("t")));
        let token = "0xbbb0000000000000000000000000000000000002";

        let empty = repo.get(token).await.unwrap();
        assert_eq!(empty.last_price, 0);

        let mut stats = MarketStats::empty(token);
        stats.last_price = 42 * PRICE_SCALE;
        stats.next_funding_time = Utc::now();
        repo.save(&stats).await.unwrap();

        let back = repo.get(token).await.unwrap();
        assert_eq!(back.last_price, 42 * PRICE_SCALE);
    }
}
