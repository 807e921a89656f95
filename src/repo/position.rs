// Position repository: hash per position plus user/token/global index sets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::{bool_field, field, read_bool, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::{MarginMode, Position, PositionStatus, RiskLevel};

/// Closed and liquidated positions stay readable for this long.
const ARCHIVE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct PositionRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl PositionRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn save(&self, position: &Position) -> EngineResult<()> {
        let id = position.id.to_string();
        self.store
            .hset(&self.keys.position(&id), &to_fields(position))
            .await?;
        if position.status == PositionStatus::Open {
            self.store
                .sadd(&self.keys.user_positions(&position.trader), &id)
                .await?;
            self.store
                .sadd(&self.keys.token_positions(&position.token), &id)
                .await?;
            self.store.sadd(&self.keys.positions_all(), &id).await?;
        } else {
            self.deindex(position).await?;
            self.store
                .expire(&self.keys.position(&id), ARCHIVE_TTL)
                .await?;
        }
        Ok(())
    }

    async fn deindex(&self, position: &Position) -> EngineResult<()> {
        let id = position.id.to_string();
        self.store
            .srem(&self.keys.user_positions(&position.trader), &id)
            .await?;
        self.store
            .srem(&self.keys.token_positions(&position.token), &id)
            .await?;
        self.store.srem(&self.keys.positions_all(), &id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> EngineResult<Option<Position>> {
        let map = self.store.hgetall(&self.keys.position(&id.to_string())).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(from_fields(&map)))
    }

    /// The open position of a trader on a token, if any.
    pub async fn open_for(&self, trader: &str, token: &str) -> EngineResult<Option<Position>> {
        let ids = self.store.smembers(&self.keys.user_positions(trader)).await?;
        for id in ids {
            if let Ok(parsed) = Uuid::parse_str(&id) {
                if let Some(position) = self.get(&parsed).await? {
                    if position.token == token && position.is_open() {
                        return Ok(Some(position));
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn open_positions(&self) -> EngineResult<Vec<Position>> {
        self.collect(&self.keys.positions_all()).await
    }

    pub async fn open_for_token(&self, token: &str) -> EngineResult<Vec<Position>> {
        self.collect(&self.keys.token_positions(token)).await
    }

    pub async fn open_for_user(&self, trader: &str) -> EngineResult<Vec<Position>> {
        self.collect(&self.keys.user_positions(trader)).await
    }

    async fn collect(&self, index_key: &str) -> EngineResult<Vec<Position>> {
        let ids = self.store.smembers(index_key).await?;
        let mut positions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(parsed) = Uuid::parse_str(&id) {
                if let Some(position) = self.get(&parsed).await? {
                    if position.is_open() {
                        positions.push(position);
                    }
                }
            }
        }
        Ok(positions)
    }

    /// Batched risk-indicator write-back; one pipelined store round-trip.
    pub async fn write_risk_batch(&self, updates: &[(Uuid, Fields)]) -> EngineResult<()> {
        let entries: Vec<(String, Fields)> = updates
            .iter()
            .map(|(id, fields)| (self.keys.position(&id.to_string()), fields.clone()))
            .collect();
        self.store.hset_batch(&entries).await
    }

    /// Mirror a liquidation candidate into the per-token sorted index,
    /// scored by margin ratio so the most distressed sort last.
    pub async fn index_liquidation_candidate(&self, position: &Position) -> EngineResult<()> {
        let key = self.liquidation_key(&position.token, position.is_long);
        self.store
            .zadd(&key, position.margin_ratio as f64, &position.id.to_string())
            .await
    }

    pub async fn deindex_liquidation_candidate(&self, position: &Position) -> EngineResult<()> {
        let key = self.liquidation_key(&position.token, position.is_long);
        self.store.zrem(&key, &position.id.to_string()).await?;
        Ok(())
    }

    fn liquidation_key(&self, token: &str, is_long: bool) -> String {
        if is_long {
            self.keys.liquidation_long(token)
        } else {
            self.keys.liquidation_short(token)
        }
    }

    /// Claim the liquidation latch for a position. Only one claimer wins;
    /// the latch expires on its own should the liquidation task die.
    pub async fn claim_liquidation(&self, id: &Uuid) -> EngineResult<bool> {
        let key = self.keys.lock(&format!("liquidate:{}", id));
        let claimed = self
            .store
            .set_if_absent(&key, "1", Duration::from_secs(60))
            .await?;
        if claimed {
            self.store
                .hset(
                    &self.keys.position(&id.to_string()),
                    &[field("isLiquidating", "1")],
                )
                .await?;
        }
        Ok(claimed)
    }

    /// Drop the latch and clear the flag so the next risk cycle may
    /// re-enqueue the position.
    pub async fn release_liquidation(&self, id: &Uuid) -> EngineResult<()> {
        let key = self.keys.lock(&format!("liquidate:{}", id));
        self.store.del(&key).await?;
        self.store
            .hset(
                &self.keys.position(&id.to_string()),
                &[field("isLiquidating", "0")],
            )
            .await?;
        Ok(())
    }
}

pub(crate) fn to_fields(p: &Position) -> Fields {
    vec![
        field("id", p.id),
        field("trader", &p.trader),
        field("token", &p.token),
        field("counterparty", p.counterparty.clone().unwrap_or_default()),
        field("isLong", bool_field(p.is_long)),
        field("size", p.size),
        field("entryPrice", p.entry_price),
        field("avgEntryPrice", p.avg_entry_price),
        field("leverage", p.leverage),
        field("marginMode", p.margin_mode.code()),
        field("markPrice", p.mark_price),
        field("collateral", p.collateral),
        field("margin", p.margin),
        field("mmr", p.mmr),
        field("maintenanceMargin", p.maintenance_margin),
        field("liquidationPrice", p.liquidation_price),
        field("bankruptcyPrice", p.bankruptcy_price),
        field("breakEvenPrice", p.break_even_price),
        field("unrealizedPnl", p.unrealized_pnl),
        field("realizedPnl", p.realized_pnl),
        field("fundingFee", p.funding_fee),
        field("takeProfitPrice", p.take_profit_price),
        field("stopLossPrice", p.stop_loss_price),
        field("marginRatio", p.margin_ratio),
        field("roe", p.roe),
        field("adlRank", p.adl_rank),
        field("adlScore", p.adl_score),
        field("riskLevel", p.risk_level.as_str()),
        field("isLiquidatable", bool_field(p.is_liquidatable)),
        field("isAdlCandidate", bool_field(p.is_adl_candidate)),
        field("isLiquidating", bool_field(p.is_liquidating)),
        field("fundingIndex", p.funding_index),
        field("status", p.status.code()),
        field("createdAt", p.created_at.timestamp_millis()),
        field("updatedAt", p.updated_at.timestamp_millis()),
    ]
}

pub(crate) fn from_fields(map: &HashMap<String, String>) -> Position {
    let counterparty = read_string(map, "counterparty", &[]);
    Position {
        id: Uuid::parse_str(&read_string(map, "id", &[])).unwrap_or_default(),
        // Older writers stored userAddress/symbol; accept both, emit new only.
        trader: read_string(map, "trader", &["userAddress"]),
        token: read_string(map, "token", &["symbol"]),
        counterparty: if counterparty.is_empty() {
            None
        } else {
            Some(counterparty)
        },
        is_long: read_bool(map, "isLong"),
        size: read_i128(map, "size", &[]),
        entry_price: read_i128(map, "entryPrice", &[]),
        avg_entry_price: read_i128(map, "avgEntryPrice", &[]),
        leverage: read_i128(map, "leverage", &[]),
        margin_mode: MarginMode::from_code(read_i128(map, "marginMode", &[])),
        mark_price: read_i128(map, "markPrice", &[]),
        collateral: read_i128(map, "collateral", &["initialMargin"]),
        margin: read_i128(map, "margin", &[]),
        mmr: read_i128(map, "mmr", &[]),
        maintenance_margin: read_i128(map, "maintenanceMargin", &[]),
        liquidation_price: read_i128(map, "liquidationPrice", &[]),
        bankruptcy_price: read_i128(map, "bankruptcyPrice", &[]),
        break_even_price: read_i128(map, "breakEvenPrice", &[]),
        unrealized_pnl: read_i128(map, "unrealizedPnl", &[]),
        realized_pnl: read_i128(map, "realizedPnl", &[]),
        funding_fee: read_i128(map, "fundingFee", &[]),
        take_profit_price: read_i128(map, "takeProfitPrice", &[]),
        stop_loss_price: read_i128(map, "stopLossPrice", &[]),
        margin_ratio: read_i128(map, "marginRatio", &[]),
        roe: read_i128(map, "roe", &[]),
        adl_rank: read_i128(map, "adlRank", &[]) as u8,
        adl_score: read_i128(map, "adlScore", &[]),
        risk_level: RiskLevel::parse(&read_string(map, "riskLevel", &[])).unwrap_or(RiskLevel::Low),
        is_liquidatable: read_bool(map, "isLiquidatable"),
        is_adl_candidate: read_bool(map, "isAdlCandidate"),
        is_liquidating: read_bool(map, "isLiquidating"),
        funding_index: read_i128(map, "fundingIndex", &[]),
        status: PositionStatus::from_code(read_i128(map, "status", &[])),
        created_at: millis(read_i128(map, "createdAt", &[])),
        updated_at: millis(read_i128(map, "updatedAt", &[])),
    }
}

pub(crate) fn millis(ms: i128) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{PRICE_SCALE, SIZE_SCALE};
    use crate::types::{MarginMode, PositionStatus, RiskLevel};

    fn sample() -> Position {
        Position {
            id: Uuid::new_v4(),
            trader: "0xaaa0000000000000000000000000000000000001".into(),
            token: "0xbbb0000000000000000000000000000000000002".into(),
            counterparty: None,
            is_long: true,
            size: SIZE_SCALE,
            entry_price: 100 * PRICE_SCALE,
            avg_entry_price: 100 * PRICE_SCALE,
            leverage: 100_000,
            margin_mode: MarginMode::Isolated,
            mark_price: 101 * PRICE_SCALE,
            collateral: 10 * PRICE_SCALE,
            margin: 11 * PRICE_SCALE,
            mmr: 500,
            maintenance_margin: PRICE_SCALE,
            liquidation_price: 91 * PRICE_SCALE,
            bankruptcy_price: 90 * PRICE_SCALE,
            break_even_price: 100 * PRICE_SCALE,
            unrealized_pnl: PRICE_SCALE,
            realized_pnl: 0,
            funding_fee: -12345,
            take_profit_price: 0,
            stop_loss_price: 0,
            margin_ratio: 450,
            roe: 1000,
            adl_rank: 3,
            adl_score: 42,
            risk_level: RiskLevel::Low,
            is_liquidatable: false,
            is_adl_candidate: true,
            is_liquidating: false,
            funding_index: 7,
            status: PositionStatus::Open,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fields_roundtrip() {
        let p = sample();
        let map: HashMap<String, String> = to_fields(&p).into_iter().collect();
        let back = from_fields(&map);
        assert_eq!(back.id, p.id);
        assert_eq!(back.trader, p.trader);
        assert_eq!(back.size, p.size);
        assert_eq!(back.collateral, p.collateral);
        assert_eq!(back.funding_fee, p.funding_fee);
        assert_eq!(back.adl_rank, p.adl_rank);
        assert_eq!(back.risk_level, p.risk_level);
        assert_eq!(back.status, p.status);
        assert!(back.is_adl_candidate);
    }

    #[test]
    fn reader_accepts_legacy_names() {
        let p = sample();
        let mut map: HashMap<String, String> = to_fields(&p).into_iter().collect();
        map.remove("trader");
        map.remove("token");
        map.remove("collateral");
        map.insert("userAddress".into(), p.trader.clone());
        map.insert("symbol".into(), p.token.clone());
        map.insert("initialMargin".into(), p.collateral.to_string());
        let back = from_fields(&map);
        assert_eq!(back.trader, p.trader);
        assert_eq!(back.token, p.token);
        assert_eq!(back.collateral, p.collateral);
    }

    #[tokio::test]
    async fn save_indexes_open_and_deindexes_closed() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = PositionRepo::new(store.clone(), Arc::new(Keys::new("t")));
        let mut p = sample();
        repo.save(&p).await.unwrap();
        assert_eq!(repo.open_positions().await.unwrap().len(), 1);
        assert!(repo.open_for(&p.trader, &p.token).await.unwrap().is_some());

        p.size = 0;
        p.status = PositionStatus::Closed;
        repo.save(&p).await.unwrap();
        assert!(repo.open_positions().await.unwrap().is_empty());
        assert!(repo.open_for(&p.trader, &p.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn liquidation_latch_is_exclusive() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = PositionRepo::new(store, Arc::new(Keys::new("t")));
        let p = sample();
        repo.save(&p).await.unwrap();
        assert!(repo.claim_liquidation(&p.id).await.unwrap());
        assert!(!repo.claim_liquidation(&p.id).await.unwrap());
        let reloaded = repo.get(&p.id).await.unwrap().unwrap();
        assert!(reloaded.is_liquidating);
    }
}
