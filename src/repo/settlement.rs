// Settlement-log repository: append-only journal hashes plus a newest-first
// per-trader list capped at 1000 entries.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use super::position::millis;
use super::{field, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::{OnChainStatus, SettlementLog, SettlementType};

const LIST_CAP: i64 = 1000;

#[derive(Clone)]
pub struct SettlementRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl SettlementRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn append(&self, log: &SettlementLog) -> EngineResult<()> {
        let id = log.id.to_string();
        self.store
            .hset(&self.keys.settlement(&id), &to_fields(log))
            .await?;
        let list_key = self.keys.user_settlements(&log.trader);
        self.store.lpush(&list_key, &id).await?;
        self.store.ltrim(&list_key, 0, LIST_CAP - 1).await?;
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> EngineResult<Option<SettlementLog>> {
        let map = self
            .store
            .hgetall(&self.keys.settlement(&id.to_string()))
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(from_fields(&map)))
    }

    /// Newest-first journal entries for a trader.
    pub async fn list_for(&self, trader: &str, limit: usize) -> EngineResult<Vec<SettlementLog>> {
        let ids = self
            .store
            .lrange(&self.keys.user_settlements(trader), 0, limit as i64 - 1)
            .await?;
        let mut logs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(parsed) = Uuid::parse_str(&id) {
                if let Some(log) = self.get(&parsed).await? {
                    logs.push(log);
                }
            }
        }
        Ok(logs)
    }

    /// Proof-submitter feedback path.
    pub async fn set_on_chain_status(&self, id: &Uuid, status: OnChainStatus) -> EngineResult<()> {
        self.store
            .hset(
                &self.keys.settlement(&id.to_string()),
                &[field("onChainStatus", status.as_str())],
            )
            .await
    }
}

fn to_fields(log: &SettlementLog) -> Fields {
    vec![
        field("id", log.id),
        field("trader", &log.trader),
        field("token", log.token.clone().unwrap_or_default()),
        field("amount", log.amount),
        field("balanceBefore", log.balance_before),
        field("balanceAfter", log.balance_after),
        field("type", log.log_type.as_str()),
        field("onChainStatus", log.on_chain_status.as_str()),
        field("proof", &log.proof),
        field("signature", &log.signature),
        field("createdAt", log.created_at.timestamp_millis()),
    ]
}

fn from_fields(map: &HashMap<String, String>) -> SettlementLog {
    let token = read_string(map, "token", &["symbol"]);
    SettlementLog {
        id: Uuid::parse_str(&read_string(map, "id", &[])).unwrap_or_default(),
        trader: read_string(map, "trader", &["userAddress"]),
        token: if token.is_empty() { None } else { Some(token) },
        amount: read_i128(map, "amount", &[]),
        balance_before: read_i128(map, "balanceBefore", &[]),
        balance_after: read_i128(map, "balanceAfter", &[]),
        log_type: SettlementType::parse(&read_string(map, "type", &[]))
            .unwrap_or(SettlementType::SettlePnl),
        on_chain_status: OnChainStatus::parse(&read_string(map, "onChainStatus", &[]))
            .unwrap_or(OnChainStatus::Pending),
        proof: read_string(map, "proof", &[]),
        signature: read_string(map, "signature", &[]),
        created_at: millis(read_i128(map, "createdAt", &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(trader: &str, amount: i128) -> SettlementLog {
        let mut log = SettlementLog {
            id: Uuid::new_v4(),
            trader: trader.into(),
            token: None,
            amount,
            balance_before: 100,
            balance_after: 100 + amount,
            log_type: SettlementType::Deposit,
            on_chain_status: OnChainStatus::Pending,
            proof: "{}".into(),
            signature: String::new(),
            created_at: Utc::now(),
        };
        log.signature = log.sign_digest();
        log
    }

    #[tokio::test]
    async fn append_is_newest_first() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = SettlementRepo::new(store, Arc::new(Keys::new("t")));
        let first = sample("0xa", 1);
        let second = sample("0xa", 2);
        repo.append(&first).await.unwrap();
        repo.append(&second).await.unwrap();

        let logs = repo.list_for("0xa", 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].id, second.id);
        assert_eq!(logs[1].id, first.id);
    }

    #[tokio::test]
    async fn status_transition_persists() {
        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());
        let repo = SettlementRepo::new(store, Arc::new(Keys::new("t")));
        let log = sample("0xa", 5);
        repo.append(&log).await.unwrap();
        repo.set_on_chain_status(&log.id, OnChainStatus::Submitted)
            .await
            .unwrap();
        let back = repo.get(&log.id).await.unwrap().unwrap();
        assert_eq!(back.on_chain_status, OnChainStatus::Submitted);
        assert_eq!(back.signature, log.signature);
    }
}
