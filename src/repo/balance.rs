// Balance repository. Singleton hash per trader, created on first read.

use std::collections::HashMap;
use std::sync::Arc;

use super::position::millis;
use super::{field, read_i128, read_string, Fields, Keys};
use crate::error::EngineResult;
use crate::store::SharedStore;
use crate::types::Balance;

#[derive(Clone)]
pub struct BalanceRepo {
    store: SharedStore,
    keys: Arc<Keys>,
}

impl BalanceRepo {
    pub fn new(store: SharedStore, keys: Arc<Keys>) -> Self {
        Self { store, keys }
    }

    pub async fn get(&self, trader: &str) -> EngineResult<Balance> {
        let map = self.store.hgetall(&self.keys.balance(trader)).await?;
        if map.is_empty() {
            return Ok(Balance::empty(trader));
        }
        Ok(from_fields(trader, &map))
    }

    pub async fn save(&self, balance: &Balance) -> EngineResult<()> {
        self.store
            .hset(&self.keys.balance(&balance.trader), &to_fields(balance))
            .await
    }
}

fn to_fields(b: &Balance) -> Fields {
    vec![
        field("trader", &b.trader),
        field("walletBalance", b.wallet_balance),
        field("frozenMargin", b.frozen_margin),
        field("usedMargin", b.used_margin),
        field("unrealizedPnl", b.unrealized_pnl),
        field("availableBalance", b.available()),
        field("equity", b.equity()),
        field("updatedAt", b.updated_at.timestamp_millis()),
    ]
}

fn from_fields(trader: &str, map: &HashMap<String, String>) -> Balance {
    let stored = read_string(map, "trader", &["userAddress"]);
    Balance {
        trader: if stored.is_empty() {
            trader.to_string()
        } else {
            stored
        },
        wallet_balance: read_i128(map, "walletBalance", &[]),
        frozen_margin: read_i128(map, "frozenMargin", &[]),
        used_margin: read_i128(map, "usedMargin", &[]),
        unrealized_pnl: read_i128(map, "unrealizedPnl", &[]),
        updated_at: millis(read_i128(map, "updatedAt", &[])),
    }
}
