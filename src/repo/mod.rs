// Typed repositories over the durable store. Each entity serializes to a
// store hash with camelCase field names; readers fall back to defaults on
// anything unparseable so a bad field can never take down a read path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::fixed::parse_fixed;
use crate::store::SharedStore;

pub mod balance;
pub mod market;
pub mod order;
pub mod order_margin;
pub mod position;
pub mod settlement;
pub mod trade;

pub use balance::BalanceRepo;
pub use market::MarketStatsRepo;
pub use order::OrderRepo;
pub use order_margin::OrderMarginRepo;
pub use position::PositionRepo;
pub use settlement::SettlementRepo;
pub use trade::TradeRepo;

/// Store key layout under a deployment-configured prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn k(&self, rest: String) -> String {
        if self.prefix.is_empty() {
            rest
        } else {
            format!("{}:{}", self.prefix, rest)
        }
    }

    pub fn position(&self, id: &str) -> String {
        self.k(format!("position:{}", id))
    }
    pub fn user_positions(&self, trader: &str) -> String {
        self.k(format!("user:{}:positions", trader))
    }
    pub fn token_positions(&self, token: &str) -> String {
        self.k(format!("token:{}:positions", token))
    }
    pub fn positions_all(&self) -> String {
        self.k("positions:all".to_string())
    }

    pub fn order(&self, id: &str) -> String {
        self.k(format!("order:{}", id))
    }
    pub fn pending_orders(&self, token: &str) -> String {
        self.k(format!("token:{}:orders:pending", token))
    }
    pub fn trigger_long(&self, token: &str) -> String {
        self.k(format!("trigger:long:{}", token))
    }
    pub fn trigger_short(&self, token: &str) -> String {
        self.k(format!("trigger:short:{}", token))
    }
    pub fn liquidation_long(&self, token: &str) -> String {
        self.k(format!("liquidation:long:{}", token))
    }
    pub fn liquidation_short(&self, token: &str) -> String {
        self.k(format!("liquidation:short:{}", token))
    }

    pub fn balance(&self, trader: &str) -> String {
        self.k(format!("balance:{}", trader))
    }
    pub fn nonces(&self, trader: &str) -> String {
        self.k(format!("user:{}:nonces", trader))
    }

    pub fn settlement(&self, id: &str) -> String {
        self.k(format!("settlement:{}", id))
    }
    pub fn user_settlements(&self, trader: &str) -> String {
        self.k(format!("user:{}:settlements", trader))
    }

    pub fn trade(&self, id: &str) -> String {
        self.k(format!("perp:trade:{}", id))
    }
    pub fn user_trades(&self, trader: &str) -> String {
        self.k(format!("user:{}:perp_trades", trader))
    }
    pub fn token_trades(&self, token: &str) -> String {
        self.k(format!("token:{}:perp_trades", token))
    }

    pub fn market_stats(&self, token: &str) -> String {
        self.k(format!("market:{}:stats", token))
    }

    pub fn order_margin(&self, id: &str) -> String {
        self.k(format!("order_margin:{}", id))
    }
    pub fn order_margins_all(&self) -> String {
        self.k("order_margins:all".to_string())
    }

    pub fn lock(&self, resource: &str) -> String {
        self.k(format!("lock:{}", resource))
    }
}

pub(crate) type Fields = Vec<(String, String)>;

pub(crate) fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// Read an i128 field; `legacy` names are accepted when the primary is
/// absent (older writers used them). Unparseable values fall back to 0.
pub(crate) fn read_i128(map: &HashMap<String, String>, name: &str, legacy: &[&str]) -> i128 {
    if let Some(raw) = map.get(name) {
        return parse_fixed(raw, 0);
    }
    for alias in legacy {
        if let Some(raw) = map.get(*alias) {
            return parse_fixed(raw, 0);
        }
    }
    0
}

pub(crate) fn read_string(map: &HashMap<String, String>, name: &str, legacy: &[&str]) -> String {
    if let Some(v) = map.get(name) {
        return v.clone();
    }
    for alias in legacy {
        if let Some(v) = map.get(*alias) {
            return v.clone();
        }
    }
    String::new()
}

pub(crate) fn read_bool(map: &HashMap<String, String>, name: &str) -> bool {
    matches!(map.get(name).map(|s| s.as_str()), Some("1") | Some("true"))
}

pub(crate) fn bool_field(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// All repositories share one store handle and one key layout.
#[derive(Clone)]
pub struct Repositories {
    pub keys: Arc<Keys>,
    pub positions: PositionRepo,
    pub orders: OrderRepo,
    pub balances: BalanceRepo,
    pub trades: TradeRepo,
    pub settlements: SettlementRepo,
    pub market_stats: MarketStatsRepo,
    pub order_margins: OrderMarginRepo,
}

impl Repositories {
    pub fn new(store: SharedStore, prefix: &str) -> Self {
        let keys = Arc::new(Keys::new(prefix));
        Self {
            positions: PositionRepo::new(store.clone(), keys.clone()),
            orders: OrderRepo::new(store.clone(), keys.clone()),
            balances: BalanceRepo::new(store.clone(), keys.clone()),
            trades: TradeRepo::new(store.clone(), keys.clone()),
            settlements: SettlementRepo::new(store.clone(), keys.clone()),
            market_stats: MarketStatsRepo::new(store.clone(), keys.clone()),
            order_margins: OrderMarginRepo::new(store, keys.clone()),
            keys,
        }
    }
}
