// Engine configuration, loaded once in main and passed by value.

use std::env;
use std::time::Duration;

/// Margin-ratio formula used by the funding-settlement liquidation check.
/// The leverage-based variant reproduces the production behavior
/// (10000^2 / leverage, independent of current mark); the mark-aware
/// variant revalues at the current book price. Kept switchable instead of
/// silently replacing the historical formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingMarginCheck {
    LeverageBased,
    MarkAware,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection string; unused by the in-memory store.
    pub store_url: String,
    /// Deployment prefix applied to every store key.
    pub key_prefix: String,
    /// Tokens the engine trades at startup.
    pub tokens: Vec<String>,

    /// Funding accrual interval between settlements per token.
    pub funding_interval: Duration,
    /// Poll cadence of the funding scheduler.
    pub funding_poll: Duration,
    /// RATE-scaled funding rate per settlement (1 = 1 basis point).
    pub funding_rate: i128,
    pub funding_margin_check: FundingMarginCheck,

    /// Risk-assessment tick.
    pub risk_tick: Duration,
    /// Store write-back happens every Nth risk tick.
    pub risk_flush_every: u32,
    /// Iterations slower than this are logged as slow ticks.
    pub risk_slow_tick: Duration,
    /// Base maintenance-margin rate cap, basis points.
    pub base_mmr: i128,

    /// Smallest accepted order size, 1e18-scaled.
    pub min_order_size: i128,
    /// RATE-scaled leverage bounds (1x .. max).
    pub min_leverage: i128,
    pub max_leverage: i128,
    /// RATE-scaled fee rates.
    pub taker_fee: i128,
    pub maker_fee: i128,
    /// Share of collected fees routed to the insurance fund, basis points.
    pub insurance_fee_share: i128,

    /// Liquidation price corridor around the mark, basis points. A forced
    /// close only eats book liquidity within this band before ADL kicks in.
    pub liquidation_corridor: i128,
    /// Margin-ratio must stay below safety_multiple * MMR after a
    /// remove-collateral operation.
    pub collateral_safety_multiple: i128,

    /// Lease-lock time-to-live and acquisition retry budget.
    pub lock_ttl: Duration,
    pub lock_retries: u32,

    /// Bounded per-client WS outbound queue; overflow disconnects the client.
    pub ws_outbound_queue: usize,
    /// Market-data push interval.
    pub ws_push_interval: Duration,
    /// Funding-rate frame interval.
    pub ws_funding_interval: Duration,

    /// Listen address for the WebSocket frontage.
    pub listen_addr: String,
    /// Reserved account holding the insurance fund balance.
    pub insurance_account: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "perp".to_string(),
            tokens: Vec::new(),
            funding_interval: Duration::from_secs(300),
            funding_poll: Duration::from_secs(10),
            funding_rate: 1,
            funding_margin_check: FundingMarginCheck::LeverageBased,
            risk_tick: Duration::from_millis(100),
            risk_flush_every: 10,
            risk_slow_tick: Duration::from_millis(50),
            base_mmr: 500,
            min_order_size: 10_000_000_000_000_000, // 0.01 base units
            min_leverage: 10_000,
            max_leverage: 1_000_000, // 100x
            taker_fee: 5,
            maker_fee: 2,
            insurance_fee_share: 5_000,
            liquidation_corridor: 500,
            collateral_safety_multiple: 2,
            lock_ttl: Duration::from_millis(5_000),
            lock_retries: 5,
            ws_outbound_queue: 256,
            ws_push_interval: Duration::from_secs(1),
            ws_funding_interval: Duration::from_secs(5),
            listen_addr: "0.0.0.0:8080".to_string(),
            insurance_account: "0x0000000000000000000000000000000000000001".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment (dotenv already applied by main).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("PERP_STORE_URL") {
            cfg.store_url = v;
        }
        if let Ok(v) = env::var("PERP_KEY_PREFIX") {
            cfg.key_prefix = v;
        }
        if let Ok(v) = env::var("PERP_TOKENS") {
            cfg.tokens = v
                .split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("PERP_LISTEN_ADDR") {
            cfg.listen_addr = v;
        }
        if let Some(v) = env_i128("PERP_FUNDING_RATE") {
            cfg.funding_rate = v;
        }
        if let Some(v) = env_u64("PERP_FUNDING_INTERVAL_SECS") {
            cfg.funding_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("PERP_RISK_TICK_MS") {
            cfg.risk_tick = Duration::from_millis(v);
        }
        if let Some(v) = env_i128("PERP_BASE_MMR_BP") {
            cfg.base_mmr = v;
        }
        if let Some(v) = env_i128("PERP_MIN_ORDER_SIZE") {
            cfg.min_order_size = v;
        }
        if let Some(v) = env_i128("PERP_MAX_LEVERAGE") {
            cfg.max_leverage = v;
        }
        if let Ok(v) = env::var("PERP_FUNDING_MARGIN_CHECK") {
            cfg.funding_margin_check = match v.as_str() {
                "mark_aware" => FundingMarginCheck::MarkAware,
                _ => FundingMarginCheck::LeverageBased,
            };
        }
        cfg
    }
}

fn env_i128(key: &str) -> Option<i128> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
