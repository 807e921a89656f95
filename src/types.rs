// Core types for the perpetual engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::fixed::{self, RATE_SCALE};

/// Canonical token identifier: a 20-byte address, lowercased hex.
pub type Token = String;

/// Canonical trader identifier: a 20-byte address, lowercased hex.
pub type Trader = String;

/// Lowercase an address-shaped identifier; rejects anything that is not
/// 0x-prefixed 20-byte hex.
pub fn canonical_address(raw: &str) -> Option<String> {
    let s = raw.trim().to_lowercase();
    let hex_part = s.strip_prefix("0x")?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Long,
    Short,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Long => OrderSide::Short,
            OrderSide::Short => OrderSide::Long,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, OrderSide::Long)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Long => "long",
            OrderSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<OrderSide> {
        match s {
            "long" | "buy" => Some(OrderSide::Long),
            "short" | "sell" => Some(OrderSide::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl OrderType {
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss | OrderType::TakeProfit | OrderType::TrailingStop
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopLoss => "stop_loss",
            OrderType::TakeProfit => "take_profit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "stop_loss" => Some(OrderType::StopLoss),
            "take_profit" => Some(OrderType::TakeProfit),
            "trailing_stop" => Some(OrderType::TrailingStop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtd,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::Gtd => "GTD",
        }
    }

    pub fn parse(s: &str) -> Option<TimeInForce> {
        match s {
            "GTC" => Some(TimeInForce::Gtc),
            "IOC" => Some(TimeInForce::Ioc),
            "FOK" => Some(TimeInForce::Fok),
            "GTD" => Some(TimeInForce::Gtd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Expired,
    Rejected,
    Triggered,
}

impl OrderStatus {
    /// Pending-index membership: the order rests in the book / pending set.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Triggered => "triggered",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "expired" => Some(OrderStatus::Expired),
            "rejected" => Some(OrderStatus::Rejected),
            "triggered" => Some(OrderStatus::Triggered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub trader: Trader,
    pub token: Token,
    pub side: OrderSide,
    /// Total size, 1e18-scaled base units.
    pub size: i128,
    /// Limit price, 1e18-scaled; 0 means market.
    pub price: i128,
    /// Leverage, RATE-scaled (10x = 100000).
    pub leverage: i128,
    /// Collateral frozen for this order.
    pub margin: i128,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
    /// Activation price for conditional orders; 0 when absent.
    pub trigger_price: i128,
    pub filled_size: i128,
    pub avg_fill_price: i128,
    pub status: OrderStatus,
    /// Reject reason when status == Rejected.
    pub reason: Option<String>,
    /// GTD expiry; ignored for other time-in-force values.
    pub deadline: Option<DateTime<Utc>>,
    pub nonce: u64,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_size(&self) -> i128 {
        self.size - self.filled_size
    }

    pub fn is_market(&self) -> bool {
        self.price == 0
    }

    /// Canonical digest covering the signed fields. The ingress check
    /// compares the submitted signature against this hex digest.
    pub fn sign_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.trader.as_bytes());
        hasher.update(self.token.as_bytes());
        hasher.update(self.side.as_str().as_bytes());
        hasher.update(self.size.to_be_bytes());
        hasher.update(self.price.to_be_bytes());
        hasher.update(self.leverage.to_be_bytes());
        hasher.update(self.trigger_price.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated = 0,
    Cross = 1,
}

impl MarginMode {
    pub fn from_code(code: i128) -> MarginMode {
        if code == 1 {
            MarginMode::Cross
        } else {
            MarginMode::Isolated
        }
    }

    pub fn code(&self) -> i128 {
        match self {
            MarginMode::Isolated => 0,
            MarginMode::Cross => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open = 0,
    Closed = 1,
    Liquidated = 2,
}

impl PositionStatus {
    pub fn from_code(code: i128) -> PositionStatus {
        match code {
            1 => PositionStatus::Closed,
            2 => PositionStatus::Liquidated,
            _ => PositionStatus::Open,
        }
    }

    pub fn code(&self) -> i128 {
        *self as i128
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub trader: Trader,
    pub token: Token,
    /// Counterparty trader when the position was opened against a single peer.
    pub counterparty: Option<Trader>,
    pub is_long: bool,
    /// Base-token size, 1e18-scaled. size == 0 implies status != Open.
    pub size: i128,
    pub entry_price: i128,
    /// Volume-weighted average entry across adds.
    pub avg_entry_price: i128,
    /// RATE-scaled leverage.
    pub leverage: i128,
    pub margin_mode: MarginMode,
    /// Last engine-observed mark price.
    pub mark_price: i128,
    /// Initial collateral backing the position.
    pub collateral: i128,
    /// Current margin = collateral + unrealized PnL.
    pub margin: i128,
    /// Maintenance-margin rate, basis points.
    pub mmr: i128,
    pub maintenance_margin: i128,
    pub liquidation_price: i128,
    pub bankruptcy_price: i128,
    pub break_even_price: i128,
    pub unrealized_pnl: i128,
    pub realized_pnl: i128,
    /// Accumulated funding paid (negative = paid out).
    pub funding_fee: i128,
    pub take_profit_price: i128,
    pub stop_loss_price: i128,
    /// Basis-point ratio of maintenance margin to current margin.
    pub margin_ratio: i128,
    /// Return on equity, basis points.
    pub roe: i128,
    /// ADL queue bucket 1 (first to unwind) through 5; 0 = unranked.
    pub adl_rank: u8,
    pub adl_score: i128,
    pub risk_level: RiskLevel,
    pub is_liquidatable: bool,
    pub is_adl_candidate: bool,
    pub is_liquidating: bool,
    /// Funding index at open, for funding reconciliation.
    pub funding_index: i128,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open && self.size > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub trader: Trader,
    /// Mirror of the on-chain deposit.
    pub wallet_balance: i128,
    /// Margin frozen for pending orders.
    pub frozen_margin: i128,
    /// Collateral committed to open positions.
    pub used_margin: i128,
    /// Aggregated unrealized PnL across open positions.
    pub unrealized_pnl: i128,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn empty(trader: &str) -> Balance {
        Balance {
            trader: trader.to_string(),
            wallet_balance: 0,
            frozen_margin: 0,
            used_margin: 0,
            unrealized_pnl: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn available(&self) -> i128 {
        self.wallet_balance - self.frozen_margin - self.used_margin
    }

    pub fn equity(&self) -> i128 {
        self.available() + self.used_margin + self.unrealized_pnl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Normal,
    Liquidation,
    Adl,
    Close,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Normal => "normal",
            TradeType::Liquidation => "liquidation",
            TradeType::Adl => "adl",
            TradeType::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<TradeType> {
        match s {
            "normal" => Some(TradeType::Normal),
            "liquidation" => Some(TradeType::Liquidation),
            "adl" => Some(TradeType::Adl),
            "close" => Some(TradeType::Close),
            _ => None,
        }
    }
}

/// Immutable pairing record produced by the matching engine, one per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub token: Token,
    pub trader: Trader,
    pub is_long: bool,
    pub is_maker: bool,
    pub size: i128,
    pub price: i128,
    pub fee: i128,
    /// Realized PnL for the closing side; 0 otherwise.
    pub realized_pnl: i128,
    pub trade_type: TradeType,
    pub created_at: DateTime<Utc>,
}

/// Per-order bookkeeping of frozen margin and fee reserve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMargin {
    pub order_id: Uuid,
    pub trader: Trader,
    pub token: Token,
    pub frozen_margin: i128,
    pub fee_reserve: i128,
    /// Size already settled against the freeze.
    pub settled_size: i128,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementType {
    Deposit,
    Withdraw,
    SettlePnl,
    FundingFee,
    Liquidation,
    MarginAdd,
    MarginRemove,
    InsuranceInjection,
    DailySettlement,
}

impl SettlementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementType::Deposit => "DEPOSIT",
            SettlementType::Withdraw => "WITHDRAW",
            SettlementType::SettlePnl => "SETTLE_PNL",
            SettlementType::FundingFee => "FUNDING_FEE",
            SettlementType::Liquidation => "LIQUIDATION",
            SettlementType::MarginAdd => "MARGIN_ADD",
            SettlementType::MarginRemove => "MARGIN_REMOVE",
            SettlementType::InsuranceInjection => "INSURANCE_INJECTION",
            SettlementType::DailySettlement => "DAILY_SETTLEMENT",
        }
    }

    pub fn parse(s: &str) -> Option<SettlementType> {
        match s {
            "DEPOSIT" => Some(SettlementType::Deposit),
            "WITHDRAW" => Some(SettlementType::Withdraw),
            "SETTLE_PNL" => Some(SettlementType::SettlePnl),
            "FUNDING_FEE" => Some(SettlementType::FundingFee),
            "LIQUIDATION" => Some(SettlementType::Liquidation),
            "MARGIN_ADD" => Some(SettlementType::MarginAdd),
            "MARGIN_REMOVE" => Some(SettlementType::MarginRemove),
            "INSURANCE_INJECTION" => Some(SettlementType::InsuranceInjection),
            "DAILY_SETTLEMENT" => Some(SettlementType::DailySettlement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnChainStatus {
    Pending,
    Submitted,
    Success,
    Failed,
}

impl OnChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnChainStatus::Pending => "PENDING",
            OnChainStatus::Submitted => "SUBMITTED",
            OnChainStatus::Success => "SUCCESS",
            OnChainStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<OnChainStatus> {
        match s {
            "PENDING" => Some(OnChainStatus::Pending),
            "SUBMITTED" => Some(OnChainStatus::Submitted),
            "SUCCESS" => Some(OnChainStatus::Success),
            "FAILED" => Some(OnChainStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only journal entry of a user-visible balance movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLog {
    pub id: Uuid,
    pub trader: Trader,
    pub token: Option<Token>,
    pub amount: i128,
    pub balance_before: i128,
    pub balance_after: i128,
    pub log_type: SettlementType,
    pub on_chain_status: OnChainStatus,
    /// Opaque JSON payload for the external proof submitter.
    pub proof: String,
    /// Hex digest over the journal fields.
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

impl SettlementLog {
    pub fn sign_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.trader.as_bytes());
        hasher.update(self.amount.to_be_bytes());
        hasher.update(self.balance_before.to_be_bytes());
        hasher.update(self.balance_after.to_be_bytes());
        hasher.update(self.log_type.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Per-token market rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStats {
    pub token: Token,
    pub last_price: i128,
    pub mark_price: i128,
    pub index_price: i128,
    pub high_24h: i128,
    pub low_24h: i128,
    pub volume_24h: i128,
    pub open_interest_long: i128,
    pub open_interest_short: i128,
    /// RATE-scaled funding rate.
    pub funding_rate: i128,
    pub next_funding_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketStats {
    pub fn empty(token: &str) -> MarketStats {
        MarketStats {
            token: token.to_string(),
            last_price: 0,
            mark_price: 0,
            index_price: 0,
            high_24h: 0,
            low_24h: 0,
            volume_24h: 0,
            open_interest_long: 0,
            open_interest_short: 0,
            funding_rate: 1,
            next_funding_time: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Aggregated price level exposed in depth snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: i128,
    pub total_size: i128,
    pub order_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub token: Token,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_price: i128,
    pub timestamp: DateTime<Utc>,
}

/// Deposit transfer observed by the external blockchain listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositObserved {
    pub trader: Trader,
    pub amount: i128,
    pub block: u64,
}

/// Computed margin requirement for an ingested order.
pub fn required_margin(size: i128, price: i128, leverage: i128) -> i128 {
    fixed::mul_div(fixed::notional(size, price), RATE_SCALE, leverage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{PRICE_SCALE, SIZE_SCALE};

    #[test]
    fn canonical_address_normalizes() {
        let a = canonical_address("0xAbC0000000000000000000000000000000000001");
        assert_eq!(
            a.as_deref(),
            Some("0xabc0000000000000000000000000000000000001")
        );
        assert!(canonical_address("0x1234").is_none());
        assert!(canonical_address("nothex").is_none());
    }

    #[test]
    fn required_margin_uses_leverage() {
        // 1 unit at price 2e18 with 10x leverage freezes 2e17
        let margin = required_margin(SIZE_SCALE, 2 * PRICE_SCALE, 10 * RATE_SCALE);
        assert_eq!(margin, 2 * PRICE_SCALE / 10);
    }

    #[test]
    fn balance_identities() {
        let mut b = Balance::empty("0xabc0000000000000000000000000000000000001");
        b.wallet_balance = 10 * PRICE_SCALE;
        b.frozen_margin = 2 * PRICE_SCALE;
        b.used_margin = 3 * PRICE_SCALE;
        b.unrealized_pnl = PRICE_SCALE;
        assert_eq!(b.available(), 5 * PRICE_SCALE);
        assert_eq!(b.equity(), 9 * PRICE_SCALE);
    }
}
