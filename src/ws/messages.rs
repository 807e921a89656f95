// Wire frames for the fan-out plane. Every frame is a {type, data,
// timestamp} envelope; token- and trader-scoped frames carry that key at
// the top level so the subscription router can dispatch without peeking
// into data. Prices go out as 1e18-scaled decimal strings; ratios as
// percentage strings with two decimals.

use chrono::Utc;
use serde_json::{json, Value};

use crate::book::BookTrade;
use crate::fixed::{rate_to_percent, to_wire};
use crate::types::{
    Balance, DepthSnapshot, MarketStats, Order, Position, SettlementLog, Trade,
};

/// Engine-internal broadcast event; rendered to a JSON frame at the socket.
#[derive(Debug, Clone)]
pub enum WsEvent {
    Orderbook { token: String, depth: DepthSnapshot },
    Trade { token: String, trade: Trade },
    MarketData { token: String, stats: MarketStats },
    Kline { token: String, bar: KlineBar },
    FundingRate { token: String, stats: MarketStats },
    Position { trader: String, position: Position },
    Balance { trader: String, balance: Balance },
    Orders { trader: String, order: Order },
    Risk { trader: String, position: Position },
    LiquidationWarning { trader: String, position: Position },
    MarginWarning { trader: String, position: Position },
    AdlTriggered { trader: String, position: Position },
    Settlement { trader: String, log: SettlementLog },
}

impl WsEvent {
    /// Token the frame is scoped to, for subscription routing.
    pub fn token(&self) -> Option<&str> {
        match self {
            WsEvent::Orderbook { token, .. }
            | WsEvent::Trade { token, .. }
            | WsEvent::MarketData { token, .. }
            | WsEvent::Kline { token, .. }
            | WsEvent::FundingRate { token, .. } => Some(token.as_str()),
            _ => None,
        }
    }

    /// Trader the frame is scoped to, for subscription routing.
    pub fn trader(&self) -> Option<&str> {
        match self {
            WsEvent::Position { trader, .. }
            | WsEvent::Balance { trader, .. }
            | WsEvent::Orders { trader, .. }
            | WsEvent::Risk { trader, .. }
            | WsEvent::LiquidationWarning { trader, .. }
            | WsEvent::MarginWarning { trader, .. }
            | WsEvent::AdlTriggered { trader, .. }
            | WsEvent::Settlement { trader, .. } => Some(trader.as_str()),
            _ => None,
        }
    }

    /// Risk-channel frames go only to clients with the risk flag set.
    pub fn is_risk_scoped(&self) -> bool {
        matches!(
            self,
            WsEvent::Risk { .. }
                | WsEvent::LiquidationWarning { .. }
                | WsEvent::MarginWarning { .. }
                | WsEvent::AdlTriggered { .. }
        )
    }

    pub fn to_frame(&self) -> Value {
        match self {
            WsEvent::Orderbook { token, depth } => {
                envelope("orderbook", Some(token.as_str()), None, depth_frame(depth))
            }
            WsEvent::Trade { token, trade } => {
                envelope("trade", Some(token.as_str()), None, trade_frame(trade))
            }
            WsEvent::MarketData { token, stats } => {
                envelope("market_data", Some(token.as_str()), None, market_frame(stats))
            }
            WsEvent::Kline { token, bar } => envelope("kline", Some(token.as_str()), None, bar.to_json()),
            WsEvent::FundingRate { token, stats } => envelope(
                "funding_rate",
                Some(token.as_str()),
                None,
                json!({
                    "fundingRate": to_wire(stats.funding_rate),
                    "nextFundingTime": stats.next_funding_time.timestamp_millis(),
                }),
            ),
            WsEvent::Position { trader, position } => {
                envelope("position", None, Some(trader.as_str()), position_frame(position))
            }
            WsEvent::Balance { trader, balance } => {
                envelope("balance", None, Some(trader.as_str()), balance_frame(balance))
            }
            WsEvent::Orders { trader, order } => {
                envelope("orders", None, Some(trader.as_str()), order_frame(order))
            }
            WsEvent::Risk { trader, position } => {
                envelope("risk", None, Some(trader.as_str()), risk_frame(position))
            }
            WsEvent::LiquidationWarning { trader, position } => envelope(
                "liquidation_warning",
                None,
                Some(trader.as_str()),
                risk_frame(position),
            ),
            WsEvent::MarginWarning { trader, position } => {
                envelope("margin_warning", None, Some(trader.as_str()), risk_frame(position))
            }
            WsEvent::AdlTriggered { trader, position } => {
                envelope("adl_triggered", None, Some(trader.as_str()), risk_frame(position))
            }
            WsEvent::Settlement { trader, log } => envelope(
                "balance",
                None,
                Some(trader.as_str()),
                json!({
                    "settlementId": log.id,
                    "type": log.log_type.as_str(),
                    "amount": to_wire(log.amount),
                    "balanceAfter": to_wire(log.balance_after),
                }),
            ),
        }
    }
}

fn envelope(frame_type: &str, token: Option<&str>, trader: Option<&str>, data: Value) -> Value {
    let mut frame = json!({
        "type": frame_type,
        "data": data,
        "timestamp": Utc::now().timestamp_millis(),
    });
    if let Some(token) = token {
        frame["token"] = json!(token);
    }
    if let Some(trader) = trader {
        frame["trader"] = json!(trader);
    }
    frame
}

pub fn error_frame(message: &str) -> Value {
    envelope("error", None, None, json!({ "error": message }))
}

pub fn pong_frame() -> Value {
    envelope("pong", None, None, json!({}))
}

fn depth_frame(depth: &DepthSnapshot) -> Value {
    let levels = |side: &Vec<crate::types::PriceLevel>| -> Vec<Value> {
        side.iter()
            .map(|l| {
                json!({
                    "price": to_wire(l.price),
                    "totalSize": to_wire(l.total_size),
                    "orderCount": l.order_count,
                })
            })
            .collect()
    };
    json!({
        "bids": levels(&depth.bids),
        "asks": levels(&depth.asks),
        "lastPrice": to_wire(depth.last_price),
    })
}

pub fn trade_frame(trade: &Trade) -> Value {
    json!({
        "id": trade.id,
        "price": to_wire(trade.price),
        "size": to_wire(trade.size),
        "isLong": trade.is_long,
        "type": trade.trade_type.as_str(),
        "timestamp": trade.created_at.timestamp_millis(),
    })
}

pub fn book_trade_frame(trade: &BookTrade) -> Value {
    json!({
        "price": to_wire(trade.price),
        "size": to_wire(trade.size),
        "side": trade.taker_side.as_str(),
        "timestamp": trade.timestamp.timestamp_millis(),
    })
}

fn market_frame(stats: &MarketStats) -> Value {
    json!({
        "lastPrice": to_wire(stats.last_price),
        "markPrice": to_wire(stats.mark_price),
        "indexPrice": to_wire(stats.index_price),
        "high24h": to_wire(stats.high_24h),
        "low24h": to_wire(stats.low_24h),
        "volume24h": to_wire(stats.volume_24h),
        "openInterestLong": to_wire(stats.open_interest_long),
        "openInterestShort": to_wire(stats.open_interest_short),
        "fundingRate": to_wire(stats.funding_rate),
        "nextFundingTime": stats.next_funding_time.timestamp_millis(),
    })
}

pub fn position_frame(p: &Position) -> Value {
    json!({
        "id": p.id,
        "token": p.token,
        "isLong": p.is_long,
        "size": to_wire(p.size),
        "entryPrice": to_wire(p.entry_price),
        "avgEntryPrice": to_wire(p.avg_entry_price),
        "leverage": to_wire(p.leverage),
        "collateral": to_wire(p.collateral),
        "margin": to_wire(p.margin),
        "markPrice": to_wire(p.mark_price),
        "liquidationPrice": to_wire(p.liquidation_price),
        "unrealizedPnl": to_wire(p.unrealized_pnl),
        "realizedPnl": to_wire(p.realized_pnl),
        "status": p.status.code().to_string(),
    })
}

pub fn balance_frame(b: &Balance) -> Value {
    json!({
        "walletBalance": to_wire(b.wallet_balance),
        "frozenMargin": to_wire(b.frozen_margin),
        "usedMargin": to_wire(b.used_margin),
        "unrealizedPnl": to_wire(b.unrealized_pnl),
        "availableBalance": to_wire(b.available()),
        "equity": to_wire(b.equity()),
    })
}

pub fn order_frame(o: &Order) -> Value {
    json!({
        "id": o.id,
        "token": o.token,
        "side": o.side.as_str(),
        "size": to_wire(o.size),
        "price": to_wire(o.price),
        "filledSize": to_wire(o.filled_size),
        "avgFillPrice": to_wire(o.avg_fill_price),
        "orderType": o.order_type.as_str(),
        "timeInForce": o.time_in_force.as_str(),
        "status": o.status.as_str(),
        "reason": o.reason,
    })
}

fn risk_frame(p: &Position) -> Value {
    json!({
        "positionId": p.id,
        "token": p.token,
        "riskLevel": p.risk_level.as_str(),
        "marginRatio": rate_to_percent(p.margin_ratio),
        "roe": rate_to_percent(p.roe),
        "mmr": to_wire(p.mmr),
        "maintenanceMargin": to_wire(p.maintenance_margin),
        "adlRank": p.adl_rank,
        "adlScore": to_wire(p.adl_score),
        "isLiquidatable": p.is_liquidatable,
        "isAdlCandidate": p.is_adl_candidate,
        "markPrice": to_wire(p.mark_price),
    })
}

/// Per-minute kline bar maintained by the pusher. Values are already-scaled
/// floating strings, matching the 1 Hz push path.
#[derive(Debug, Clone)]
pub struct KlineBar {
    pub minute_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl KlineBar {
    pub fn to_json(&self) -> Value {
        json!({
            "t": self.minute_start_ms,
            "o": format!("{}", self.open),
            "h": format!("{}", self.high),
            "l": format!("{}", self.low),
            "c": format!("{}", self.close),
            "v": format!("{}", self.volume),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::PRICE_SCALE;

    #[test]
    fn envelope_carries_token_and_type() {
        let depth = DepthSnapshot {
            token: "0xt".into(),
            bids: vec![],
            asks: vec![],
            last_price: 2 * PRICE_SCALE,
            timestamp: Utc::now(),
        };
        let frame = WsEvent::Orderbook {
            token: "0xt".into(),
            depth,
        }
        .to_frame();
        assert_eq!(frame["type"], "orderbook");
        assert_eq!(frame["token"], "0xt");
        assert_eq!(frame["data"]["lastPrice"], "2000000000000000000");
        assert!(frame["timestamp"].is_i64());
    }

    #[test]
    fn risk_frame_percent_strings() {
        let mut p = crate::risk::tests_support::sample_position();
        p.margin_ratio = 4550;
        p.roe = -250;
        let frame = WsEvent::Risk {
            trader: p.trader.clone(),
            position: p,
        }
        .to_frame();
        assert_eq!(frame["data"]["marginRatio"], "45.50");
        assert_eq!(frame["data"]["roe"], "-2.50");
        assert_eq!(frame["trader"], "0xaaa0000000000000000000000000000000000001");
    }
}
