// Risk-loop and liquidation scenarios: a leveraged long is marked down by
// the book price, classified critical within one risk tick, force-closed
// against resting liquidity, and journaled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use perp_engine::config::EngineConfig;
use perp_engine::engine::Engine;
use perp_engine::fixed::{PRICE_SCALE, RATE_SCALE, SIZE_SCALE};
use perp_engine::store::{MemoryStore, SharedStore};
use perp_engine::types::{
    DepositObserved, Order, OrderSide, OrderStatus, OrderType, PositionStatus, SettlementType,
    TimeInForce, TradeType,
};
use perp_engine::ws::messages::WsEvent;

const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
const ALICE: &str = "0x00000000000000000000000000000000000000a1";
const BOB: &str = "0x00000000000000000000000000000000000000b2";
const CAROL: &str = "0x00000000000000000000000000000000000000c3";
const DAVE: &str = "0x00000000000000000000000000000000000000d4";
const ERIN: &str = "0x00000000000000000000000000000000000000e5";

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tokens = vec![TOKEN.to_string()];
    config
}

async fn start_engine() -> Arc<Engine> {
    let store: SharedStore = Arc::new(MemoryStore::new());
    Engine::start(test_config(), store).await.unwrap()
}

async fn fund(engine: &Engine, trader: &str, amount: i128) {
    engine
        .apply_deposit(&DepositObserved {
            trader: trader.to_string(),
            amount,
            block: 1,
        })
        .await
        .unwrap();
}

fn signed_order(trader: &str, side: OrderSide, size: i128, price: i128, nonce: u64) -> Order {
    let mut order = Order {
        id: Uuid::new_v4(),
        trader: trader.to_string(),
        token: TOKEN.to_string(),
        side,
        size,
        price,
        leverage: 10 * RATE_SCALE,
        margin: 0,
        order_type: if price == 0 {
            OrderType::Market
        } else {
            OrderType::Limit
        },
        time_in_force: TimeInForce::Gtc,
        reduce_only: false,
        post_only: false,
        trigger_price: 0,
        filled_size: 0,
        avg_fill_price: 0,
        status: OrderStatus::Pending,
        reason: None,
        deadline: None,
        nonce,
        signature: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    order.signature = order.sign_digest();
    order
}

#[tokio::test(flavor = "multi_thread")]
async fn markdown_to_critical_liquidates_through_the_book() {
    let engine = start_engine().await;
    for trader in [ALICE, BOB, CAROL, DAVE, ERIN] {
        fund(&engine, trader, 1000 * PRICE_SCALE).await;
    }

    // Alice opens a 10x long of 1 at 100: collateral 10e18.
    engine
        .submit_order(signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    let position = engine
        .repos
        .positions
        .open_for(ALICE, TOKEN)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(position.collateral, 10 * PRICE_SCALE);

    let mut events = engine.events.subscribe();

    // Exit liquidity inside the corridor, resting before the markdown.
    engine
        .submit_order(signed_order(ERIN, OrderSide::Long, SIZE_SCALE, 90 * PRICE_SCALE, 1))
        .await
        .unwrap();

    // Carol and Dave print 91: unrealized -9e18, margin 1e18, ratio far
    // past the critical threshold on the next 100ms cycle.
    engine
        .submit_order(signed_order(CAROL, OrderSide::Short, SIZE_SCALE, 91 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(DAVE, OrderSide::Long, SIZE_SCALE, 91 * PRICE_SCALE, 1))
        .await
        .unwrap();

    // Wait for risk -> candidate -> forced close.
    let mut liquidated = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(p)) = engine.repos.positions.get(&position.id).await {
            if p.status == PositionStatus::Liquidated {
                liquidated = Some(p);
                break;
            }
        }
    }
    let liquidated = liquidated.expect("position was not liquidated");
    assert_eq!(liquidated.size, 0);
    assert!(!liquidated.is_liquidatable);

    // The forced close printed a liquidation trade at Erin's bid.
    let trades = engine.repos.trades.recent_for_user(ALICE, 10).await.unwrap();
    let forced = trades
        .iter()
        .find(|t| t.trade_type == TradeType::Liquidation)
        .expect("no liquidation trade journaled");
    assert_eq!(forced.price, 90 * PRICE_SCALE);
    assert_eq!(forced.size, SIZE_SCALE);
    assert_eq!(forced.realized_pnl, -10 * PRICE_SCALE);

    // LIQUIDATION journal entry exists for Alice.
    let logs = engine.repos.settlements.list_for(ALICE, 20).await.unwrap();
    assert!(logs.iter().any(|l| l.log_type == SettlementType::Liquidation));

    // Exactly one liquidation warning crossed the bus.
    let mut warnings = 0;
    while let Ok(event) = events.try_recv() {
        if let WsEvent::LiquidationWarning { trader, .. } = event {
            if trader == ALICE {
                warnings += 1;
            }
        }
    }
    assert_eq!(warnings, 1);

    // Available balance stays non-negative through the wipeout.
    let balance = engine.repos.balances.get(ALICE).await.unwrap();
    assert!(balance.available() >= 0);
    assert_eq!(balance.used_margin, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn liquidation_is_idempotent_under_repeated_candidates() {
    let engine = start_engine().await;
    for trader in [ALICE, BOB, CAROL, DAVE] {
        fund(&engine, trader, 1000 * PRICE_SCALE).await;
    }

    // Alice longs at 100 with no exit liquidity: the book phase cannot
    // close, ADL unwinds against Bob's profitable short instead.
    engine
        .submit_order(signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    let position = engine
        .repos
        .positions
        .open_for(ALICE, TOKEN)
        .await
        .unwrap()
        .unwrap();

    engine
        .submit_order(signed_order(CAROL, OrderSide::Short, SIZE_SCALE, 91 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(DAVE, OrderSide::Long, SIZE_SCALE, 91 * PRICE_SCALE, 1))
        .await
        .unwrap();

    let mut final_position = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(p)) = engine.repos.positions.get(&position.id).await {
            if p.status == PositionStatus::Liquidated {
                final_position = Some(p);
                break;
            }
        }
    }
    let final_position = final_position.expect("position was not liquidated");
    assert_eq!(final_position.size, 0);

    // ADL journaled against the profitable counterparty at the bankruptcy
    // price; Bob's short shrank (or closed) by the unwound size.
    let adl_trades: Vec<_> = engine
        .repos
        .trades
        .recent_for_user(BOB, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.trade_type == TradeType::Adl)
        .collect();
    assert_eq!(adl_trades.len(), 1);
    assert_eq!(adl_trades[0].price, final_position.bankruptcy_price);

    // The candidate stream kept firing while the latch was held; exactly
    // one forced close happened for Alice.
    let alice_liquidation_trades = engine
        .repos
        .trades
        .recent_for_user(ALICE, 20)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.trade_type == TradeType::Liquidation)
        .count();
    assert_eq!(alice_liquidation_trades, 1);
}
