// End-to-end matching flows over the in-memory store: order ingest,
// margin freeze accounting, partial fills, cancels, replay protection,
// boundaries, and conditional triggers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use perp_engine::config::EngineConfig;
use perp_engine::engine::Engine;
use perp_engine::fixed::{PRICE_SCALE, RATE_SCALE, SIZE_SCALE};
use perp_engine::store::{MemoryStore, SharedStore};
use perp_engine::types::{
    DepositObserved, Order, OrderSide, OrderStatus, OrderType, PositionStatus, TimeInForce,
    TradeType,
};

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
async fn simple_fill_settles_both_sides() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 10 * PRICE_SCALE).await;
    fund(&engine, BOB, 10 * PRICE_SCALE).await;

    // Alice rests a GTC buy; Bob crosses it with a sell at the same price.
    let buy = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 2 * PRICE_SCALE, 1);
    let accepted = engine.submit_order(buy).await.unwrap();
    assert_eq!(accepted.status, OrderStatus::Pending);

    let sell = signed_order(BOB, OrderSide::Short, SIZE_SCALE, 2 * PRICE_SCALE, 1);
    let filled = engine.submit_order(sell).await.unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.avg_fill_price, 2 * PRICE_SCALE);

    let alice_pos = engine
        .repos
        .positions
        .open_for(ALICE, TOKEN)
        .await
        .unwrap()
        .unwrap();
    assert!(alice_pos.is_long);
    assert_eq!(alice_pos.size, SIZE_SCALE);
    assert_eq!(alice_pos.entry_price, 2 * PRICE_SCALE);
    assert_eq!(alice_pos.collateral, 2 * PRICE_SCALE / 10);
    assert_eq!(alice_pos.margin, alice_pos.collateral + alice_pos.unrealized_pnl);

    let bob_pos = engine
        .repos
        .positions
        .open_for(BOB, TOKEN)
        .await
        .unwrap()
        .unwrap();
    assert!(!bob_pos.is_long);
    assert_eq!(bob_pos.size, SIZE_SCALE);
    assert_eq!(bob_pos.collateral, alice_pos.collateral);

    // Alice was maker: available dropped by the committed collateral plus
    // the maker fee on 2e18 notional.
    let maker_fee = 2 * PRICE_SCALE * 2 / 10_000;
    let alice_balance = engine.repos.balances.get(ALICE).await.unwrap();
    assert_eq!(alice_balance.frozen_margin, 0);
    assert_eq!(alice_balance.used_margin, 2 * PRICE_SCALE / 10);
    assert_eq!(
        alice_balance.available(),
        10 * PRICE_SCALE - 2 * PRICE_SCALE / 10 - maker_fee
    );
    assert!(alice_balance.available() >= 0);

    let trades = engine.repos.trades.recent_for_token(TOKEN, 10).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert!(trades.iter().all(|t| t.price == 2 * PRICE_SCALE));
    assert!(trades.iter().all(|t| t.size == SIZE_SCALE));
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_fill_then_cancel_releases_proportional_freeze() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 100 * PRICE_SCALE).await;
    fund(&engine, BOB, 100 * PRICE_SCALE).await;

    let buy = signed_order(ALICE, OrderSide::Long, 3 * SIZE_SCALE, 100 * PRICE_SCALE, 1);
    let buy_id = buy.id;
    engine.submit_order(buy).await.unwrap();

    let frozen_full = engine.repos.balances.get(ALICE).await.unwrap().frozen_margin;
    assert!(frozen_full > 0);

    let sell = signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1);
    engine.submit_order(sell).await.unwrap();

    let stored = engine.repos.orders.get(&buy_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::PartiallyFilled);
    assert_eq!(stored.filled_size, SIZE_SCALE);
    let pending = engine.repos.orders.pending_for_token(TOKEN).await.unwrap();
    assert!(pending.iter().any(|o| o.id == buy_id));

    // One third of the freeze settled with the fill.
    let after_fill = engine.repos.balances.get(ALICE).await.unwrap().frozen_margin;
    assert_eq!(after_fill, frozen_full - frozen_full / 3);

    // Cancelling releases the remaining two thirds.
    assert!(engine.cancel_order(TOKEN, buy_id, ALICE).await.unwrap());
    let cancelled = engine.repos.orders.get(&buy_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    let pending = engine.repos.orders.pending_for_token(TOKEN).await.unwrap();
    assert!(pending.iter().all(|o| o.id != buy_id));
    let final_balance = engine.repos.balances.get(ALICE).await.unwrap();
    assert_eq!(final_balance.frozen_margin, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_nonce_is_rejected_once() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 100 * PRICE_SCALE).await;

    let first = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 90 * PRICE_SCALE, 7);
    engine.submit_order(first.clone()).await.unwrap();

    let mut replay = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 90 * PRICE_SCALE, 7);
    replay.id = Uuid::new_v4();
    let err = engine.submit_order(replay.clone()).await.unwrap_err();
    assert!(err.to_string().contains("nonce"));

    let stored_first = engine.repos.orders.get(&first.id).await.unwrap().unwrap();
    assert_eq!(stored_first.status, OrderStatus::Pending);
    let stored_replay = engine.repos.orders.get(&replay.id).await.unwrap().unwrap();
    assert_eq!(stored_replay.status, OrderStatus::Rejected);
    assert!(stored_replay.reason.unwrap().contains("nonce"));

    // No second freeze leaked.
    let pending = engine.repos.orders.pending_for_token(TOKEN).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn size_boundary_is_exact() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 100 * PRICE_SCALE).await;
    let min = test_config().min_order_size;

    let at_min = signed_order(ALICE, OrderSide::Long, min, 90 * PRICE_SCALE, 1);
    assert!(engine.submit_order(at_min).await.is_ok());

    let below = signed_order(ALICE, OrderSide::Long, min - 1, 90 * PRICE_SCALE, 2);
    let below_id = below.id;
    let err = engine.submit_order(below).await.unwrap_err();
    assert!(err.to_string().contains("below minimum"));
    let stored = engine.repos.orders.get(&below_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Rejected);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_signature_rejected_without_side_effects() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 100 * PRICE_SCALE).await;

    let mut order = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 90 * PRICE_SCALE, 1);
    order.signature = "deadbeef".to_string();
    let err = engine.submit_order(order).await.unwrap_err();
    assert!(err.to_string().contains("signature"));

    let balance = engine.repos.balances.get(ALICE).await.unwrap();
    assert_eq!(balance.frozen_margin, 0);
    assert!(engine.repos.orders.pending_for_token(TOKEN).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn insufficient_balance_rejects_with_typed_error() {
    let engine = start_engine().await;
    fund(&engine, ALICE, PRICE_SCALE / 100).await;

    let order = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1);
    let err = engine.submit_order(order).await.unwrap_err();
    assert!(err.to_string().contains("insufficient balance"));
}

#[tokio::test(flavor = "multi_thread")]
async fn ioc_discards_remainder_and_fok_is_atomic() {
    let engine = start_engine().await;
    for trader in [ALICE, BOB, CAROL] {
        fund(&engine, trader, 1000 * PRICE_SCALE).await;
    }

    let sell = signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1);
    engine.submit_order(sell).await.unwrap();

    // FOK for twice the available size: rejected, maker untouched.
    let mut fok = signed_order(ALICE, OrderSide::Long, 2 * SIZE_SCALE, 100 * PRICE_SCALE, 1);
    fok.time_in_force = TimeInForce::Fok;
    assert!(engine.submit_order(fok).await.is_err());
    assert_eq!(engine.repos.orders.pending_for_token(TOKEN).await.unwrap().len(), 1);
    let alice = engine.repos.balances.get(ALICE).await.unwrap();
    assert_eq!(alice.frozen_margin, 0);

    // IOC for twice the size: fills one, discards the rest, rests nothing.
    let mut ioc = signed_order(CAROL, OrderSide::Long, 2 * SIZE_SCALE, 100 * PRICE_SCALE, 1);
    ioc.time_in_force = TimeInForce::Ioc;
    let result = engine.submit_order(ioc).await.unwrap();
    assert_eq!(result.filled_size, SIZE_SCALE);
    assert!(engine.repos.orders.pending_for_token(TOKEN).await.unwrap().is_empty());
    let carol = engine.repos.balances.get(CAROL).await.unwrap();
    assert_eq!(carol.frozen_margin, 0);
    assert!(carol.used_margin > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn post_only_rejects_on_cross() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 1000 * PRICE_SCALE).await;
    fund(&engine, BOB, 1000 * PRICE_SCALE).await;

    let sell = signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1);
    engine.submit_order(sell).await.unwrap();

    let mut crossing = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1);
    crossing.post_only = true;
    assert!(engine.submit_order(crossing).await.is_err());
    let alice = engine.repos.balances.get(ALICE).await.unwrap();
    assert_eq!(alice.frozen_margin, 0);

    let mut passive = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 99 * PRICE_SCALE, 2);
    passive.post_only = true;
    let accepted = engine.submit_order(passive).await.unwrap();
    assert_eq!(accepted.status, OrderStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn gtd_orders_expire_and_release_freeze() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 100 * PRICE_SCALE).await;

    let mut order = signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 90 * PRICE_SCALE, 1);
    order.time_in_force = TimeInForce::Gtd;
    order.deadline = Some(Utc::now() + chrono::Duration::milliseconds(150));
    let id = order.id;
    engine.submit_order(order).await.unwrap();
    assert!(engine.repos.balances.get(ALICE).await.unwrap().frozen_margin > 0);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let stored = engine.repos.orders.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Expired);
    assert_eq!(engine.repos.balances.get(ALICE).await.unwrap().frozen_margin, 0);
    assert!(engine.repos.orders.pending_for_token(TOKEN).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn take_profit_trigger_fires_and_closes_position() {
    let engine = start_engine().await;
    for trader in [ALICE, BOB, CAROL, DAVE, ERIN] {
        fund(&engine, trader, 1000 * PRICE_SCALE).await;
    }

    // Alice opens a long at 100.
    engine
        .submit_order(signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();

    let alice_position_id = engine
        .repos
        .positions
        .open_for(ALICE, TOKEN)
        .await
        .unwrap()
        .unwrap()
        .id;

    // Take-profit close at 150, reduce-only market.
    let mut tp = signed_order(ALICE, OrderSide::Short, SIZE_SCALE, 0, 2);
    tp.order_type = OrderType::TakeProfit;
    tp.trigger_price = 150 * PRICE_SCALE;
    tp.reduce_only = true;
    tp.signature = tp.sign_digest();
    let tp_id = tp.id;
    let accepted = engine.submit_order(tp).await.unwrap();
    assert_eq!(accepted.status, OrderStatus::Pending);

    // Liquidity for the eventual close sits at 149 before the price moves.
    engine
        .submit_order(signed_order(ERIN, OrderSide::Long, SIZE_SCALE, 149 * PRICE_SCALE, 1))
        .await
        .unwrap();

    // Carol and Dave print 150.
    engine
        .submit_order(signed_order(CAROL, OrderSide::Short, SIZE_SCALE, 150 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(DAVE, OrderSide::Long, SIZE_SCALE, 150 * PRICE_SCALE, 1))
        .await
        .unwrap();

    // The next matching sweep detects the trigger and runs the close.
    let mut closed = None;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(p)) = engine.repos.positions.get(&alice_position_id).await {
            if p.status == PositionStatus::Closed {
                closed = Some(p);
                break;
            }
        }
    }
    let closed = closed.expect("take-profit close did not happen");
    assert_eq!(closed.size, 0);
    assert_eq!(closed.realized_pnl, 49 * PRICE_SCALE);

    let stored_tp = engine.repos.orders.get(&tp_id).await.unwrap().unwrap();
    assert_eq!(stored_tp.status, OrderStatus::Filled);
    assert_eq!(stored_tp.avg_fill_price, 149 * PRICE_SCALE);

    // Trigger index no longer holds the order.
    let still_triggered = engine
        .repos
        .orders
        .triggered_ids(TOKEN, OrderSide::Short, 150 * PRICE_SCALE)
        .await
        .unwrap();
    assert!(still_triggered.is_empty());

    let trades = engine.repos.trades.recent_for_user(ALICE, 10).await.unwrap();
    assert!(trades.iter().any(|t| t.trade_type == TradeType::Normal && t.realized_pnl > 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn collateral_add_and_remove_respect_safety_floor() {
    let engine = start_engine().await;
    fund(&engine, ALICE, 1000 * PRICE_SCALE).await;
    fund(&engine, BOB, 1000 * PRICE_SCALE).await;

    engine
        .submit_order(signed_order(BOB, OrderSide::Short, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();
    engine
        .submit_order(signed_order(ALICE, OrderSide::Long, SIZE_SCALE, 100 * PRICE_SCALE, 1))
        .await
        .unwrap();

    let before = engine
        .repos
        .positions
        .open_for(ALICE, TOKEN)
        .await
        .unwrap()
        .unwrap();
    let added = engine
        .positions
        .add_collateral(ALICE, TOKEN, 5 * PRICE_SCALE)
        .await
        .unwrap();
    assert_eq!(added.collateral, before.collateral + 5 * PRICE_SCALE);
    assert!(added.liquidation_price < before.liquidation_price);

    // Removing everything would sink margin below the safety floor.
    let err = engine
        .positions
        .remove_collateral(ALICE, TOKEN, added.collateral)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("maintenance"));

    let removed = engine
        .positions
        .remove_collateral(ALICE, TOKEN, 5 * PRICE_SCALE)
        .await
        .unwrap();
    assert_eq!(removed.collateral, before.collateral);
}
