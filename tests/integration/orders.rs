//! Order submission and the path from a fill to a position.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_test::assert_err;

use polymarket_redeemer::engine::{Engine, EngineHandle};
use polymarket_redeemer::error::{EngineError, OrderError};
use polymarket_redeemer::testing::{
    condition_id, filled_order, Harness, MockExchange, RecordingNotifier, TEST_MARKET_URL,
};
use polymarket_redeemer::trading::{
    BasicValidator, Direction, ExecutorSettings, Order, OrderEvent, OrderExecutor, OrderRequest,
    OrderStatus, Position, PositionStatus, PositionTracker, RiskLimits, SubmitResult,
};

const TOKEN_ID: &str = "71321045679252212594626385532706912750332728571942532289631379312455583992563";

fn executor(
    exchange: Arc<MockExchange>,
    track_timeout: Duration,
) -> (Arc<OrderExecutor>, mpsc::Receiver<OrderEvent>) {
    executor_with_risk(exchange, track_timeout, Arc::new(RiskLimits::new(dec!(100), dec!(50))))
}

fn executor_with_risk(
    exchange: Arc<MockExchange>,
    track_timeout: Duration,
    risk: Arc<RiskLimits>,
) -> (Arc<OrderExecutor>, mpsc::Receiver<OrderEvent>) {
    let (tx, rx) = mpsc::channel(16);
    let executor = OrderExecutor::new(
        exchange,
        Arc::new(BasicValidator::default()),
        risk,
        tx,
        ExecutorSettings {
            poll_interval: Duration::from_millis(5),
            track_timeout,
        },
    );
    (Arc::new(executor), rx)
}

fn start_engine(
    harness: &Harness,
    exchange: Arc<MockExchange>,
    track_timeout: Duration,
) -> (EngineHandle, tokio::task::JoinHandle<polymarket_redeemer::Result<()>>) {
    let (executor, events) = executor(exchange, track_timeout);
    let (engine, handle) = Engine::new(
        harness.tracker.clone(),
        harness.manager.clone(),
        executor,
        harness.store.clone(),
        events,
        // Long cycle: finished positions stay visible.
        Duration::from_secs(60),
    );
    (handle, tokio::spawn(engine.run()))
}

fn buy(condition_id: &str, size: Decimal) -> OrderRequest {
    OrderRequest::buy(TOKEN_ID, condition_id, Direction::Up, dec!(0.45), size)
}

async fn wait_for_position(
    harness: &Harness,
    id: &str,
    done: impl Fn(&Position) -> bool,
) -> Option<Position> {
    for _ in 0..200 {
        if let Some(position) = harness.tracker.get(id).filter(|p| done(p)) {
            return Some(position);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness.tracker.get(id)
}

#[tokio::test]
async fn size_below_minimum_lot_never_reaches_exchange() {
    let exchange = Arc::new(MockExchange::new());
    let (executor, _events) = executor(exchange.clone(), Duration::from_millis(100));

    let err = assert_err!(executor.submit(buy(&condition_id(0x31), dec!(0.00005))).await);

    assert!(matches!(err, OrderError::Validation(_)));
    assert!(exchange.placed().is_empty());
    assert!(executor.orders().is_empty());
}

#[tokio::test]
async fn response_without_order_id_is_a_rejection() {
    let harness = Harness::new("no-order-id");
    let exchange = Arc::new(MockExchange::new());
    exchange.push_submit(Ok(SubmitResult {
        order_id: None,
        error: Some("not enough balance / allowance".to_string()),
        success: Some(false),
    }));
    let (handle, running) = start_engine(&harness, exchange.clone(), Duration::from_millis(100));
    let id = condition_id(0x32);

    let err = assert_err!(handle.submit_order(buy(&id, dec!(10))).await);

    match err {
        EngineError::Order(OrderError::ExchangeRejected { reason }) => {
            assert!(reason.contains("allowance"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(exchange.placed().len(), 1);
    assert!(harness.tracker.get(&id).is_none());

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelling_a_finished_order_does_not_call_exchange() {
    let exchange = Arc::new(MockExchange::new());
    let (executor, _events) = executor(exchange.clone(), Duration::from_millis(100));

    let mut filled = Order::submitted("done-1".to_string(), &buy(&condition_id(0x33), dec!(10)));
    filled.status = OrderStatus::Filled;
    filled.filled_size = dec!(10);
    executor.restore(vec![filled]);

    executor.cancel("done-1").await.unwrap();
    executor.cancel("done-1").await.unwrap();

    assert!(exchange.cancelled().is_empty());
    assert_eq!(executor.get("done-1").unwrap().status, OrderStatus::Filled);
}

#[tokio::test]
async fn cancelled_open_order_opens_no_position() {
    let harness = Harness::new("cancel-open");
    let exchange = Arc::new(MockExchange::new());
    let (handle, running) = start_engine(&harness, exchange.clone(), Duration::from_secs(5));
    let id = condition_id(0x34);

    let order = handle.submit_order(buy(&id, dec!(10))).await.unwrap();
    let order_id = order.order_id.unwrap();
    exchange.set_status(&order_id, OrderStatus::Open, Decimal::ZERO);

    handle.cancel_order(&order_id).await.unwrap();
    assert_eq!(exchange.cancelled(), vec![order_id.clone()]);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(harness.tracker.get(&id).is_none());

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn fill_opens_position_and_settlement_redeems_it() {
    let harness = Harness::new("fill-to-redeem");
    let exchange = Arc::new(MockExchange::new());
    let (handle, running) = start_engine(&harness, exchange.clone(), Duration::from_secs(5));
    let id = condition_id(0x35);
    harness.relay.accept(&harness.relay_urls[0], "0xfill");

    let order = handle.submit_order(buy(&id, dec!(10))).await.unwrap();
    assert_eq!(order.status, OrderStatus::Submitted);
    exchange.set_status(order.order_id.as_deref().unwrap(), OrderStatus::Filled, dec!(10));

    let position = wait_for_position(&harness, &id, |_| true).await.expect("position opened");
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.size, dec!(10));
    assert_eq!(position.entry_price, dec!(0.45));
    assert_eq!(position.order_id, order.order_id);

    assert!(handle.market_settled(&id, Direction::Up).await.unwrap());
    let position = wait_for_position(&harness, &id, |p| p.status == PositionStatus::Redeemed)
        .await
        .unwrap();
    assert_eq!(position.status, PositionStatus::Redeemed);
    assert_eq!(position.pnl(), Some(dec!(5.5)));

    // Settled positions ignore later signals.
    assert!(!handle.market_settled(&id, Direction::Up).await.unwrap());

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn partial_fill_at_tracking_timeout_still_opens_position() {
    let harness = Harness::new("partial-timeout");
    let exchange = Arc::new(MockExchange::new());
    exchange.set_status("order-1", OrderStatus::PartiallyFilled, dec!(4));
    let (handle, running) = start_engine(&harness, exchange.clone(), Duration::from_millis(40));
    let id = condition_id(0x36);

    let order = handle.submit_order(buy(&id, dec!(10))).await.unwrap();
    assert_eq!(order.order_id.as_deref(), Some("order-1"));

    let position = wait_for_position(&harness, &id, |_| true).await.expect("position opened");
    assert_eq!(position.size, dec!(4));
    assert_eq!(position.status, PositionStatus::Open);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn settled_losses_stop_new_orders_for_the_day() {
    let harness = Harness::new("daily-loss");
    let limits = Arc::new(RiskLimits::new(dec!(100), dec!(4)));
    let tracker = PositionTracker::recover(
        harness.store.clone(),
        Arc::new(RecordingNotifier::new()),
        TEST_MARKET_URL,
    )
    .unwrap()
    .with_risk(limits.clone());

    let exchange = Arc::new(MockExchange::new());
    let (executor, _events) =
        executor_with_risk(exchange.clone(), Duration::from_millis(100), limits.clone());

    let lost = condition_id(0x37);
    tracker.on_order_filled(&filled_order(&lost, "order-lost")).unwrap();
    tracker.on_market_settled(&lost, Direction::Down).unwrap();
    assert_eq!(limits.daily_pnl(), dec!(-4));

    let err = assert_err!(executor.submit(buy(&condition_id(0x38), dec!(1))).await);
    assert!(matches!(err, OrderError::RiskRejected(_)));
    assert!(exchange.placed().is_empty());
}
