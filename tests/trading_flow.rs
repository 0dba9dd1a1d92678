mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{closer, closer_in, flat_candles, lock_dir, open_trade, FailingLedger, FakeGateway};
use spotguard::config::TradingDefaults;
use spotguard::db::{Ledger, SqliteLedger, TradeQuery};
use spotguard::config::StopLossType;
use spotguard::execution::{executable_quantity, BuyRequest, PositionSizer, SymbolLock};
use spotguard::recovery::RecoveryQueue;
use spotguard::risk::HaltSwitch;
use spotguard::{ExitReason, Outcome, Refusal, Side, SymbolRules};

fn funded_gateway() -> Arc<FakeGateway> {
    let gateway = FakeGateway::new();
    gateway.set_balance("USDT", 1000.0);
    gateway.set_price("BTCUSDT", 119.1);
    gateway.set_price("ETHUSDT", 100.0);
    gateway
}

fn sizer(gateway: &Arc<FakeGateway>, ledger: Arc<dyn Ledger>) -> PositionSizer {
    PositionSizer::new(gateway.clone(), ledger, TradingDefaults::default(), "USDT")
}

#[tokio::test]
async fn test_buy_floors_quantity_to_step() {
    let gateway = funded_gateway();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());

    // 15% of $1000 at 0.98 risk = $147 -> 1.2342... BTC at $119.1
    let outcome = tokio_test::assert_ok!(
        sizer(&gateway, ledger.clone())
            .buy(&BuyRequest::new("BTCUSDT"))
            .await
    );
    let report = outcome.success().expect("buy should succeed");

    assert_eq!(report.plan.quantity, 1.234);
    assert_eq!(gateway.orders(), vec![("BTCUSDT".to_string(), Side::Buy, 1.234)]);

    let trade = report.trade.unwrap();
    assert_eq!(trade.quantity, 1.234);
    assert!((trade.entry_price - 119.1).abs() < 1e-9);
    assert!((trade.stop_loss.unwrap() - 119.1 * 0.95).abs() < 1e-9);
    let stored = ledger.trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.quantity, trade.quantity);
    assert_eq!(stored.stop_loss, trade.stop_loss);
    assert!(stored.is_open);
}

#[test]
fn test_executable_quantity_floors_not_rounds() {
    let rules = SymbolRules {
        symbol: "BTCUSDT".to_string(),
        step_size: 0.001,
        min_notional: 10.0,
        min_qty: 0.001,
    };
    assert_eq!(executable_quantity(&rules, 1.23456).unwrap(), 1.234);
    assert_eq!(executable_quantity(&rules, 1.2349999).unwrap(), 1.234);
}

#[tokio::test]
async fn test_dry_run_submits_nothing() {
    let gateway = funded_gateway();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());

    let mut request = BuyRequest::new("ETHUSDT");
    request.dry_run = true;
    let report = sizer(&gateway, ledger.clone())
        .buy(&request)
        .await
        .unwrap()
        .success()
        .unwrap();

    assert!(report.dry_run);
    assert!(report.trade.is_none());
    assert_eq!(gateway.order_count(), 0);
    assert!(ledger.open_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_at_most_one_open_trade_per_symbol() {
    let gateway = funded_gateway();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    let sizer = sizer(&gateway, ledger.clone());

    assert!(sizer.buy(&BuyRequest::new("BTCUSDT")).await.unwrap().is_success());

    let second = sizer.buy(&BuyRequest::new("BTCUSDT")).await.unwrap();
    assert_eq!(
        second.refusal(),
        Some(&Refusal::PositionExists {
            symbol: "BTCUSDT".to_string()
        })
    );
    assert_eq!(gateway.order_count(), 1);

    let open = ledger
        .trades(&TradeQuery {
            symbol: Some("BTCUSDT".to_string()),
            open_only: true,
            ..TradeQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
}

#[tokio::test]
async fn test_below_minimum_is_refused() {
    let gateway = funded_gateway();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());

    let mut request = BuyRequest::new("ETHUSDT");
    request.allocation = Some(0.005); // ~$4.90
    let outcome = sizer(&gateway, ledger).buy(&request).await.unwrap();

    assert!(matches!(
        outcome.refusal(),
        Some(Refusal::BelowMinimum { minimum, .. }) if *minimum == 10.0
    ));
    assert_eq!(gateway.order_count(), 0);
}

#[tokio::test]
async fn test_failed_order_is_refused_not_raised() {
    let gateway = funded_gateway();
    gateway.fail_orders(true);
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());

    let outcome = sizer(&gateway, ledger.clone())
        .buy(&BuyRequest::new("ETHUSDT"))
        .await
        .unwrap();

    assert!(matches!(outcome.refusal(), Some(Refusal::OrderFailed { side, .. }) if side == "BUY"));
    assert!(ledger.open_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_pnl_is_exact() {
    let gateway = FakeGateway::new();
    gateway.set_price("ETHUSDT", 110.0);
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger
        .insert_trade(&open_trade("t1", "ETHUSDT", 100.0, 2.0))
        .await
        .unwrap();

    let report = closer(gateway.clone(), ledger.clone())
        .sell("ETHUSDT", None, false)
        .await
        .unwrap()
        .success()
        .unwrap();

    assert_eq!(report.pnl, 20.0);
    assert_eq!(report.pnl_pct, 10.0);
    assert_eq!(report.fee_quote, 0.0);
    assert_eq!(report.reason, ExitReason::Manual);

    let stored = ledger.trade("t1").await.unwrap().unwrap();
    assert!(!stored.is_open);
    assert_eq!(stored.pnl, Some(20.0));
    assert_eq!(stored.exit_price, Some(110.0));
    assert_eq!(stored.exit_reason, Some(ExitReason::Manual));
}

#[tokio::test]
async fn test_atr_stop_from_candles() {
    let gateway = funded_gateway();
    // Constant range of 4 around a flat close: ATR 4.0, stop distance 6.0
    gateway.set_candles("ETHUSDT", flat_candles(15, 100.0, 4.0));
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger.set_config_value("stop_loss_type", "ATR").await.unwrap();

    let report = sizer(&gateway, ledger.clone())
        .buy(&BuyRequest::new("ETHUSDT"))
        .await
        .unwrap()
        .success()
        .unwrap();

    assert_eq!(report.plan.stop_loss_type, StopLossType::Atr);
    assert_eq!(report.plan.atr, Some(4.0));
    assert_eq!(report.plan.stop_loss, 94.0);

    let trade = report.trade.unwrap();
    assert_eq!(trade.stop_loss, Some(94.0));
    let stored = ledger.trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.atr, Some(4.0));
    assert_eq!(stored.stop_loss, Some(94.0));
}

#[tokio::test]
async fn test_atr_stop_falls_back_to_percent_without_history() {
    let gateway = funded_gateway();
    gateway.set_candles("ETHUSDT", flat_candles(5, 100.0, 4.0));
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger.set_config_value("stop_loss_type", "ATR").await.unwrap();

    let report = sizer(&gateway, ledger.clone())
        .buy(&BuyRequest::new("ETHUSDT"))
        .await
        .unwrap()
        .success()
        .unwrap();

    assert_eq!(report.plan.atr, None);
    assert!((report.plan.stop_loss - 95.0).abs() < 1e-9);

    let stored = ledger
        .trade(&report.trade.unwrap().trade_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.atr, None);
    assert!((stored.stop_loss.unwrap() - 95.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_close_refused_while_symbol_locked() {
    let gateway = FakeGateway::new();
    gateway.set_price("ETHUSDT", 110.0);
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger
        .insert_trade(&open_trade("t1", "ETHUSDT", 100.0, 2.0))
        .await
        .unwrap();

    let dir = lock_dir();
    let held = SymbolLock::acquire(&dir, "ETHUSDT", Duration::from_secs(300))
        .unwrap()
        .unwrap();

    let closer = closer_in(gateway.clone(), ledger.clone(), dir.clone());
    let outcome = closer.sell("ETHUSDT", None, false).await.unwrap();
    assert!(matches!(
        outcome.refusal(),
        Some(Refusal::LockContended { symbol }) if symbol == "ETHUSDT"
    ));
    assert_eq!(gateway.order_count(), 0);
    assert!(ledger.trade("t1").await.unwrap().unwrap().is_open);

    // Released holder lets the close through
    drop(held);
    let outcome = closer.sell("ETHUSDT", None, false).await.unwrap();
    assert!(outcome.success().is_some());
    assert_eq!(gateway.order_count(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_lock_released_after_failed_close() {
    let gateway = FakeGateway::new();
    gateway.set_price("ETHUSDT", 110.0);
    gateway.fail_orders(true);
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger
        .insert_trade(&open_trade("t1", "ETHUSDT", 100.0, 2.0))
        .await
        .unwrap();

    let dir = lock_dir();
    let outcome = closer_in(gateway.clone(), ledger.clone(), dir.clone())
        .sell("ETHUSDT", None, false)
        .await
        .unwrap();

    assert!(matches!(outcome.refusal(), Some(Refusal::OrderFailed { side, .. }) if side == "SELL"));
    assert!(!dir.join(".lock_ETHUSDT").exists());
    assert!(ledger.trade("t1").await.unwrap().unwrap().is_open);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_close_unknown_position_is_refused() {
    let gateway = FakeGateway::new();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    let closer = closer(gateway.clone(), ledger);

    let outcome = closer.sell("SOLUSDT", None, false).await.unwrap();
    assert!(matches!(outcome.refusal(), Some(Refusal::NoOpenPosition { .. })));

    let outcome = closer.close_by_id("missing", None, false).await.unwrap();
    assert!(matches!(outcome.refusal(), Some(Refusal::NoOpenPosition { target }) if target == "missing"));
    assert_eq!(gateway.order_count(), 0);
}

#[tokio::test]
async fn test_halt_blocks_buys_but_not_closes() {
    let gateway = funded_gateway();
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    ledger
        .insert_trade(&open_trade("t1", "ETHUSDT", 90.0, 1.0))
        .await
        .unwrap();

    HaltSwitch::new(ledger.clone()).halt().await.unwrap();

    let outcome = sizer(&gateway, ledger.clone())
        .buy(&BuyRequest::new("BTCUSDT"))
        .await
        .unwrap();
    assert_eq!(outcome.refusal(), Some(&Refusal::Halted));
    assert_eq!(gateway.order_count(), 0);

    let close = closer(gateway.clone(), ledger.clone())
        .sell("ETHUSDT", Some(ExitReason::Other("risk_off".to_string())), false)
        .await
        .unwrap();
    assert!(close.is_success());
    assert_eq!(gateway.orders(), vec![("ETHUSDT".to_string(), Side::Sell, 1.0)]);
}

#[tokio::test]
async fn test_buy_persistence_failure_is_queued_and_replayed() {
    let gateway = funded_gateway();
    let ledger = FailingLedger::new().await;
    ledger.fail_inserts(true);
    let dyn_ledger: Arc<dyn Ledger> = ledger.clone();

    let outcome = sizer(&gateway, dyn_ledger.clone())
        .buy(&BuyRequest::new("ETHUSDT"))
        .await
        .unwrap();
    let report = match outcome {
        Outcome::Success(report) => report,
        Outcome::Refused(refusal) => panic!("buy refused: {refusal}"),
    };
    let trade = report.trade.unwrap();
    assert!(report.recovery_id.is_some());
    assert_eq!(gateway.order_count(), 1);
    assert!(dyn_ledger.open_trade_for_symbol("ETHUSDT").await.unwrap().is_none());

    let pending = dyn_ledger.pending_recovery().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reason, "post_buy_persistence_failure");
    assert_eq!(pending[0].payload["trade_id"], trade.trade_id.as_str());

    // Storage is back
    ledger.fail_inserts(false);
    let retry = RecoveryQueue::new(dyn_ledger.clone()).retry_all().await.unwrap();
    assert_eq!((retry.total, retry.succeeded, retry.failed), (1, 1, 0));

    let stored = dyn_ledger.trade(&trade.trade_id).await.unwrap().unwrap();
    assert_eq!(stored.quantity, trade.quantity);
    assert_eq!(stored.entry_price, trade.entry_price);
    assert!(stored.is_open);
    assert!(dyn_ledger.pending_recovery().await.unwrap().is_empty());
    // Replay never touches the exchange
    assert_eq!(gateway.order_count(), 1);
}

#[tokio::test]
async fn test_sell_persistence_failure_is_queued_and_replayed() {
    let gateway = FakeGateway::new();
    gateway.set_price("ETHUSDT", 120.0);
    let ledger = FailingLedger::new().await;
    let dyn_ledger: Arc<dyn Ledger> = ledger.clone();
    dyn_ledger
        .insert_trade(&open_trade("t1", "ETHUSDT", 100.0, 1.0))
        .await
        .unwrap();

    ledger.fail_updates(true);
    let report = closer(gateway.clone(), dyn_ledger.clone())
        .sell("ETHUSDT", None, false)
        .await
        .unwrap()
        .success()
        .unwrap();
    assert!(report.recovery_id.is_some());
    assert!(dyn_ledger.trade("t1").await.unwrap().unwrap().is_open);

    let queue = RecoveryQueue::new(dyn_ledger.clone());
    let retry = queue.retry_all().await.unwrap();
    assert_eq!(retry.failed, 1);
    assert_eq!(queue.list().await.unwrap().count, 1);

    ledger.fail_updates(false);
    let retry = queue.retry_all().await.unwrap();
    assert_eq!(retry.succeeded, 1);

    let stored = dyn_ledger.trade("t1").await.unwrap().unwrap();
    assert!(!stored.is_open);
    assert_eq!(stored.pnl, Some(20.0));
    assert_eq!(gateway.order_count(), 1);
}
