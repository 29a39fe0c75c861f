//! Bracket entry: validation, structure fallback, two-phase protection.

mod common;

use common::{btc, deliver, drain, engine, has_critical, open_long, structure, MockGateway};
use perp_guard_core::{
    Confidence, OrderSide, OrderType, ProtectionError, ProtectionEvent, ProtectiveKind, Side,
    SignalAction, TradingSignal, ValidationFailure,
};
use perp_guard_protection::SignalOutcome;
use rust_decimal_macros::dec;

fn long_signal(sl: rust_decimal::Decimal, tp: rust_decimal::Decimal) -> TradingSignal {
    TradingSignal {
        action: SignalAction::Long,
        confidence: Confidence::Medium,
        stop_loss: Some(sl),
        take_profit: Some(tp),
        position_size_pct: Some(dec!(0.01)),
        ..TradingSignal::hold(btc())
    }
}

#[tokio::test]
async fn accepted_bracket_protects_after_fill() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;

    let entry = engine
        .open_position(&btc(), Side::Long, dec!(1), Some((dec!(99), dec!(103))), None)
        .await
        .unwrap();

    // Phase one: entry only.
    let submitted = gateway.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].1.order_type, OrderType::Market);
    assert_eq!(submitted[0].1.side, OrderSide::Buy);
    assert!(!submitted[0].1.reduce_only);
    assert!(engine.has_pending_entry(&btc()));
    assert!(engine.record(&btc()).is_none());

    let events = gateway.fill(&entry, dec!(100));
    deliver(&mut engine, events).await;

    let stops = gateway.stops();
    let tps = gateway.take_profits();
    assert_eq!(stops.len(), 1);
    assert_eq!(tps.len(), 1);
    assert_eq!(stops[0].trigger_price, Some(dec!(99)));
    assert_eq!(tps[0].price, Some(dec!(103)));
    assert!(stops[0].reduce_only && tps[0].reduce_only);
    assert_eq!(stops[0].quantity, dec!(1));
    assert_eq!(tps[0].quantity, dec!(1));

    let record = engine.record(&btc()).unwrap();
    assert_eq!(record.sl_order_ref.as_ref(), Some(&stops[0].order_id));
    assert_eq!(record.tp_order_ref.as_ref(), Some(&tps[0].order_id));
    assert!(!engine.has_pending_entry(&btc()));
}

#[tokio::test]
async fn too_tight_stop_falls_back_to_structure() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;
    let levels = structure(dec!(100), dec!(97), dec!(106));

    let entry = engine
        .open_position(
            &btc(),
            Side::Long,
            dec!(1),
            Some((dec!(99.8), dec!(100.5))),
            Some(&levels),
        )
        .await
        .unwrap();
    let events = gateway.fill(&entry, dec!(100));
    deliver(&mut engine, events).await;

    let record = engine.record(&btc()).unwrap();
    assert_eq!(record.current_sl_price, Some(dec!(96.806)));
    assert_eq!(record.current_tp_price, Some(dec!(105.788)));
}

#[tokio::test]
async fn invalid_levels_without_structure_abort() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;

    let result = engine
        .open_position(&btc(), Side::Long, dec!(1), Some((dec!(99.8), dec!(100.5))), None)
        .await;

    assert!(matches!(
        result,
        Err(ProtectionError::Validation(ValidationFailure::StopTooTight { .. }))
    ));
    assert!(gateway.calls().is_empty());
    assert!(engine.record(&btc()).is_none());
}

#[tokio::test]
async fn slippage_moves_take_profit_out() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;

    let entry = engine
        .open_position(&btc(), Side::Long, dec!(1), Some((dec!(98), dec!(103))), None)
        .await
        .unwrap();
    // Filled at 101: risk 3, reward 2 -> TP moved to 101 + 1.5 * 3.
    let events = gateway.fill(&entry, dec!(101));
    deliver(&mut engine, events).await;

    assert_eq!(gateway.take_profits()[0].price, Some(dec!(105.5)));
    assert_eq!(gateway.stops()[0].trigger_price, Some(dec!(98)));
}

#[tokio::test]
async fn failed_stop_escalates_to_emergency() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;
    let mut rx = engine.subscribe();
    gateway.reject_when(|r| r.trigger_price == Some(dec!(99)));

    open_long(&mut engine, &gateway).await;

    let stops = gateway.stops();
    assert_eq!(stops.len(), 1);
    // 100 × (1 - 0.02)
    assert_eq!(stops[0].trigger_price, Some(dec!(98)));
    assert_eq!(gateway.take_profits().len(), 1);

    let events = drain(&mut rx);
    assert!(has_critical(&events));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProtectionEvent::EmergencyStopPlaced { .. })));
}

#[tokio::test]
async fn failed_take_profit_keeps_stop_and_alerts() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;
    let mut rx = engine.subscribe();
    gateway.reject_when(|r| r.order_type == OrderType::Limit);

    open_long(&mut engine, &gateway).await;

    assert_eq!(gateway.stops().len(), 1);
    assert!(gateway.take_profits().is_empty());
    assert!(has_critical(&drain(&mut rx)));
    let record = engine.record(&btc()).unwrap();
    assert!(record.order_ref(ProtectiveKind::TakeProfit).is_none());
}

#[tokio::test]
async fn rejected_entry_leaves_no_state() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;
    gateway.reject_when(|r| r.order_type == OrderType::Market);

    let result = engine
        .open_position(&btc(), Side::Long, dec!(1), Some((dec!(99), dec!(103))), None)
        .await;

    assert!(matches!(result, Err(ProtectionError::Gateway(_))));
    assert!(!engine.has_pending_entry(&btc()));
    assert!(gateway.open().is_empty());
}

#[tokio::test]
async fn signal_opens_and_skips_invalid_levels() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;

    let outcome = engine
        .on_signal(&long_signal(dec!(99.8), dec!(100.5)), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(reason) if reason.starts_with("open aborted")));
    assert!(gateway.calls().is_empty());

    let outcome = engine
        .on_signal(&long_signal(dec!(99), dec!(103)), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Opened(_)));
    // 10000 × 0.01 / 100
    assert_eq!(gateway.entries()[0].1.quantity, dec!(1));

    // A second signal while the entry is unfilled is ignored.
    let outcome = engine
        .on_signal(&long_signal(dec!(99), dec!(103)), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(_)));
    assert_eq!(gateway.entries().len(), 1);
}

#[tokio::test]
async fn small_entry_is_rounded_up_to_min_notional() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;

    engine
        .open_position(&btc(), Side::Long, dec!(0.01), Some((dec!(99), dec!(103))), None)
        .await
        .unwrap();

    // 10 × 1.1 / 100 = 0.11
    assert_eq!(gateway.entries()[0].1.quantity, dec!(0.11));
}

#[tokio::test]
async fn hold_signal_does_nothing() {
    let gateway = MockGateway::new();
    let mut engine = engine(&gateway).await;
    let outcome = engine.on_signal(&TradingSignal::hold(btc()), None).await.unwrap();
    assert_eq!(outcome, SignalOutcome::Held);
    assert!(gateway.calls().is_empty());
}
