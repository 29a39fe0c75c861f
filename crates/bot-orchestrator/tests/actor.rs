//! Actor scenarios against the paper exchange.

use std::sync::Arc;

use perp_guard_core::{
    AppConfig, ExchangeEvent, ExchangeGateway, Instrument, MarketEvent, OrderRequest, OrderSide, OrderType,
    ProtectionEvent, RawSignal, RollingStructure, Side,
};
use perp_guard_orchestrator::{ActorInputs, BotState, ControlHandle, ReplaySignalProducer, TradingActor};
use perp_guard_paper::PaperExchange;
use perp_guard_protection::{ProtectionEngine, SignalOutcome};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn btc() -> Instrument {
    Instrument::new("BTC")
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.bot.instruments = vec!["BTC".to_string()];
    config.bot.cycle_interval_secs = 3600;
    config.trailing.enabled = false;
    config
}

fn long_signal() -> RawSignal {
    RawSignal {
        instrument: "BTC".to_string(),
        signal: "LONG".to_string(),
        confidence: Some("HIGH".to_string()),
        stop_loss: Some(dec!(98)),
        take_profit: Some(dec!(104)),
        position_size_pct: Some(dec!(0.01)),
    }
}

struct Harness {
    paper: Arc<PaperExchange>,
    handle: ControlHandle,
    ticks: mpsc::Sender<MarketEvent>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn start(
        paper: Arc<PaperExchange>,
        exchange_events: mpsc::UnboundedReceiver<ExchangeEvent>,
        signals: Vec<RawSignal>,
    ) -> Self {
        let config = config();
        let engine = ProtectionEngine::new(paper.clone(), config);
        let (ticks, tick_rx) = mpsc::channel(64);
        let inputs = ActorInputs {
            exchange_events,
            ticks: tick_rx,
            config_updates: None,
        };
        let (actor, handle) = TradingActor::new(
            engine,
            Box::new(ReplaySignalProducer::from_raw(signals)),
            Box::new(RollingStructure::default()),
            inputs,
        );
        let task = tokio::spawn(actor.run());
        Self {
            paper,
            handle,
            ticks,
            task,
        }
    }

    async fn price(&self, price: Decimal) {
        self.paper.update_price(&btc(), price);
        self.ticks.send(MarketEvent::tick(btc(), price)).await.unwrap();
    }

    async fn stops(&self) -> Vec<Decimal> {
        self.paper
            .open_orders(&btc())
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.order_type == OrderType::StopMarket)
            .filter_map(|o| o.trigger_price)
            .collect()
    }

    async fn stop(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn fresh_paper() -> (Arc<PaperExchange>, mpsc::UnboundedReceiver<ExchangeEvent>) {
    let (paper, rx) = PaperExchange::new(&config().exchange);
    paper.update_price(&btc(), dec!(100));
    (paper, rx)
}

#[tokio::test]
async fn signal_opens_protected_position() {
    let (paper, rx) = fresh_paper();
    let harness = Harness::start(paper, rx, vec![long_signal()]);
    harness.price(dec!(100)).await;

    harness.handle.run_cycle().await.unwrap();
    // Second cycle drains the entry fill queued by the first.
    harness.handle.run_cycle().await.unwrap();

    let status = harness.handle.status();
    assert_eq!(status.state, BotState::Running);
    assert_eq!(status.cycles_completed, 2);
    assert_eq!(status.prices.get(&btc()), Some(&dec!(100)));
    let record = status.position(&btc()).unwrap();
    assert_eq!(record.side, Side::Long);
    assert_eq!(record.quantity, dec!(1));
    assert!(record.sl_order_ref.is_some());
    assert!(record.tp_order_ref.is_some());

    assert_eq!(harness.stops().await, vec![dec!(98)]);
    harness.stop().await;
}

#[tokio::test]
async fn startup_reconcile_protects_orphan_position() {
    let (paper, mut rx) = fresh_paper();
    paper
        .submit_order(&OrderRequest::market(btc(), OrderSide::Buy, dec!(0.5), false))
        .await
        .unwrap();
    // The pre-existing fill happened before this process started.
    while rx.try_recv().is_ok() {}

    let harness = Harness::start(paper, rx, Vec::new());
    harness.handle.run_cycle().await.unwrap();

    assert_eq!(harness.stops().await, vec![dec!(98)]);
    let status = harness.handle.status();
    assert_eq!(status.position(&btc()).unwrap().quantity, dec!(0.5));
    harness.stop().await;
}

#[tokio::test]
async fn paused_actor_ignores_signals_until_resumed() {
    let (paper, rx) = fresh_paper();
    let harness = Harness::start(paper, rx, vec![long_signal()]);
    harness.price(dec!(100)).await;

    harness.handle.pause().await.unwrap();
    harness.handle.run_cycle().await.unwrap();
    assert!(harness.handle.status().is_paused());
    assert!(harness.paper.position(&btc()).await.unwrap().is_none());

    harness.handle.resume().await.unwrap();
    harness.handle.run_cycle().await.unwrap();
    harness.handle.run_cycle().await.unwrap();

    assert!(harness.handle.status().position(&btc()).is_some());
    harness.stop().await;
}

#[tokio::test]
async fn control_commands_route_through_engine() {
    let (paper, rx) = fresh_paper();
    let harness = Harness::start(paper, rx, vec![long_signal()]);
    let mut events = harness.handle.subscribe();
    harness.price(dec!(100)).await;
    harness.handle.run_cycle().await.unwrap();
    harness.handle.run_cycle().await.unwrap();

    harness.handle.modify_sl(btc(), dec!(98.5)).await.unwrap();
    assert_eq!(harness.stops().await, vec![dec!(98.5)]);

    // Above the market is not a valid long stop.
    assert!(harness.handle.modify_sl(btc(), dec!(101)).await.is_err());
    assert_eq!(harness.stops().await, vec![dec!(98.5)]);

    let outcome = harness.handle.close(btc()).await.unwrap();
    assert_eq!(outcome, SignalOutcome::Closing);
    harness.handle.run_cycle().await.unwrap();

    assert!(harness.handle.status().positions.is_empty());
    assert!(harness.paper.position(&btc()).await.unwrap().is_none());
    assert!(harness.paper.open_orders(&btc()).await.unwrap().is_empty());

    let mut closed = false;
    while let Ok(event) = events.try_recv() {
        closed |= matches!(event, ProtectionEvent::PositionClosed { .. });
    }
    assert!(closed);
    harness.stop().await;
}

#[tokio::test]
async fn stop_triggered_by_price_closes_record() {
    let (paper, rx) = fresh_paper();
    let harness = Harness::start(paper, rx, vec![long_signal()]);
    harness.price(dec!(100)).await;
    harness.handle.run_cycle().await.unwrap();
    harness.handle.run_cycle().await.unwrap();

    harness.price(dec!(97.5)).await;
    harness.handle.run_cycle().await.unwrap();

    assert!(harness.handle.status().position(&btc()).is_none());
    assert!(harness.paper.open_orders(&btc()).await.unwrap().is_empty());
    assert!(harness.paper.account().realized_pnl < Decimal::ZERO);
    harness.stop().await;
}

#[tokio::test]
async fn dropping_every_handle_stops_actor() {
    let (paper, rx) = fresh_paper();
    let harness = Harness::start(paper, rx, Vec::new());
    let Harness { handle, task, ticks, .. } = harness;
    drop(handle);
    drop(ticks);
    task.await.unwrap().unwrap();
}
