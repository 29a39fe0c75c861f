//! Recording gateway and fixtures shared by the protection integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use perp_guard_core::{
    AppConfig, ExchangeEvent, ExchangeGateway, ExchangePosition, FillEvent, GatewayError,
    Instrument, MarketStructure, OpenOrder, OrderId, OrderRequest, OrderType, ProtectionEvent,
    Side,
};
use perp_guard_protection::ProtectionEngine;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit(OrderId, OrderRequest),
    Cancel(OrderId),
}

type RejectRule = Box<dyn Fn(&OrderRequest) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    next_id: u64,
    calls: Vec<Call>,
    requests: HashMap<OrderId, OrderRequest>,
    open: Vec<OpenOrder>,
    positions: HashMap<Instrument, ExchangePosition>,
    reject: Option<RejectRule>,
    fail_cancels: bool,
}

/// In-memory gateway that records every call. Market orders never rest; fills
/// are driven explicitly by the test through [`MockGateway::fill`].
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<State>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_position(&self, instrument: &str, side: Side, quantity: Decimal, entry: Decimal) {
        let instrument = Instrument::new(instrument);
        self.state.lock().positions.insert(
            instrument.clone(),
            ExchangePosition {
                instrument,
                side,
                quantity,
                entry_price: entry,
                mark_price: entry,
            },
        );
    }

    pub fn clear_position(&self, instrument: &str) {
        self.state.lock().positions.remove(&Instrument::new(instrument));
    }

    pub fn position_of(&self, instrument: &str) -> Option<ExchangePosition> {
        self.state.lock().positions.get(&Instrument::new(instrument)).cloned()
    }

    /// Rejects every submission matching `rule` until cleared.
    pub fn reject_when(&self, rule: impl Fn(&OrderRequest) -> bool + Send + Sync + 'static) {
        self.state.lock().reject = Some(Box::new(rule));
    }

    pub fn clear_rejections(&self) {
        self.state.lock().reject = None;
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.state.lock().fail_cancels = fail;
    }

    /// Removes a resting order without telling the engine.
    pub fn drop_order(&self, order_id: &OrderId) {
        self.state.lock().open.retain(|o| &o.order_id != order_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn submitted(&self) -> Vec<(OrderId, OrderRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit(id, request) => Some((id, request)),
                Call::Cancel(_) => None,
            })
            .collect()
    }

    /// Submitted orders that could open or add to a position.
    pub fn entries(&self) -> Vec<(OrderId, OrderRequest)> {
        self.submitted()
            .into_iter()
            .filter(|(_, r)| !r.reduce_only)
            .collect()
    }

    pub fn open(&self) -> Vec<OpenOrder> {
        self.state.lock().open.clone()
    }

    pub fn stops(&self) -> Vec<OpenOrder> {
        self.open()
            .into_iter()
            .filter(|o| o.order_type == OrderType::StopMarket)
            .collect()
    }

    pub fn take_profits(&self) -> Vec<OpenOrder> {
        self.open()
            .into_iter()
            .filter(|o| o.order_type == OrderType::Limit)
            .collect()
    }

    /// Fills the whole order at `price`.
    pub fn fill(&self, order_id: &OrderId, price: Decimal) -> Vec<ExchangeEvent> {
        let quantity = self
            .state
            .lock()
            .requests
            .get(order_id)
            .map_or(Decimal::ZERO, |r| r.quantity);
        self.fill_partial(order_id, quantity, price)
    }

    /// Fills `quantity` of the order, moving the position the way an exchange would.
    pub fn fill_partial(&self, order_id: &OrderId, quantity: Decimal, price: Decimal) -> Vec<ExchangeEvent> {
        let mut state = self.state.lock();
        let Some(request) = state.requests.get(order_id).cloned() else {
            return Vec::new();
        };
        if let Some(pos) = state.open.iter().position(|o| &o.order_id == order_id) {
            if state.open[pos].quantity > quantity {
                state.open[pos].quantity -= quantity;
            } else {
                state.open.remove(pos);
            }
        }

        let instrument = request.instrument.clone();
        let mut events = Vec::new();
        let mut filled = quantity;
        match state.positions.get(&instrument).cloned() {
            None => {
                state.positions.insert(
                    instrument.clone(),
                    ExchangePosition {
                        instrument: instrument.clone(),
                        side: request.side.opening_side(),
                        quantity,
                        entry_price: price,
                        mark_price: price,
                    },
                );
            }
            Some(mut position) if position.side.entry_order_side() == request.side => {
                let total = position.quantity + quantity;
                position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
                position.quantity = total;
                position.mark_price = price;
                state.positions.insert(instrument.clone(), position);
            }
            Some(mut position) => {
                filled = quantity.min(position.quantity);
                position.quantity -= filled;
                position.mark_price = price;
                if position.quantity.is_zero() {
                    state.positions.remove(&instrument);
                    let pnl = match position.side {
                        Side::Long => (price - position.entry_price) * filled,
                        Side::Short => (position.entry_price - price) * filled,
                    };
                    events.push(ExchangeEvent::PositionClosed {
                        instrument: instrument.clone(),
                        side: position.side,
                        quantity: filled,
                        price,
                        realized_pnl: pnl,
                        timestamp: Utc::now(),
                    });
                } else {
                    state.positions.insert(instrument.clone(), position);
                }
            }
        }

        events.insert(
            0,
            ExchangeEvent::Filled(FillEvent {
                order_id: order_id.clone(),
                instrument,
                side: request.side,
                quantity: filled,
                price,
                reduce_only: request.reduce_only,
                commission: Decimal::ZERO,
                timestamp: Utc::now(),
            }),
        );
        events
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        let mut state = self.state.lock();
        if state.reject.as_ref().is_some_and(|rule| rule(request)) {
            return Err(GatewayError::Rejected("scripted rejection".to_string()));
        }
        state.next_id += 1;
        let order_id = OrderId::new(format!("ord-{}", state.next_id));
        state.calls.push(Call::Submit(order_id.clone(), request.clone()));
        state.requests.insert(order_id.clone(), request.clone());
        if request.order_type != OrderType::Market {
            state.open.push(OpenOrder {
                order_id: order_id.clone(),
                instrument: request.instrument.clone(),
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                price: request.price,
                trigger_price: request.trigger_price,
                reduce_only: request.reduce_only,
            });
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, _instrument: &Instrument, order_id: &OrderId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.fail_cancels {
            return Err(GatewayError::Network("scripted cancel failure".to_string()));
        }
        let before = state.open.len();
        state.open.retain(|o| &o.order_id != order_id);
        if state.open.len() == before {
            return Err(GatewayError::OrderNotFound(order_id.clone()));
        }
        state.calls.push(Call::Cancel(order_id.clone()));
        Ok(())
    }

    async fn open_orders(&self, instrument: &Instrument) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(self
            .state
            .lock()
            .open
            .iter()
            .filter(|o| &o.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn position(&self, instrument: &Instrument) -> Result<Option<ExchangePosition>, GatewayError> {
        Ok(self.state.lock().positions.get(instrument).cloned())
    }
}

pub fn btc() -> Instrument {
    Instrument::new("BTC")
}

pub fn structure(price: Decimal, support: Decimal, resistance: Decimal) -> MarketStructure {
    MarketStructure::new(btc(), price, Some(support), Some(resistance))
}

/// Engine on default config with BTC last traded at 100.
pub async fn engine(gateway: &Arc<MockGateway>) -> ProtectionEngine {
    let mut engine = ProtectionEngine::new(gateway.clone(), AppConfig::default());
    engine.on_price(&btc(), dec!(100)).await;
    engine
}

pub async fn deliver(engine: &mut ProtectionEngine, events: Vec<ExchangeEvent>) {
    for event in events {
        engine.on_exchange_event(event).await;
    }
}

/// Long 1 BTC filled at 100 with SL 99 / TP 103.
pub async fn open_long(engine: &mut ProtectionEngine, gateway: &Arc<MockGateway>) -> OrderId {
    let entry = engine
        .open_position(&btc(), Side::Long, dec!(1), Some((dec!(99), dec!(103))), None)
        .await
        .unwrap();
    let events = gateway.fill(&entry, dec!(100));
    deliver(engine, events).await;
    entry
}

pub fn drain(rx: &mut broadcast::Receiver<ProtectionEvent>) -> Vec<ProtectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn has_critical(events: &[ProtectionEvent]) -> bool {
    events.iter().any(ProtectionEvent::is_critical)
}
