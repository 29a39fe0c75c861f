use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use perp_guard_core::{
    ExchangeConfig, ExchangeEvent, ExchangeGateway, ExchangePosition, FillEvent, GatewayError,
    Instrument, OpenOrder, OrderId, OrderRequest, OrderSide, OrderType, Side,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Running totals for a paper session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperAccount {
    pub realized_pnl: Decimal,
    pub commissions: Decimal,
    pub fills: u64,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    quantity: Decimal,
    entry_price: Decimal,
    realized_pnl: Decimal,
}

#[derive(Default)]
struct PaperState {
    next_id: u64,
    prices: HashMap<Instrument, Decimal>,
    positions: HashMap<Instrument, PaperPosition>,
    resting: Vec<OpenOrder>,
    account: PaperAccount,
}

/// In-memory exchange for paper trading.
///
/// - market orders fill immediately at the last price ± slippage
/// - stop and limit orders rest until [`PaperExchange::update_price`] crosses them
/// - reduce-only orders larger than the position are rejected
/// - non-reduce orders below `min_notional` are rejected
pub struct PaperExchange {
    state: Mutex<PaperState>,
    events: mpsc::UnboundedSender<ExchangeEvent>,
    commission_rate: Decimal,
    slippage_bps: Decimal,
    min_notional: Decimal,
}

impl PaperExchange {
    /// Creates the exchange and the receiving end of its event stream.
    #[must_use]
    pub fn new(config: &ExchangeConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let exchange = Self {
            state: Mutex::new(PaperState::default()),
            events,
            commission_rate: config.paper_commission_rate,
            slippage_bps: config.paper_slippage_bps,
            min_notional: config.min_notional,
        };
        (Arc::new(exchange), rx)
    }

    #[must_use]
    pub fn account(&self) -> PaperAccount {
        self.state.lock().account
    }

    #[must_use]
    pub fn last_price(&self, instrument: &Instrument) -> Option<Decimal> {
        self.state.lock().prices.get(instrument).copied()
    }

    /// Records a new traded price and fills any resting order it crosses.
    pub fn update_price(&self, instrument: &Instrument, price: Decimal) {
        let events = {
            let mut state = self.state.lock();
            state.prices.insert(instrument.clone(), price);

            let (triggered, resting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.resting)
                .into_iter()
                .partition(|o| &o.instrument == instrument && is_triggered(o, price));
            state.resting = resting;

            let mut events = Vec::new();
            // Stops first: a gap through both legs should stop out, not take profit.
            let (stops, limits): (Vec<_>, Vec<_>) = triggered
                .into_iter()
                .partition(|o| o.order_type == OrderType::StopMarket);
            for order in stops.into_iter().chain(limits) {
                let fill_price = match order.order_type {
                    OrderType::StopMarket => self.apply_slippage(price, order.side),
                    OrderType::Limit | OrderType::Market => order.price.unwrap_or(price),
                };
                let quantity = if order.reduce_only {
                    let open = reducible(&state, &order.instrument, order.side);
                    if open.is_zero() {
                        tracing::debug!(order_id = %order.order_id, "Reduce-only order triggered while flat, cancelled");
                        events.push(ExchangeEvent::Canceled {
                            order_id: order.order_id.clone(),
                            instrument: order.instrument.clone(),
                        });
                        continue;
                    }
                    order.quantity.min(open)
                } else {
                    order.quantity
                };
                tracing::info!(
                    instrument = %order.instrument,
                    order_id = %order.order_id,
                    order_type = ?order.order_type,
                    %fill_price,
                    %quantity,
                    "Paper order triggered"
                );
                events.extend(self.apply_fill(
                    &mut state,
                    &order.order_id,
                    &order.instrument,
                    order.side,
                    quantity,
                    fill_price,
                    order.reduce_only,
                ));
            }
            events
        };
        self.publish(events);
    }

    fn apply_slippage(&self, price: Decimal, side: OrderSide) -> Decimal {
        let slippage = price * self.slippage_bps / Decimal::from(10_000);
        match side {
            OrderSide::Buy => price + slippage,
            OrderSide::Sell => price - slippage,
        }
    }

    fn publish(&self, events: Vec<ExchangeEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                tracing::warn!("Paper exchange event receiver dropped");
                return;
            }
        }
    }

    /// Nets a fill into the position and returns the resulting events.
    #[allow(clippy::too_many_arguments)]
    fn apply_fill(
        &self,
        state: &mut PaperState,
        order_id: &OrderId,
        instrument: &Instrument,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Vec<ExchangeEvent> {
        let commission = price * quantity * self.commission_rate;
        state.account.commissions += commission;
        state.account.fills += 1;

        let mut events = vec![ExchangeEvent::Filled(FillEvent {
            order_id: order_id.clone(),
            instrument: instrument.clone(),
            side,
            quantity,
            price,
            reduce_only,
            commission,
            timestamp: Utc::now(),
        })];

        let opening = side.opening_side();
        let Some(mut position) = state.positions.remove(instrument) else {
            state.positions.insert(
                instrument.clone(),
                PaperPosition {
                    side: opening,
                    quantity,
                    entry_price: price,
                    realized_pnl: Decimal::ZERO,
                },
            );
            return events;
        };

        if position.side == opening {
            let total = position.quantity + quantity;
            position.entry_price = (position.entry_price * position.quantity + price * quantity) / total;
            position.quantity = total;
            state.positions.insert(instrument.clone(), position);
            return events;
        }

        let closed = quantity.min(position.quantity);
        let pnl = match position.side {
            Side::Long => (price - position.entry_price) * closed,
            Side::Short => (position.entry_price - price) * closed,
        };
        position.realized_pnl += pnl;
        position.quantity -= closed;
        state.account.realized_pnl += pnl;

        if position.quantity > Decimal::ZERO {
            state.positions.insert(instrument.clone(), position);
            return events;
        }

        tracing::info!(
            instrument = %instrument,
            side = %position.side,
            realized_pnl = %position.realized_pnl,
            "Paper position closed"
        );
        events.push(ExchangeEvent::PositionClosed {
            instrument: instrument.clone(),
            side: position.side,
            quantity: closed,
            price,
            realized_pnl: position.realized_pnl,
            timestamp: Utc::now(),
        });

        let flipped = quantity - closed;
        if flipped > Decimal::ZERO && !reduce_only {
            state.positions.insert(
                instrument.clone(),
                PaperPosition {
                    side: opening,
                    quantity: flipped,
                    entry_price: price,
                    realized_pnl: Decimal::ZERO,
                },
            );
        }
        events
    }
}

/// Quantity a reduce-only order on `side` may close.
fn reducible(state: &PaperState, instrument: &Instrument, side: OrderSide) -> Decimal {
    state
        .positions
        .get(instrument)
        .filter(|p| p.side.exit_order_side() == side)
        .map_or(Decimal::ZERO, |p| p.quantity)
}

fn is_triggered(order: &OpenOrder, price: Decimal) -> bool {
    match (order.order_type, order.side) {
        (OrderType::StopMarket, OrderSide::Sell) => order.trigger_price.is_some_and(|t| price <= t),
        (OrderType::StopMarket, OrderSide::Buy) => order.trigger_price.is_some_and(|t| price >= t),
        (OrderType::Limit, OrderSide::Sell) => order.price.is_some_and(|p| price >= p),
        (OrderType::Limit, OrderSide::Buy) => order.price.is_some_and(|p| price <= p),
        (OrderType::Market, _) => true,
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        let (order_id, events) = {
            let mut state = self.state.lock();
            let instrument = &request.instrument;
            let price = state
                .prices
                .get(instrument)
                .copied()
                .ok_or_else(|| GatewayError::Rejected(format!("no market price for {instrument}")))?;

            if request.quantity <= Decimal::ZERO {
                return Err(GatewayError::Rejected("quantity must be positive".to_string()));
            }
            if request.reduce_only {
                let open = reducible(&state, instrument, request.side);
                if open.is_zero() {
                    return Err(GatewayError::NoPosition(instrument.clone()));
                }
                if request.quantity > open {
                    return Err(GatewayError::Rejected(format!(
                        "reduce-only quantity {} exceeds position {open}",
                        request.quantity
                    )));
                }
            } else {
                let reference = request.reference_price().unwrap_or(price);
                if request.quantity * reference < self.min_notional {
                    return Err(GatewayError::Rejected(format!(
                        "notional {} below minimum {}",
                        request.quantity * reference,
                        self.min_notional
                    )));
                }
            }

            state.next_id += 1;
            let order_id = OrderId::new(format!("paper-{}", state.next_id));
            let resting = OpenOrder {
                order_id: order_id.clone(),
                instrument: instrument.clone(),
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                price: request.price,
                trigger_price: request.trigger_price,
                reduce_only: request.reduce_only,
            };

            let events = match request.order_type {
                OrderType::Market => {
                    let fill_price = self.apply_slippage(price, request.side);
                    self.apply_fill(
                        &mut state,
                        &order_id,
                        instrument,
                        request.side,
                        request.quantity,
                        fill_price,
                        request.reduce_only,
                    )
                }
                OrderType::StopMarket => {
                    if request.trigger_price.is_none() {
                        return Err(GatewayError::Rejected("stop order without trigger price".to_string()));
                    }
                    if is_triggered(&resting, price) {
                        return Err(GatewayError::Rejected(format!(
                            "stop trigger {:?} already crossed by {price}",
                            request.trigger_price
                        )));
                    }
                    state.resting.push(resting);
                    Vec::new()
                }
                OrderType::Limit => {
                    let Some(limit) = request.price else {
                        return Err(GatewayError::Rejected("limit order without price".to_string()));
                    };
                    if is_triggered(&resting, price) {
                        self.apply_fill(
                            &mut state,
                            &order_id,
                            instrument,
                            request.side,
                            request.quantity,
                            limit,
                            request.reduce_only,
                        )
                    } else {
                        state.resting.push(resting);
                        Vec::new()
                    }
                }
            };
            tracing::debug!(
                instrument = %instrument,
                order_id = %order_id,
                side = %request.side,
                order_type = ?request.order_type,
                quantity = %request.quantity,
                reduce_only = request.reduce_only,
                "Paper order accepted"
            );
            (order_id, events)
        };
        self.publish(events);
        Ok(order_id)
    }

    async fn cancel_order(&self, _instrument: &Instrument, order_id: &OrderId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let before = state.resting.len();
        state.resting.retain(|o| &o.order_id != order_id);
        if state.resting.len() == before {
            return Err(GatewayError::OrderNotFound(order_id.clone()));
        }
        Ok(())
    }

    async fn open_orders(&self, instrument: &Instrument) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(self
            .state
            .lock()
            .resting
            .iter()
            .filter(|o| &o.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn position(&self, instrument: &Instrument) -> Result<Option<ExchangePosition>, GatewayError> {
        let state = self.state.lock();
        let mark = state.prices.get(instrument).copied();
        Ok(state.positions.get(instrument).map(|p| ExchangePosition {
            instrument: instrument.clone(),
            side: p.side,
            quantity: p.quantity,
            entry_price: p.entry_price,
            mark_price: mark.unwrap_or(p.entry_price),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> (Arc<PaperExchange>, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let config = ExchangeConfig {
            paper_slippage_bps: dec!(5),
            paper_commission_rate: dec!(0.001),
            ..ExchangeConfig::default()
        };
        let (exchange, rx) = PaperExchange::new(&config);
        exchange.update_price(&btc(), dec!(100));
        (exchange, rx)
    }

    fn btc() -> Instrument {
        Instrument::new("BTC")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ExchangeEvent>) -> Vec<ExchangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn buy(exchange: &PaperExchange, quantity: Decimal) -> OrderId {
        exchange
            .submit_order(&OrderRequest::market(btc(), OrderSide::Buy, quantity, false))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn market_buy_fills_with_slippage_and_commission() {
        let (exchange, mut rx) = exchange();
        buy(&exchange, dec!(1)).await;

        let events = drain(&mut rx);
        let [ExchangeEvent::Filled(fill)] = events.as_slice() else {
            panic!("expected one fill, got {events:?}");
        };
        // 100 + 5 bps
        assert_eq!(fill.price, dec!(100.05));
        assert_eq!(fill.commission, dec!(0.10005));

        let position = exchange.position(&btc()).await.unwrap().unwrap();
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.quantity, dec!(1));
    }

    #[tokio::test]
    async fn oversized_reduce_only_is_rejected() {
        let (exchange, _rx) = exchange();
        buy(&exchange, dec!(1)).await;

        let result = exchange
            .submit_order(&OrderRequest::market(btc(), OrderSide::Sell, dec!(2), true))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn reduce_only_while_flat_is_rejected() {
        let (exchange, _rx) = exchange();
        let result = exchange
            .submit_order(&OrderRequest::market(btc(), OrderSide::Sell, dec!(1), true))
            .await;
        assert!(matches!(result, Err(GatewayError::NoPosition(_))));
    }

    #[tokio::test]
    async fn tiny_order_is_rejected() {
        let (exchange, _rx) = exchange();
        let result = exchange
            .submit_order(&OrderRequest::market(btc(), OrderSide::Buy, dec!(0.05), false))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn stop_triggers_and_closes_position() {
        let (exchange, mut rx) = exchange();
        buy(&exchange, dec!(1)).await;
        let stop = exchange
            .submit_order(&OrderRequest::stop_loss(btc(), Side::Long, dec!(1), dec!(99)))
            .await
            .unwrap();
        drain(&mut rx);

        exchange.update_price(&btc(), dec!(99.5));
        assert!(drain(&mut rx).is_empty());

        exchange.update_price(&btc(), dec!(98.9));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ExchangeEvent::Filled(f) if f.order_id == stop && f.reduce_only));
        let ExchangeEvent::PositionClosed { realized_pnl, .. } = &events[1] else {
            panic!("expected close, got {:?}", events[1]);
        };
        assert!(*realized_pnl < Decimal::ZERO);
        assert!(exchange.position(&btc()).await.unwrap().is_none());
        assert!(exchange.open_orders(&btc()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn take_profit_fills_at_limit() {
        let (exchange, mut rx) = exchange();
        buy(&exchange, dec!(1)).await;
        exchange
            .submit_order(&OrderRequest::take_profit(btc(), Side::Long, dec!(1), dec!(103)))
            .await
            .unwrap();
        drain(&mut rx);

        exchange.update_price(&btc(), dec!(103.2));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ExchangeEvent::Filled(f) if f.price == dec!(103)));
        // 103 - 100.05
        assert!(matches!(
            &events[1],
            ExchangeEvent::PositionClosed { realized_pnl, .. } if *realized_pnl == dec!(2.95)
        ));
    }

    #[tokio::test]
    async fn crossed_stop_is_rejected() {
        let (exchange, _rx) = exchange();
        buy(&exchange, dec!(1)).await;
        let result = exchange
            .submit_order(&OrderRequest::stop_loss(btc(), Side::Long, dec!(1), dec!(100.5)))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn reduce_only_leftover_cancelled_when_flat() {
        let (exchange, mut rx) = exchange();
        buy(&exchange, dec!(1)).await;
        exchange
            .submit_order(&OrderRequest::stop_loss(btc(), Side::Long, dec!(1), dec!(99)))
            .await
            .unwrap();
        exchange
            .submit_order(&OrderRequest::stop_loss(btc(), Side::Long, dec!(1), dec!(98)))
            .await
            .unwrap();
        drain(&mut rx);

        exchange.update_price(&btc(), dec!(97));
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ExchangeEvent::PositionClosed { .. })));
        assert!(events.iter().any(|e| matches!(e, ExchangeEvent::Canceled { .. })));
    }

    #[tokio::test]
    async fn cancel_unknown_order() {
        let (exchange, _rx) = exchange();
        let result = exchange.cancel_order(&btc(), &OrderId::new("nope")).await;
        assert!(matches!(result, Err(GatewayError::OrderNotFound(_))));
    }
}
