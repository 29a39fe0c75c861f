//! Order submission layer.
//!
//! Builds entry, protective, reduce and emergency orders and applies the
//! exchange's size rules before anything is sent:
//! - non-reduce orders under `min_notional × notional_safety_margin` are rounded up
//! - reduce-only orders are clamped to the live position and skipped when flat

use std::sync::Arc;

use perp_guard_core::position_sizing::ceil_to_step;
use perp_guard_core::{
    ExchangeConfig, ExchangeGateway, ExchangePosition, GatewayError, Instrument, OpenOrder,
    OrderId, OrderRequest, ProtectiveKind, Side,
};
use rust_decimal::Decimal;

/// An order the gateway accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Stop price `emergency_pct` away from `reference_price` on the losing side.
#[must_use]
pub fn emergency_stop_price(side: Side, reference_price: Decimal, emergency_pct: Decimal) -> Decimal {
    match side {
        Side::Long => reference_price * (Decimal::ONE - emergency_pct),
        Side::Short => reference_price * (Decimal::ONE + emergency_pct),
    }
}

pub struct OrderSubmitter {
    gateway: Arc<dyn ExchangeGateway>,
    exchange: ExchangeConfig,
}

impl OrderSubmitter {
    #[must_use]
    pub fn new(gateway: Arc<dyn ExchangeGateway>, exchange: ExchangeConfig) -> Self {
        Self { gateway, exchange }
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn set_exchange_config(&mut self, exchange: ExchangeConfig) {
        self.exchange = exchange;
    }

    /// Smallest quantity at or above `quantity` whose notional clears the minimum.
    #[must_use]
    pub fn viable_quantity(&self, quantity: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return quantity;
        }
        let min_notional = self.exchange.min_notional * self.exchange.notional_safety_margin;
        if quantity * price >= min_notional {
            return quantity;
        }
        ceil_to_step(min_notional / price, self.exchange.qty_step)
    }

    pub async fn live_position(
        &self,
        instrument: &Instrument,
    ) -> Result<Option<ExchangePosition>, GatewayError> {
        self.gateway.position(instrument).await
    }

    /// Market entry for a new position or an add.
    ///
    /// # Errors
    /// Propagates the gateway's rejection; nothing is recorded on failure.
    pub async fn submit_entry(
        &self,
        instrument: &Instrument,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, GatewayError> {
        let quantity = self.viable_quantity(quantity, price);
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "entry quantity {quantity} for {instrument} is not positive"
            )));
        }

        let request = OrderRequest::market(instrument.clone(), side.entry_order_side(), quantity, false);
        let order_id = self.gateway.submit_order(&request).await?;
        tracing::info!(
            instrument = %instrument,
            order_id = %order_id,
            %side,
            %quantity,
            "Entry order submitted"
        );
        Ok(PlacedOrder {
            order_id,
            quantity,
            price,
        })
    }

    /// Reduce-only SL (stop-market) or TP (limit) for a `position_side` position.
    ///
    /// Returns `Ok(None)` when the position is already gone.
    ///
    /// # Errors
    /// Propagates gateway failures from the position check or the submission.
    pub async fn submit_protective(
        &self,
        kind: ProtectiveKind,
        instrument: &Instrument,
        position_side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Option<PlacedOrder>, GatewayError> {
        let Some((quantity, _)) = self.clamp_reduce(instrument, position_side, quantity).await? else {
            tracing::info!(instrument = %instrument, %kind, "No live position, protective order skipped");
            return Ok(None);
        };

        let request = OrderRequest::protective(kind, instrument.clone(), position_side, quantity, price);
        let order_id = self.gateway.submit_order(&request).await?;
        tracing::info!(
            instrument = %instrument,
            order_id = %order_id,
            %kind,
            %price,
            %quantity,
            "Protective order submitted"
        );
        Ok(Some(PlacedOrder {
            order_id,
            quantity,
            price,
        }))
    }

    /// Reduce-only market order. Returns `Ok(None)` when the position is already gone.
    ///
    /// # Errors
    /// Propagates gateway failures from the position check or the submission.
    pub async fn submit_reduce(
        &self,
        instrument: &Instrument,
        position_side: Side,
        quantity: Decimal,
    ) -> Result<Option<PlacedOrder>, GatewayError> {
        let Some((quantity, mark)) = self.clamp_reduce(instrument, position_side, quantity).await? else {
            tracing::info!(instrument = %instrument, "No live position, reduce order skipped");
            return Ok(None);
        };

        let request = OrderRequest::market(
            instrument.clone(),
            position_side.exit_order_side(),
            quantity,
            true,
        );
        let order_id = self.gateway.submit_order(&request).await?;
        tracing::info!(
            instrument = %instrument,
            order_id = %order_id,
            %quantity,
            "Reduce order submitted"
        );
        Ok(Some(PlacedOrder {
            order_id,
            quantity,
            price: mark,
        }))
    }

    /// Fixed-offset stop straight to the gateway, with no position re-check.
    ///
    /// # Errors
    /// Propagates the gateway's rejection.
    pub async fn submit_emergency_sl(
        &self,
        instrument: &Instrument,
        position_side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        emergency_pct: Decimal,
    ) -> Result<PlacedOrder, GatewayError> {
        let price = emergency_stop_price(position_side, reference_price, emergency_pct);
        let request = OrderRequest::stop_loss(instrument.clone(), position_side, quantity, price);
        let order_id = self.gateway.submit_order(&request).await?;
        tracing::warn!(
            instrument = %instrument,
            order_id = %order_id,
            %price,
            %quantity,
            "Emergency stop-loss submitted"
        );
        Ok(PlacedOrder {
            order_id,
            quantity,
            price,
        })
    }

    /// Live orders on `instrument`.
    ///
    /// # Errors
    /// Propagates the gateway failure.
    pub async fn open_orders(&self, instrument: &Instrument) -> Result<Vec<OpenOrder>, GatewayError> {
        self.gateway.open_orders(instrument).await
    }

    /// Cancels one order. `Ok(false)` means it was already gone.
    ///
    /// # Errors
    /// Any gateway failure other than [`GatewayError::OrderNotFound`].
    pub async fn cancel(&self, instrument: &Instrument, order_id: &OrderId) -> Result<bool, GatewayError> {
        match self.gateway.cancel_order(instrument, order_id).await {
            Ok(()) => {
                tracing::debug!(instrument = %instrument, order_id = %order_id, "Order cancelled");
                Ok(true)
            }
            Err(GatewayError::OrderNotFound(_)) => {
                tracing::debug!(instrument = %instrument, order_id = %order_id, "Order already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels every open reduce-only order on `instrument` except `keep`.
    ///
    /// # Errors
    /// Stops at the first cancellation the gateway refuses.
    pub async fn cancel_reduce_only(
        &self,
        instrument: &Instrument,
        keep: Option<&OrderId>,
    ) -> Result<Vec<OrderId>, GatewayError> {
        let orders = self.gateway.open_orders(instrument).await?;
        let mut cancelled = Vec::new();
        for order in orders
            .into_iter()
            .filter(|o| o.reduce_only && Some(&o.order_id) != keep)
        {
            if self.cancel(instrument, &order.order_id).await? {
                cancelled.push(order.order_id);
            }
        }
        Ok(cancelled)
    }

    /// Cancels every open order on `instrument`.
    ///
    /// # Errors
    /// Stops at the first cancellation the gateway refuses.
    pub async fn cancel_all(&self, instrument: &Instrument) -> Result<usize, GatewayError> {
        let orders = self.gateway.open_orders(instrument).await?;
        let mut cancelled = 0;
        for order in &orders {
            if self.cancel(instrument, &order.order_id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Live quantity available to a reduce-only order, with the mark price.
    async fn clamp_reduce(
        &self,
        instrument: &Instrument,
        position_side: Side,
        quantity: Decimal,
    ) -> Result<Option<(Decimal, Decimal)>, GatewayError> {
        let Some(position) = self.gateway.position(instrument).await? else {
            return Ok(None);
        };
        if position.side != position_side || position.quantity <= Decimal::ZERO {
            return Ok(None);
        }
        if quantity > position.quantity {
            tracing::debug!(
                instrument = %instrument,
                requested = %quantity,
                live = %position.quantity,
                "Clamping reduce-only quantity to live position"
            );
        }
        Ok(Some((quantity.min(position.quantity), position.mark_price)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct NullGateway;

    #[async_trait::async_trait]
    impl ExchangeGateway for NullGateway {
        async fn submit_order(&self, _request: &OrderRequest) -> Result<OrderId, GatewayError> {
            Err(GatewayError::Unavailable("null".into()))
        }
        async fn cancel_order(&self, _i: &Instrument, id: &OrderId) -> Result<(), GatewayError> {
            Err(GatewayError::OrderNotFound(id.clone()))
        }
        async fn open_orders(&self, _i: &Instrument) -> Result<Vec<perp_guard_core::OpenOrder>, GatewayError> {
            Ok(Vec::new())
        }
        async fn position(&self, _i: &Instrument) -> Result<Option<ExchangePosition>, GatewayError> {
            Ok(None)
        }
    }

    fn submitter() -> OrderSubmitter {
        OrderSubmitter::new(Arc::new(NullGateway), ExchangeConfig::default())
    }

    /// Holds a fixed live position and records what was submitted.
    struct LongGateway {
        quantity: Decimal,
        submitted: parking_lot::Mutex<Vec<OrderRequest>>,
    }

    #[async_trait::async_trait]
    impl ExchangeGateway for LongGateway {
        async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
            let mut submitted = self.submitted.lock();
            submitted.push(request.clone());
            Ok(OrderId::new(format!("ord-{}", submitted.len())))
        }
        async fn cancel_order(&self, _i: &Instrument, id: &OrderId) -> Result<(), GatewayError> {
            Err(GatewayError::OrderNotFound(id.clone()))
        }
        async fn open_orders(&self, _i: &Instrument) -> Result<Vec<perp_guard_core::OpenOrder>, GatewayError> {
            Ok(Vec::new())
        }
        async fn position(&self, instrument: &Instrument) -> Result<Option<ExchangePosition>, GatewayError> {
            Ok(Some(ExchangePosition {
                instrument: instrument.clone(),
                side: Side::Long,
                quantity: self.quantity,
                entry_price: dec!(100),
                mark_price: dec!(101),
            }))
        }
    }

    fn long_gateway(quantity: Decimal) -> Arc<LongGateway> {
        Arc::new(LongGateway {
            quantity,
            submitted: parking_lot::Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn small_orders_round_up_to_min_notional() {
        // min 10 × 1.1 = 11 quote; at 30000 that is 0.000366.. → 0.001
        assert_eq!(submitter().viable_quantity(dec!(0.0001), dec!(30000)), dec!(0.001));
        // at 100: 0.11 exactly
        assert_eq!(submitter().viable_quantity(dec!(0.05), dec!(100)), dec!(0.11));
        assert_eq!(submitter().viable_quantity(dec!(2), dec!(100)), dec!(2));
    }

    #[test]
    fn emergency_price_is_on_losing_side() {
        assert_eq!(emergency_stop_price(Side::Long, dec!(100), dec!(0.02)), dec!(98));
        assert_eq!(emergency_stop_price(Side::Short, dec!(100), dec!(0.02)), dec!(102));
    }

    #[tokio::test]
    async fn reduce_against_flat_position_is_skipped() {
        let result = submitter()
            .submit_reduce(&"BTC".into(), Side::Long, dec!(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn oversized_reduce_is_clamped_to_live_position() {
        let gateway = long_gateway(dec!(0.4));
        let submitter = OrderSubmitter::new(gateway.clone(), ExchangeConfig::default());

        let placed = submitter
            .submit_reduce(&"BTC".into(), Side::Long, dec!(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(placed.quantity, dec!(0.4));
        assert_eq!(placed.price, dec!(101));
        let submitted = gateway.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].quantity, dec!(0.4));
        assert!(submitted[0].reduce_only);
    }

    #[tokio::test]
    async fn oversized_protective_is_clamped_to_live_position() {
        let gateway = long_gateway(dec!(0.4));
        let submitter = OrderSubmitter::new(gateway.clone(), ExchangeConfig::default());

        let placed = submitter
            .submit_protective(ProtectiveKind::StopLoss, &"BTC".into(), Side::Long, dec!(2), dec!(98))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(placed.quantity, dec!(0.4));
        assert_eq!(gateway.submitted.lock()[0].quantity, dec!(0.4));
    }

    #[tokio::test]
    async fn reduce_against_opposite_side_is_skipped() {
        let gateway = long_gateway(dec!(0.4));
        let submitter = OrderSubmitter::new(gateway.clone(), ExchangeConfig::default());

        let result = submitter
            .submit_reduce(&"BTC".into(), Side::Short, dec!(0.1))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(gateway.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_missing_order_is_not_an_error() {
        assert!(!submitter().cancel(&"BTC".into(), &"x".into()).await.unwrap());
    }
}
