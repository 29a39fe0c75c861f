use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::signal::TradingSignal;
use crate::structure::MarketStructure;
use crate::types::{ExchangePosition, Instrument, OpenOrder, OrderId, OrderRequest};

/// Narrow view of an exchange used by the protection engine.
///
/// Timeouts and retries are the implementation's concern; every call either
/// returns or fails with a [`GatewayError`]. Fills, closes, rejects, cancels and
/// expiries are delivered out of band as [`crate::events::ExchangeEvent`]s.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError>;

    /// Cancels a live order. Returns [`GatewayError::OrderNotFound`] if the order
    /// already filled, expired or was cancelled.
    async fn cancel_order(&self, instrument: &Instrument, order_id: &OrderId) -> Result<(), GatewayError>;

    async fn open_orders(&self, instrument: &Instrument) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Live position, or `None` when flat.
    async fn position(&self, instrument: &Instrument) -> Result<Option<ExchangePosition>, GatewayError>;
}

/// Source of one directional decision per instrument per cycle.
#[async_trait]
pub trait SignalProducer: Send + Sync {
    async fn next_signal(
        &mut self,
        instrument: &Instrument,
        structure: &MarketStructure,
    ) -> anyhow::Result<Option<TradingSignal>>;

    fn name(&self) -> &str;
}

/// Supplies nearest support/resistance for fallback and recalculation.
pub trait MarketStructureProvider: Send + Sync {
    /// Feeds the latest traded price. Providers backed by external data may ignore it.
    fn on_price(&mut self, _instrument: &Instrument, _price: Decimal) {}

    fn structure(&self, instrument: &Instrument) -> Option<MarketStructure>;
}
