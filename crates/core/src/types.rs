//! Strongly-typed identifiers and order primitives shared by every crate.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Exchange instrument identifier (e.g. `BTC-PERP`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// Sides
// =============================================================================

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Returns the opposite side.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Order side that opens or adds to a position on this side.
    #[must_use]
    pub const fn entry_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position on this side.
    #[must_use]
    pub const fn exit_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// Returns true if `candidate` is a tighter (more protective) stop than `current`.
    #[must_use]
    pub fn is_more_protective(self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// Picks the more protective of two stop prices.
    #[must_use]
    pub fn most_protective(self, a: Decimal, b: Decimal) -> Decimal {
        if self.is_more_protective(a, b) {
            a
        } else {
            b
        }
    }

    /// Signed favorable move from `entry` to `price` as a fraction of `entry`.
    #[must_use]
    pub fn favorable_move_pct(self, entry: Decimal, price: Decimal) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        match self {
            Self::Long => (price - entry) / entry,
            Self::Short => (entry - price) / entry,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Position side this order would open.
    #[must_use]
    pub const fn opening_side(self) -> Side {
        match self {
            Self::Buy => Side::Long,
            Self::Sell => Side::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    /// Market order released once `trigger_price` trades.
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    PostOnly,
}

/// Role of a protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

impl ProtectiveKind {
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::StopLoss => Self::TakeProfit,
            Self::TakeProfit => Self::StopLoss,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "SL",
            Self::TakeProfit => "TP",
        }
    }
}

impl std::fmt::Display for ProtectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order submission request sent to the exchange gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: Instrument,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Market order; `reduce_only` is set for closes and scale-downs.
    #[must_use]
    pub fn market(instrument: Instrument, side: OrderSide, quantity: Decimal, reduce_only: bool) -> Self {
        Self {
            instrument,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            trigger_price: None,
            reduce_only,
            time_in_force: TimeInForce::Ioc,
        }
    }

    /// Reduce-only stop-market order protecting a `position_side` position.
    #[must_use]
    pub fn stop_loss(
        instrument: Instrument,
        position_side: Side,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            instrument,
            side: position_side.exit_order_side(),
            order_type: OrderType::StopMarket,
            quantity,
            price: None,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            time_in_force: TimeInForce::Gtc,
        }
    }

    /// Reduce-only resting limit order taking profit on a `position_side` position.
    #[must_use]
    pub fn take_profit(
        instrument: Instrument,
        position_side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            instrument,
            side: position_side.exit_order_side(),
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            trigger_price: None,
            reduce_only: true,
            time_in_force: TimeInForce::Gtc,
        }
    }

    /// Protective order of the given kind.
    #[must_use]
    pub fn protective(
        kind: ProtectiveKind,
        instrument: Instrument,
        position_side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        match kind {
            ProtectiveKind::StopLoss => Self::stop_loss(instrument, position_side, quantity, price),
            ProtectiveKind::TakeProfit => {
                Self::take_profit(instrument, position_side, quantity, price)
            }
        }
    }

    /// Reference price used for notional checks.
    #[must_use]
    pub fn reference_price(&self) -> Option<Decimal> {
        self.price.or(self.trigger_price)
    }
}

/// Live order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
}

impl OpenOrder {
    /// Returns true if this is a reduce-only stop protecting a `position_side` position.
    #[must_use]
    pub fn is_stop_for(&self, position_side: Side) -> bool {
        self.reduce_only
            && self.order_type == OrderType::StopMarket
            && self.side == position_side.exit_order_side()
    }

    /// Returns true if this is a reduce-only take-profit limit for a `position_side` position.
    #[must_use]
    pub fn is_take_profit_for(&self, position_side: Side) -> bool {
        self.reduce_only
            && self.order_type == OrderType::Limit
            && self.side == position_side.exit_order_side()
    }
}

/// Live position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub instrument: Instrument,
    pub side: Side,
    /// Always positive; direction is carried by `side`.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}
