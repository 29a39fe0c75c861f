use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Instrument, OrderId, OrderSide, ProtectiveKind, Side};

/// Market data consumed by the protection engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Tick {
        instrument: Instrument,
        price: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl MarketEvent {
    #[must_use]
    pub fn tick(instrument: Instrument, price: Decimal) -> Self {
        Self::Tick {
            instrument,
            price,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        match self {
            Self::Tick { instrument, .. } => instrument,
        }
    }

    #[must_use]
    pub const fn price(&self) -> Decimal {
        match self {
            Self::Tick { price, .. } => *price,
        }
    }
}

/// Execution report for a single (possibly partial) fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub reduce_only: bool,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Discrete events delivered by the exchange gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeEvent {
    Filled(FillEvent),
    /// Position on `instrument` reached zero.
    PositionClosed {
        instrument: Instrument,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        realized_pnl: Decimal,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        order_id: OrderId,
        instrument: Instrument,
        reason: String,
    },
    Canceled {
        order_id: OrderId,
        instrument: Instrument,
    },
    Expired {
        order_id: OrderId,
        instrument: Instrument,
    },
}

impl ExchangeEvent {
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        match self {
            Self::Filled(fill) => &fill.instrument,
            Self::PositionClosed { instrument, .. }
            | Self::Rejected { instrument, .. }
            | Self::Canceled { instrument, .. }
            | Self::Expired { instrument, .. } => instrument,
        }
    }
}

/// Operator alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// Structured events emitted by the protection engine for external notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionEvent {
    PositionOpened {
        instrument: Instrument,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
    },
    PositionScaled {
        instrument: Instrument,
        side: Side,
        old_quantity: Decimal,
        new_quantity: Decimal,
    },
    PositionClosed {
        instrument: Instrument,
        side: Side,
        realized_pnl: Decimal,
    },
    ProtectionPlaced {
        instrument: Instrument,
        kind: ProtectiveKind,
        order_id: OrderId,
        price: Decimal,
        quantity: Decimal,
    },
    ProtectionReplaced {
        instrument: Instrument,
        kind: ProtectiveKind,
        old_price: Option<Decimal>,
        new_price: Decimal,
        quantity: Decimal,
    },
    EmergencyStopPlaced {
        instrument: Instrument,
        order_id: OrderId,
        price: Decimal,
        quantity: Decimal,
    },
    ReversalStarted {
        instrument: Instrument,
        from: Side,
        to: Side,
    },
    ReversalCompleted {
        instrument: Instrument,
        side: Side,
        quantity: Decimal,
    },
    /// An action was deliberately not taken; not an error.
    ActionSkipped {
        instrument: Instrument,
        reason: String,
    },
    Alert {
        severity: AlertSeverity,
        instrument: Instrument,
        message: String,
    },
}

impl ProtectionEvent {
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        match self {
            Self::PositionOpened { instrument, .. }
            | Self::PositionScaled { instrument, .. }
            | Self::PositionClosed { instrument, .. }
            | Self::ProtectionPlaced { instrument, .. }
            | Self::ProtectionReplaced { instrument, .. }
            | Self::EmergencyStopPlaced { instrument, .. }
            | Self::ReversalStarted { instrument, .. }
            | Self::ReversalCompleted { instrument, .. }
            | Self::ActionSkipped { instrument, .. }
            | Self::Alert { instrument, .. } => instrument,
        }
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Alert {
                severity: AlertSeverity::Critical,
                ..
            }
        )
    }
}
