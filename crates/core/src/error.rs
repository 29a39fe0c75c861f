//! Error types shared across the protection engine.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Instrument, OrderId};

/// Errors returned by an exchange gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Order rejected by exchange.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Order not found (already filled, cancelled or expired).
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// Reduce-only order against a flat instrument.
    #[error("no open position for {0}")]
    NoPosition(Instrument),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Request timeout.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Gateway not reachable.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// Reasons a proposed stop-loss / take-profit pair is not acceptable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    /// SL or TP on the wrong side of the entry price.
    #[error("{level} {price} on wrong side of entry {entry}")]
    WrongSide {
        level: &'static str,
        price: Decimal,
        entry: Decimal,
    },

    /// SL closer to entry than the configured minimum distance.
    #[error("stop distance {distance_pct} below minimum {min_pct}")]
    StopTooTight { distance_pct: Decimal, min_pct: Decimal },

    /// Reward:risk below the configured minimum.
    #[error("reward:risk {ratio} below minimum {min}")]
    RewardRiskTooLow { ratio: Decimal, min: Decimal },

    /// Risk of zero or less (entry at or beyond the stop).
    #[error("non-positive risk between entry {entry} and stop {stop}")]
    NonPositiveRisk { entry: Decimal, stop: Decimal },

    /// Signal did not carry both levels.
    #[error("stop-loss and take-profit are both required")]
    MissingLevels,

    /// No support/resistance available for the structure fallback.
    #[error("market structure unavailable for fallback levels")]
    MissingStructure,
}

/// Errors raised while parsing an external trading signal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("unknown signal action: {0}")]
    UnknownAction(String),

    #[error("unknown confidence level: {0}")]
    UnknownConfidence(String),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Errors raised by the protection state machine.
#[derive(Debug, Clone, Error)]
pub enum ProtectionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// An internal invariant no longer holds; the operation was aborted.
    #[error("invariant violated for {instrument}: {message}")]
    InvariantViolation { instrument: Instrument, message: String },

    #[error("no open position for {0}")]
    NoPosition(Instrument),

    #[error("reversal already in flight for {0}")]
    ReversalInFlight(Instrument),

    #[error("entry order already in flight for {0}")]
    EntryInFlight(Instrument),

    #[error("no market price known for {0}")]
    NoMarketPrice(Instrument),

    #[error("position sizing failed: {0}")]
    Sizing(String),
}

impl ProtectionError {
    pub fn invariant(instrument: &Instrument, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            instrument: instrument.clone(),
            message: message.into(),
        }
    }
}

/// Result type alias for protection operations.
pub type Result<T> = std::result::Result<T, ProtectionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn transient_gateway_errors() {
        assert!(GatewayError::Network("reset".into()).is_transient());
        assert!(GatewayError::Timeout("5s".into()).is_transient());
        assert!(!GatewayError::Rejected("min notional".into()).is_transient());
        assert!(!GatewayError::OrderNotFound("42".into()).is_transient());
    }

    #[test]
    fn validation_failure_display() {
        let err = ValidationFailure::RewardRiskTooLow {
            ratio: dec!(1.2),
            min: dec!(1.5),
        };
        assert!(err.to_string().contains("1.2"));
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn protection_error_wraps_gateway_error() {
        let err: ProtectionError = GatewayError::Rejected("too large".into()).into();
        assert!(err.to_string().contains("too large"));
    }
}
