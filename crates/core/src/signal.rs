//! Trading signal types.
//!
//! The signal producer is an external collaborator whose output is loosely typed.
//! [`RawSignal`] mirrors that payload; [`TradingSignal`] is the validated, tagged
//! form the protection engine acts on. Price levels carried by a signal are still
//! only proposals: they are re-validated against the entry before any order uses them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::SignalError;
use crate::types::{Instrument, Side};

/// Action requested by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Long,
    Short,
    Hold,
    Close,
    Reduce,
}

impl SignalAction {
    /// Position side the action points at, if directional.
    #[must_use]
    pub const fn side(self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Hold | Self::Close | Self::Reduce => None,
        }
    }
}

impl FromStr for SignalAction {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            "HOLD" | "WAIT" => Ok(Self::Hold),
            "CLOSE" | "EXIT" => Ok(Self::Close),
            "REDUCE" => Ok(Self::Reduce),
            other => Err(SignalError::UnknownAction(other.to_string())),
        }
    }
}

/// Producer's stated confidence. Ordered: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl FromStr for Confidence {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" | "MED" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(SignalError::UnknownConfidence(other.to_string())),
        }
    }
}

/// Untrusted signal payload as produced upstream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawSignal {
    pub instrument: String,
    pub signal: String,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub position_size_pct: Option<Decimal>,
}

/// Validated signal for one decision cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub instrument: Instrument,
    pub action: SignalAction,
    pub confidence: Confidence,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Fraction of equity in `(0, 1]`.
    pub position_size_pct: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl TradingSignal {
    /// Parses and validates a raw producer payload.
    ///
    /// # Errors
    /// Returns an error for unknown actions/confidence levels, non-positive prices,
    /// or a position size outside `(0, 1]`.
    pub fn try_from_raw(raw: &RawSignal) -> Result<Self, SignalError> {
        let action = raw.signal.parse::<SignalAction>()?;
        let confidence = raw
            .confidence
            .as_deref()
            .map(str::parse::<Confidence>)
            .transpose()?
            .unwrap_or_default();

        if raw.instrument.trim().is_empty() {
            return Err(SignalError::InvalidField {
                field: "instrument",
                value: raw.instrument.clone(),
            });
        }

        let stop_loss = positive_price("stop_loss", raw.stop_loss)?;
        let take_profit = positive_price("take_profit", raw.take_profit)?;

        if let Some(pct) = raw.position_size_pct {
            if pct <= Decimal::ZERO || pct > Decimal::ONE {
                return Err(SignalError::InvalidField {
                    field: "position_size_pct",
                    value: pct.to_string(),
                });
            }
        }

        Ok(Self {
            instrument: Instrument::new(raw.instrument.trim()),
            action,
            confidence,
            stop_loss,
            take_profit,
            position_size_pct: raw.position_size_pct,
            timestamp: Utc::now(),
        })
    }

    /// A no-op signal for the given instrument.
    #[must_use]
    pub fn hold(instrument: Instrument) -> Self {
        Self {
            instrument,
            action: SignalAction::Hold,
            confidence: Confidence::Low,
            stop_loss: None,
            take_profit: None,
            position_size_pct: None,
            timestamp: Utc::now(),
        }
    }

    /// Proposed (SL, TP) pair, if both were supplied.
    #[must_use]
    pub fn proposed_levels(&self) -> Option<(Decimal, Decimal)> {
        self.stop_loss.zip(self.take_profit)
    }
}

fn positive_price(field: &'static str, value: Option<Decimal>) -> Result<Option<Decimal>, SignalError> {
    match value {
        Some(v) if v <= Decimal::ZERO => Err(SignalError::InvalidField {
            field,
            value: v.to_string(),
        }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(signal: &str) -> RawSignal {
        RawSignal {
            instrument: "BTC".to_string(),
            signal: signal.to_string(),
            confidence: Some("high".to_string()),
            stop_loss: Some(dec!(99)),
            take_profit: Some(dec!(103)),
            position_size_pct: Some(dec!(0.2)),
        }
    }

    #[test]
    fn parses_valid_long_signal() {
        let signal = TradingSignal::try_from_raw(&raw("long")).unwrap();
        assert_eq!(signal.action, SignalAction::Long);
        assert_eq!(signal.confidence, Confidence::High);
        assert_eq!(signal.proposed_levels(), Some((dec!(99), dec!(103))));
    }

    #[test]
    fn rejects_unknown_action() {
        let err = TradingSignal::try_from_raw(&raw("moon")).unwrap_err();
        assert!(matches!(err, SignalError::UnknownAction(_)));
    }

    #[test]
    fn rejects_negative_stop() {
        let mut payload = raw("short");
        payload.stop_loss = Some(dec!(-1));
        let err = TradingSignal::try_from_raw(&payload).unwrap_err();
        assert!(matches!(err, SignalError::InvalidField { field: "stop_loss", .. }));
    }

    #[test]
    fn rejects_oversized_position_pct() {
        let mut payload = raw("long");
        payload.position_size_pct = Some(dec!(1.5));
        assert!(TradingSignal::try_from_raw(&payload).is_err());
    }

    #[test]
    fn missing_confidence_defaults_to_low() {
        let mut payload = raw("hold");
        payload.confidence = None;
        let signal = TradingSignal::try_from_raw(&payload).unwrap();
        assert_eq!(signal.confidence, Confidence::Low);
    }

    #[test]
    fn raw_signal_deserializes_from_json() {
        let json = r#"{"instrument":"ETH","signal":"SHORT","confidence":"MEDIUM","stop_loss":"2100","take_profit":"1900"}"#;
        let payload: RawSignal = serde_json::from_str(json).unwrap();
        let signal = TradingSignal::try_from_raw(&payload).unwrap();
        assert_eq!(signal.action, SignalAction::Short);
        assert_eq!(signal.stop_loss, Some(dec!(2100)));
        assert!(signal.position_size_pct.is_none());
    }

    #[test]
    fn confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }
}
