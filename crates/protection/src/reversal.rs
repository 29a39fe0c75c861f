//! Two-phase position reversal.
//!
//! Phase one cancels everything on the instrument, records a [`PendingReversal`]
//! and sends a reduce-only close. Phase two runs only when the exchange confirms
//! the position closed: the pending value is consumed and a fresh bracketed entry
//! goes out on the other side. While a reversal is pending no other open, add,
//! reduce or trailing logic touches the instrument.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use perp_guard_core::{
    AlertSeverity, Confidence, Instrument, MarketStructure, OrderId, ProtectionError,
    ProtectionEvent, ProtectiveKind, ReversalConfig, Side, TradingSignal,
};
use rust_decimal::Decimal;

use crate::engine::{PendingReduce, ProtectionEngine, ReducePurpose, SignalOutcome};

/// A reversal whose close has been sent but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReversal {
    pub instrument: Instrument,
    pub target_side: Side,
    pub target_quantity: Decimal,
    pub old_side: Side,
    pub submitted_at: DateTime<Utc>,
    pub close_order: Option<OrderId>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub structure: Option<MarketStructure>,
}

impl PendingReversal {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, timeout_secs: u64) -> bool {
        let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX);
        (now - self.submitted_at).num_seconds() >= timeout
    }

    fn proposed_levels(&self) -> Option<(Decimal, Decimal)> {
        self.stop_loss.zip(self.take_profit)
    }
}

/// At most one pending reversal per instrument.
#[derive(Debug, Default)]
pub struct ReversalBook {
    pending: HashMap<Instrument, PendingReversal>,
}

impl ReversalBook {
    /// # Errors
    /// [`ProtectionError::ReversalInFlight`] if one is already pending.
    pub fn begin(&mut self, reversal: PendingReversal) -> Result<(), ProtectionError> {
        if self.pending.contains_key(&reversal.instrument) {
            return Err(ProtectionError::ReversalInFlight(reversal.instrument));
        }
        self.pending.insert(reversal.instrument.clone(), reversal);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, instrument: &Instrument) -> Option<&PendingReversal> {
        self.pending.get(instrument)
    }

    #[must_use]
    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.pending.contains_key(instrument)
    }

    /// Consumes the pending reversal. A second call returns `None`.
    pub fn take(&mut self, instrument: &Instrument) -> Option<PendingReversal> {
        self.pending.remove(instrument)
    }

    pub fn set_close_order(&mut self, instrument: &Instrument, order_id: OrderId) {
        if let Some(reversal) = self.pending.get_mut(instrument) {
            reversal.close_order = Some(order_id);
        }
    }

    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>, timeout_secs: u64) -> Vec<Instrument> {
        self.pending
            .values()
            .filter(|r| r.is_expired(now, timeout_secs))
            .map(|r| r.instrument.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Checks whether an opposite-direction signal may reverse the position.
///
/// # Errors
/// The reason the reversal is refused.
pub fn reversal_policy(config: &ReversalConfig, confidence: Confidence) -> Result<(), String> {
    if !config.enabled {
        return Err("reversal disabled, holding position".to_string());
    }
    if confidence < config.min_confidence {
        return Err(format!(
            "reversal needs {:?} confidence, signal has {:?}; holding position",
            config.min_confidence, confidence
        ));
    }
    Ok(())
}

impl ProtectionEngine {
    /// Phase one: flatten the current position ahead of an opposite-side entry.
    ///
    /// # Errors
    /// Cancellation or close submission failed. The reversal is abandoned and
    /// the existing position re-protected first.
    pub async fn begin_reversal(
        &mut self,
        signal: &TradingSignal,
        target_quantity: Decimal,
        structure: Option<&MarketStructure>,
    ) -> Result<SignalOutcome, ProtectionError> {
        let instrument = &signal.instrument;
        self.check_idle(instrument)?;
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return Ok(self.skip(instrument, "reversal ignored, no tracked position"));
        };
        let Some(target_side) = signal.action.side().filter(|side| *side != record.side) else {
            return Ok(self.skip(instrument, "reversal ignored, signal not opposite"));
        };
        if let Err(reason) = reversal_policy(&self.config.reversal, signal.confidence) {
            return Ok(self.skip(instrument, reason));
        }

        // Nothing reduce-only may outlive the position it references.
        if let Err(e) = self.submitter.cancel_all(instrument).await {
            self.alert(
                AlertSeverity::Warning,
                instrument,
                format!("reversal aborted, cancel-all failed: {e}"),
            );
            // Some orders may already be gone; re-check against the exchange.
            self.audit_protection(instrument).await;
            return Err(e.into());
        }
        self.tracker.update(instrument, |r| {
            r.clear_order_ref(ProtectiveKind::StopLoss);
            r.clear_order_ref(ProtectiveKind::TakeProfit);
        });

        self.reversals.begin(PendingReversal {
            instrument: instrument.clone(),
            target_side,
            target_quantity,
            old_side: record.side,
            submitted_at: Utc::now(),
            close_order: None,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            structure: structure.cloned(),
        })?;
        tracing::info!(
            instrument = %instrument,
            from = %record.side,
            to = %target_side,
            quantity = %record.quantity,
            target_quantity = %target_quantity,
            "Reversal started"
        );
        self.emit(ProtectionEvent::ReversalStarted {
            instrument: instrument.clone(),
            from: record.side,
            to: target_side,
        });

        match self
            .submitter
            .submit_reduce(instrument, record.side, record.quantity)
            .await
        {
            Ok(Some(placed)) => {
                self.reversals
                    .set_close_order(instrument, placed.order_id.clone());
                self.pending_reduces.insert(
                    placed.order_id,
                    PendingReduce {
                        instrument: instrument.clone(),
                        side: record.side,
                        quantity: placed.quantity,
                        filled_quantity: Decimal::ZERO,
                        purpose: ReducePurpose::Reversal,
                    },
                );
                Ok(SignalOutcome::ReversalStarted)
            }
            Ok(None) => {
                // Gateway already reports flat; that is the confirmation.
                tracing::info!(instrument = %instrument, "Position already flat, completing reversal");
                self.finalize_close(instrument, None).await;
                if let Some(pending) = self.reversals.take(instrument) {
                    self.complete_reversal(pending).await;
                }
                Ok(SignalOutcome::ReversalStarted)
            }
            Err(e) => {
                self.reversals.take(instrument);
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("reversal close order failed, keeping {} position: {e}", record.side),
                );
                self.ensure_protected(instrument).await;
                Err(e.into())
            }
        }
    }

    /// Phase two, after the close is confirmed. Aborts if the exchange still
    /// shows a position.
    pub(crate) async fn complete_reversal(&mut self, pending: PendingReversal) {
        let instrument = &pending.instrument;
        match self.submitter.live_position(instrument).await {
            Ok(None) => {}
            Ok(Some(position)) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!(
                        "reversal aborted: {} {} still open after close confirmation",
                        position.side, position.quantity
                    ),
                );
                self.reconcile_instrument(instrument).await;
                return;
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("reversal aborted: cannot confirm flat position: {e}"),
                );
                return;
            }
        }

        match self
            .open_position(
                instrument,
                pending.target_side,
                pending.target_quantity,
                pending.proposed_levels(),
                pending.structure.as_ref(),
            )
            .await
        {
            Ok(order_id) => {
                tracing::info!(
                    instrument = %instrument,
                    side = %pending.target_side,
                    order_id = %order_id,
                    "Reversal entry submitted"
                );
                self.emit(ProtectionEvent::ReversalCompleted {
                    instrument: instrument.clone(),
                    side: pending.target_side,
                    quantity: pending.target_quantity,
                });
            }
            Err(e) => self.alert(
                AlertSeverity::Warning,
                instrument,
                format!("reversal closed {} but new entry not opened: {e}", pending.old_side),
            ),
        }
    }

    /// Drops reversals whose close was never confirmed. No new position is opened;
    /// whatever is still live gets protected again.
    pub async fn expire_reversals(&mut self, now: DateTime<Utc>) {
        let timeout = self.config.reversal.timeout_secs;
        for instrument in self.reversals.expired(now, timeout) {
            let Some(pending) = self.reversals.take(&instrument) else {
                continue;
            };
            self.alert(
                AlertSeverity::Critical,
                &instrument,
                format!(
                    "reversal to {} timed out after {timeout}s without close confirmation",
                    pending.target_side
                ),
            );
            self.resize_to_live(&instrument).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn pending(at: DateTime<Utc>) -> PendingReversal {
        PendingReversal {
            instrument: "BTC".into(),
            target_side: Side::Short,
            target_quantity: dec!(1),
            old_side: Side::Long,
            submitted_at: at,
            close_order: None,
            stop_loss: None,
            take_profit: None,
            structure: None,
        }
    }

    #[test]
    fn at_most_one_per_instrument() {
        let mut book = ReversalBook::default();
        let now = Utc::now();
        book.begin(pending(now)).unwrap();
        assert!(matches!(
            book.begin(pending(now)),
            Err(ProtectionError::ReversalInFlight(_))
        ));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn take_consumes_once() {
        let mut book = ReversalBook::default();
        let btc = Instrument::new("BTC");
        book.begin(pending(Utc::now())).unwrap();
        assert!(book.take(&btc).is_some());
        assert!(book.take(&btc).is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn expiry_uses_timeout() {
        let mut book = ReversalBook::default();
        let now = Utc::now();
        book.begin(pending(now - Duration::seconds(121))).unwrap();
        assert_eq!(book.expired(now, 120), vec![Instrument::new("BTC")]);
        assert!(book.expired(now, 300).is_empty());
    }

    #[test]
    fn policy_requires_enabled_and_confidence() {
        let config = ReversalConfig::default();
        assert!(reversal_policy(&config, Confidence::High).is_ok());
        assert!(reversal_policy(&config, Confidence::Medium).is_err());

        let disabled = ReversalConfig {
            enabled: false,
            ..ReversalConfig::default()
        };
        assert!(reversal_policy(&disabled, Confidence::High).is_err());
    }
}
