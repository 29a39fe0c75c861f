//! Operator commands: close, reduce by fraction, modify SL/TP.
//!
//! Every command goes through the same validated paths as signals.

use perp_guard_core::position_sizing::floor_to_step;
use perp_guard_core::{
    AlertSeverity, Instrument, MarketStructure, ProtectionError, ProtectiveKind, Side,
    ValidationFailure,
};
use rust_decimal::Decimal;

use crate::engine::{PendingReduce, ProtectionEngine, ReducePurpose, SignalOutcome};
use crate::validation::reward_risk;

impl ProtectionEngine {
    /// Flattens the position: cancel every open order, then a reduce-only close.
    ///
    /// # Errors
    /// A reversal is in flight, cancellation failed, or the close order was
    /// rejected (in which case an emergency stop is placed first).
    pub async fn close_position(&mut self, instrument: &Instrument) -> Result<SignalOutcome, ProtectionError> {
        if self.reversals.contains(instrument) {
            return Err(ProtectionError::ReversalInFlight(instrument.clone()));
        }
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return Ok(self.skip(instrument, "close ignored, no tracked position"));
        };

        if let Err(e) = self.submitter.cancel_all(instrument).await {
            self.alert(
                AlertSeverity::Warning,
                instrument,
                format!("close aborted, cancel-all failed: {e}"),
            );
            self.audit_protection(instrument).await;
            return Err(e.into());
        }
        self.tracker.update(instrument, |r| {
            r.clear_order_ref(ProtectiveKind::StopLoss);
            r.clear_order_ref(ProtectiveKind::TakeProfit);
        });

        match self
            .submitter
            .submit_reduce(instrument, record.side, record.quantity)
            .await
        {
            Ok(Some(placed)) => {
                tracing::info!(
                    instrument = %instrument,
                    order_id = %placed.order_id,
                    quantity = %placed.quantity,
                    "Closing position"
                );
                self.pending_reduces.insert(
                    placed.order_id,
                    PendingReduce {
                        instrument: instrument.clone(),
                        side: record.side,
                        quantity: placed.quantity,
                        filled_quantity: Decimal::ZERO,
                        purpose: ReducePurpose::Close,
                    },
                );
                Ok(SignalOutcome::Closing)
            }
            Ok(None) => {
                self.finalize_close(instrument, None).await;
                Ok(self.skip(instrument, "close ignored, position already flat"))
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("close order rejected: {e}"),
                );
                self.emergency_stop(instrument, "close failed after protection was cancelled")
                    .await;
                Err(e.into())
            }
        }
    }

    /// Reduces by `fraction` of the tracked size; `1` closes.
    ///
    /// # Errors
    /// See [`ProtectionEngine::reduce_position`] and [`ProtectionEngine::close_position`].
    pub async fn reduce_by_fraction(
        &mut self,
        instrument: &Instrument,
        fraction: Decimal,
        structure: Option<&MarketStructure>,
    ) -> Result<SignalOutcome, ProtectionError> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Ok(self.skip(instrument, format!("reduce fraction {fraction} outside (0, 1]")));
        }
        if fraction == Decimal::ONE {
            return self.close_position(instrument).await;
        }
        let Some(quantity) = self.tracker.get(instrument).map(|r| r.quantity) else {
            return Ok(self.skip(instrument, "reduce ignored, no tracked position"));
        };
        let reduce = floor_to_step(quantity * fraction, self.config.exchange.qty_step);
        if reduce <= Decimal::ZERO {
            return Ok(self.skip(instrument, "reduce below quantity step"));
        }
        self.reduce_position(instrument, reduce, structure).await
    }

    /// Moves the stop-loss. The operator may loosen it, but it must stay on the
    /// protective side of the current price.
    ///
    /// # Errors
    /// No position, no known price, a level on the wrong side, or a failed replace.
    pub async fn modify_stop_loss(&mut self, instrument: &Instrument, price: Decimal) -> Result<(), ProtectionError> {
        self.check_idle(instrument)?;
        let side = self
            .tracker
            .get(instrument)
            .map(|r| r.side)
            .ok_or_else(|| ProtectionError::NoPosition(instrument.clone()))?;
        let market = self
            .last_price(instrument)
            .ok_or_else(|| ProtectionError::NoMarketPrice(instrument.clone()))?;

        let protective_side = match side {
            Side::Long => price < market,
            Side::Short => price > market,
        };
        if !protective_side {
            return Err(ValidationFailure::WrongSide {
                level: "stop_loss",
                price,
                entry: market,
            }
            .into());
        }

        tracing::info!(instrument = %instrument, %price, "Operator stop-loss change");
        if self
            .replace_protective(instrument, ProtectiveKind::StopLoss, price)
            .await
        {
            Ok(())
        } else {
            Err(ProtectionError::invariant(instrument, "stop-loss replace did not complete"))
        }
    }

    /// Moves the take-profit. It must be on the profit side of the current price
    /// and keep reward:risk from entry at or above the minimum.
    ///
    /// # Errors
    /// No position, no known price, validation failure, or a failed replace.
    pub async fn modify_take_profit(&mut self, instrument: &Instrument, price: Decimal) -> Result<(), ProtectionError> {
        self.check_idle(instrument)?;
        let record = self
            .tracker
            .get(instrument)
            .cloned()
            .ok_or_else(|| ProtectionError::NoPosition(instrument.clone()))?;
        let market = self
            .last_price(instrument)
            .ok_or_else(|| ProtectionError::NoMarketPrice(instrument.clone()))?;

        let profit_side = match record.side {
            Side::Long => price > market,
            Side::Short => price < market,
        };
        if !profit_side {
            return Err(ValidationFailure::WrongSide {
                level: "take_profit",
                price,
                entry: market,
            }
            .into());
        }

        if let Some(stop) = record.current_sl_price {
            // A stop at or past entry locks in profit; any TP is acceptable then.
            match reward_risk(record.side, record.entry_price, stop, price) {
                Ok(ratio) if ratio < self.config.protection.min_reward_risk => {
                    return Err(ValidationFailure::RewardRiskTooLow {
                        ratio,
                        min: self.config.protection.min_reward_risk,
                    }
                    .into());
                }
                Ok(_) | Err(ValidationFailure::NonPositiveRisk { .. }) => {}
                Err(other) => return Err(other.into()),
            }
        }

        tracing::info!(instrument = %instrument, %price, "Operator take-profit change");
        if self
            .replace_protective(instrument, ProtectiveKind::TakeProfit, price)
            .await
        {
            Ok(())
        } else {
            Err(ProtectionError::invariant(instrument, "take-profit replace did not complete"))
        }
    }
}
