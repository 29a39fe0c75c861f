//! Decision-cycle entry points: signal dispatch and per-cycle maintenance.

use perp_guard_core::{
    AlertSeverity, Instrument, MarketStructure, ProtectionError, ProtectiveKind, SignalAction,
    TradingSignal,
};
use rust_decimal::Decimal;

use crate::engine::{ProtectionEngine, SignalOutcome};
use crate::scaling::{plan_scale, ScalePlan};

/// Fraction of the position a `Reduce` signal removes when it carries no size.
pub const DEFAULT_REDUCE_FRACTION: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

impl ProtectionEngine {
    /// Acts on one validated signal.
    ///
    /// Signals for an instrument with a reversal or entry in flight are skipped.
    /// An opposite-direction signal goes to the reversal coordinator; a
    /// same-direction signal resizes the position.
    ///
    /// # Errors
    /// Gateway failures and invariant violations. Validation rejections are
    /// reported as [`SignalOutcome::Skipped`].
    pub async fn on_signal(
        &mut self,
        signal: &TradingSignal,
        structure: Option<&MarketStructure>,
    ) -> Result<SignalOutcome, ProtectionError> {
        let instrument = &signal.instrument;
        if self.reversals.contains(instrument) {
            return Ok(self.skip(instrument, "signal ignored, reversal in flight"));
        }
        if self.has_pending_entry(instrument) {
            return Ok(self.skip(instrument, "signal ignored, entry order in flight"));
        }

        let record = self.tracker.get(instrument).cloned();
        tracing::debug!(
            instrument = %instrument,
            action = ?signal.action,
            confidence = ?signal.confidence,
            position = ?record.as_ref().map(|r| (r.side, r.quantity)),
            "Signal received"
        );

        let side = match signal.action {
            SignalAction::Hold => return Ok(SignalOutcome::Held),
            SignalAction::Close | SignalAction::Reduce if record.is_none() => {
                return Ok(self.skip(instrument, "no position to close or reduce"));
            }
            SignalAction::Close => return self.close_position(instrument).await,
            SignalAction::Reduce => {
                let fraction = signal.position_size_pct.unwrap_or(DEFAULT_REDUCE_FRACTION);
                return self.reduce_by_fraction(instrument, fraction, structure).await;
            }
            SignalAction::Long | SignalAction::Short => match signal.action.side() {
                Some(side) => side,
                None => return Ok(SignalOutcome::Held),
            },
        };

        let Some(price) = self.reference_price(instrument, structure) else {
            return Ok(self.skip(instrument, "no market price yet"));
        };
        let target = self.sized_target(instrument, signal.position_size_pct, price)?;
        if target <= Decimal::ZERO {
            return Ok(self.skip(instrument, "target size rounds to zero"));
        }

        match record {
            None => {
                if signal.confidence < self.config.protection.min_open_confidence {
                    return Ok(self.skip(
                        instrument,
                        format!("{:?} confidence below open threshold", signal.confidence),
                    ));
                }
                match self
                    .open_position(instrument, side, target, signal.proposed_levels(), structure)
                    .await
                {
                    Ok(order_id) => Ok(SignalOutcome::Opened(order_id)),
                    Err(ProtectionError::Validation(reason)) => {
                        Ok(self.skip(instrument, format!("open aborted: {reason}")))
                    }
                    Err(e) => Err(e),
                }
            }
            Some(record) if record.side == side => {
                match plan_scale(record.quantity, target, self.config.protection.min_adjust_pct) {
                    ScalePlan::Hold => Ok(SignalOutcome::Held),
                    ScalePlan::Add(delta) => match self
                        .add_to_position(instrument, delta, signal.proposed_levels(), structure)
                        .await
                    {
                        Ok(order_id) => Ok(SignalOutcome::Added(order_id)),
                        Err(ProtectionError::Validation(reason)) => {
                            Ok(self.skip(instrument, format!("add rejected: {reason}")))
                        }
                        Err(e) => Err(e),
                    },
                    ScalePlan::Reduce(delta) => self.reduce_position(instrument, delta, structure).await,
                }
            }
            Some(_) => self.begin_reversal(signal, target, structure).await,
        }
    }

    /// Timer-driven upkeep for one instrument: audit live protection, then
    /// recalculate it from structure when structure is available.
    pub async fn run_maintenance(&mut self, instrument: &Instrument, structure: Option<&MarketStructure>) {
        self.audit_protection(instrument).await;
        if let Some(structure) = structure {
            self.recalculate_protection(instrument, structure).await;
        }
    }

    /// Checks the tracker against the exchange and repairs what drifted.
    pub async fn audit_protection(&mut self, instrument: &Instrument) {
        if self.reversals.contains(instrument) {
            return;
        }
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };

        let live = match self.submitter.live_position(instrument).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                tracing::info!(instrument = %instrument, "Audit found position closed");
                self.finalize_close(instrument, None).await;
                return;
            }
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Audit skipped, position query failed: {}", e);
                return;
            }
        };
        if live.side != record.side {
            self.alert(
                AlertSeverity::Critical,
                instrument,
                format!("tracked {} but exchange holds {}, reconciling", record.side, live.side),
            );
            self.reconcile_instrument(instrument).await;
            return;
        }

        let busy = self.has_pending_entry(instrument)
            || self
                .pending_reduces
                .values()
                .any(|r| &r.instrument == instrument);
        if busy {
            return;
        }

        if live.quantity != record.quantity {
            self.alert(
                AlertSeverity::Warning,
                instrument,
                format!(
                    "tracked quantity {} differs from live {}, resizing protection",
                    record.quantity, live.quantity
                ),
            );
            self.tracker
                .update(instrument, |r| r.quantity = live.quantity);
            self.refresh_protection(instrument, None, None).await;
            return;
        }

        let orders = match self.submitter.open_orders(instrument).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Audit skipped, open orders unavailable: {}", e);
                return;
            }
        };

        for kind in [ProtectiveKind::StopLoss, ProtectiveKind::TakeProfit] {
            let Some(order_id) = record.order_ref(kind) else {
                if kind == ProtectiveKind::StopLoss {
                    self.alert(
                        AlertSeverity::Warning,
                        instrument,
                        "no stop-loss on record, repairing",
                    );
                    self.repair_protection(instrument, kind).await;
                }
                continue;
            };
            match orders.iter().find(|o| &o.order_id == order_id) {
                Some(order) if order.quantity == record.quantity => {}
                Some(order) => {
                    if let Some(price) = record.price(kind) {
                        tracing::info!(
                            instrument = %instrument,
                            %kind,
                            order_quantity = %order.quantity,
                            position = %record.quantity,
                            "Protective order size drifted"
                        );
                        self.replace_protective(instrument, kind, price).await;
                    }
                }
                None => {
                    self.tracker.update(instrument, |r| r.clear_order_ref(kind));
                    self.alert(
                        AlertSeverity::Warning,
                        instrument,
                        format!("{kind} order {order_id} missing on exchange, repairing"),
                    );
                    self.repair_protection(instrument, kind).await;
                }
            }
        }
    }
}
