//! Position sizing and scale validation.
//!
//! Same-direction signals resize an existing position. Adds must justify their
//! levels like a fresh entry; reduces pull protection first, shrink, then re-protect
//! the remainder no less tightly than before.

use perp_guard_core::position_sizing::calculate_position_size;
use perp_guard_core::{
    AlertSeverity, BotConfig, ExchangeConfig, Instrument, MarketStructure, OrderId,
    ProtectionError, ProtectionEvent, ProtectiveKind, Side, SizingConfig,
};
use rust_decimal::Decimal;

use crate::engine::{EntryKind, PendingReduce, ProtectionEngine, ReducePurpose, SignalOutcome};
use crate::validation::{resolve_levels, structure_levels, validate_levels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePlan {
    Hold,
    Add(Decimal),
    Reduce(Decimal),
}

/// Decides how to move from `current` to `target`. Changes smaller than
/// `min_adjust_pct` of the current size are ignored.
#[must_use]
pub fn plan_scale(current: Decimal, target: Decimal, min_adjust_pct: Decimal) -> ScalePlan {
    let delta = target - current;
    if delta.is_zero() {
        return ScalePlan::Hold;
    }
    if current > Decimal::ZERO && delta.abs() / current < min_adjust_pct {
        return ScalePlan::Hold;
    }
    if delta > Decimal::ZERO {
        ScalePlan::Add(delta)
    } else {
        ScalePlan::Reduce(-delta)
    }
}

/// Target position size for a signal's `position_size_pct` (or the default).
///
/// # Errors
/// Returns an error for a non-positive price or invalid leverage.
pub fn target_quantity(
    position_size_pct: Option<Decimal>,
    price: Decimal,
    bot: &BotConfig,
    sizing: &SizingConfig,
    exchange: &ExchangeConfig,
) -> anyhow::Result<Decimal> {
    calculate_position_size(
        bot.account_equity,
        bot.leverage,
        position_size_pct.unwrap_or(sizing.default_position_pct),
        sizing.max_position_pct,
        price,
        exchange.qty_step,
    )
}

/// Levels for the remainder after a reduce. The stop is the more protective of the
/// recalculated and prior stops; the TP follows the recalculation when there is one.
#[must_use]
pub fn levels_after_reduce(
    side: Side,
    prior_sl: Option<Decimal>,
    prior_tp: Option<Decimal>,
    recalculated: Option<(Decimal, Decimal)>,
) -> (Option<Decimal>, Option<Decimal>) {
    match (recalculated, prior_sl) {
        (Some((sl, tp)), Some(prior)) => (Some(side.most_protective(sl, prior)), Some(tp)),
        (Some((sl, tp)), None) => (Some(sl), Some(tp)),
        (None, prior) => (prior, prior_tp),
    }
}

impl ProtectionEngine {
    pub(crate) fn sized_target(
        &self,
        instrument: &Instrument,
        position_size_pct: Option<Decimal>,
        price: Decimal,
    ) -> Result<Decimal, ProtectionError> {
        target_quantity(
            position_size_pct,
            price,
            &self.config.bot,
            &self.config.sizing,
            &self.config.exchange,
        )
        .map_err(|e| ProtectionError::Sizing(format!("{instrument}: {e}")))
    }

    /// Adds `quantity` to an open position after re-validating levels at the
    /// current price. On rejection the position is left untouched.
    ///
    /// # Errors
    /// Validation failure, entry rejection, or no open position.
    pub async fn add_to_position(
        &mut self,
        instrument: &Instrument,
        quantity: Decimal,
        proposed: Option<(Decimal, Decimal)>,
        structure: Option<&MarketStructure>,
    ) -> Result<OrderId, ProtectionError> {
        self.check_idle(instrument)?;
        let side = self
            .tracker
            .get(instrument)
            .map(|r| r.side)
            .ok_or_else(|| ProtectionError::NoPosition(instrument.clone()))?;
        let price = self
            .reference_price(instrument, structure)
            .ok_or_else(|| ProtectionError::NoMarketPrice(instrument.clone()))?;

        let levels = resolve_levels(side, price, proposed, structure, &self.config.protection)
            .map_err(|reason| {
                tracing::warn!(instrument = %instrument, %reason, "Add rejected, position unchanged");
                reason
            })?;

        tracing::info!(
            instrument = %instrument,
            %side,
            %quantity,
            stop_loss = %levels.stop_loss,
            take_profit = %levels.take_profit,
            "Adding to position"
        );
        self.submit_entry_order(instrument, side, EntryKind::Add, quantity, levels, price)
            .await
    }

    /// Reduces an open position by `quantity` (clamped to the live size).
    ///
    /// Order of operations: cancel SL/TP, submit the reduce, place SL/TP for the
    /// remainder.
    ///
    /// # Errors
    /// Another operation in flight, or a gateway failure. Protection is restored
    /// before a gateway failure is returned.
    pub async fn reduce_position(
        &mut self,
        instrument: &Instrument,
        quantity: Decimal,
        structure: Option<&MarketStructure>,
    ) -> Result<SignalOutcome, ProtectionError> {
        self.check_idle(instrument)?;
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return Ok(self.skip(instrument, "reduce ignored, no tracked position"));
        };

        let live = match self.submitter.live_position(instrument).await? {
            Some(position) if position.side == record.side => position,
            _ => {
                self.finalize_close(instrument, None).await;
                return Ok(self.skip(instrument, "reduce ignored, position already closed"));
            }
        };

        let reduce_qty = quantity.min(live.quantity);
        if reduce_qty <= Decimal::ZERO {
            return Ok(self.skip(instrument, "reduce ignored, zero quantity"));
        }
        let remaining = live.quantity - reduce_qty;

        for kind in [ProtectiveKind::StopLoss, ProtectiveKind::TakeProfit] {
            let Some(order_id) = record.order_ref(kind) else {
                continue;
            };
            if let Err(e) = self.submitter.cancel(instrument, order_id).await {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("reduce aborted, could not cancel {kind} {order_id}: {e}"),
                );
                self.ensure_protected(instrument).await;
                return Err(e.into());
            }
            self.tracker.update(instrument, |r| r.clear_order_ref(kind));
        }

        let placed = match self
            .submitter
            .submit_reduce(instrument, record.side, reduce_qty)
            .await
        {
            Ok(Some(placed)) => placed,
            Ok(None) => {
                self.finalize_close(instrument, None).await;
                return Ok(self.skip(instrument, "reduce ignored, position closed before submission"));
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("reduce order rejected, restoring protection: {e}"),
                );
                self.tracker.update(instrument, |r| r.quantity = live.quantity);
                self.refresh_protection(instrument, None, None).await;
                return Err(e.into());
            }
        };

        let purpose = if remaining.is_zero() {
            ReducePurpose::Close
        } else {
            ReducePurpose::Reduce
        };
        self.pending_reduces.insert(
            placed.order_id.clone(),
            PendingReduce {
                instrument: instrument.clone(),
                side: record.side,
                quantity: placed.quantity,
                filled_quantity: Decimal::ZERO,
                purpose,
            },
        );
        if purpose == ReducePurpose::Close {
            return Ok(SignalOutcome::Closing);
        }

        self.tracker.update(instrument, |r| r.quantity = remaining);
        self.emit(ProtectionEvent::PositionScaled {
            instrument: instrument.clone(),
            side: record.side,
            old_quantity: live.quantity,
            new_quantity: remaining,
        });

        let recalculated = structure.and_then(|s| {
            let (sl, tp) = structure_levels(record.side, s, self.config.protection.structure_buffer_pct).ok()?;
            let levels = validate_levels(record.side, s.price, sl, tp, &self.config.protection).ok()?;
            Some((levels.stop_loss, levels.take_profit))
        });
        let (stop_loss, take_profit) = levels_after_reduce(
            record.side,
            record.current_sl_price,
            record.current_tp_price,
            recalculated,
        );

        match stop_loss {
            Some(sl) => {
                self.place_protective(instrument, ProtectiveKind::StopLoss, sl, remaining)
                    .await;
            }
            None => {
                self.emergency_stop(instrument, "no stop-loss level after reduce").await;
            }
        }
        if let Some(tp) = take_profit {
            self.place_protective(instrument, ProtectiveKind::TakeProfit, tp, remaining)
                .await;
        }

        Ok(SignalOutcome::Reduced {
            quantity: placed.quantity,
        })
    }
}
