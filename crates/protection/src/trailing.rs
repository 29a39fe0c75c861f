//! Trailing stop.
//!
//! Inactive until the position is `activation_pct` in profit. From then on the
//! stop follows the best price since entry at `trail_pct` distance, and only ever
//! moves in the protective direction. Moves smaller than `update_threshold_pct`
//! are ignored so that every tick does not churn the stop order.

use perp_guard_core::{Instrument, PositionProtectionRecord, ProtectiveKind, Side, TrailingConfig};
use rust_decimal::Decimal;

use crate::engine::ProtectionEngine;
use crate::validation::relative_change;

/// Outcome of evaluating one price against a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingUpdate {
    pub activated: bool,
    pub newly_activated: bool,
    /// Best price since entry (high for Long, low for Short).
    pub water: Decimal,
    /// Stop to move to, if the move is warranted.
    pub new_stop: Option<Decimal>,
}

#[must_use]
pub fn evaluate(record: &PositionProtectionRecord, price: Decimal, config: &TrailingConfig) -> TrailingUpdate {
    let side = record.side;
    let water = match side {
        Side::Long => record.high_water_price.unwrap_or(record.entry_price).max(price),
        Side::Short => record.low_water_price.unwrap_or(record.entry_price).min(price),
    };

    let newly_activated = !record.trailing_activated
        && side.favorable_move_pct(record.entry_price, price) >= config.activation_pct;
    let activated = record.trailing_activated || newly_activated;

    if !activated {
        return TrailingUpdate {
            activated,
            newly_activated,
            water,
            new_stop: None,
        };
    }

    let candidate = match side {
        Side::Long => water * (Decimal::ONE - config.trail_pct),
        Side::Short => water * (Decimal::ONE + config.trail_pct),
    };

    let new_stop = match record.current_sl_price {
        Some(current)
            if side.is_more_protective(candidate, current)
                && relative_change(current, candidate) >= config.update_threshold_pct =>
        {
            Some(candidate)
        }
        Some(_) => None,
        None => Some(candidate),
    };

    TrailingUpdate {
        activated,
        newly_activated,
        water,
        new_stop,
    }
}

impl ProtectionEngine {
    /// Records the latest price and ratchets the trailing stop.
    pub async fn on_price(&mut self, instrument: &Instrument, price: Decimal) {
        self.last_prices.insert(instrument.clone(), price);

        if !self.config.trailing.enabled || self.reversals.contains(instrument) {
            return;
        }
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };

        let update = evaluate(&record, price, &self.config.trailing);
        let recorded_water = match record.side {
            Side::Long => record.high_water_price,
            Side::Short => record.low_water_price,
        };
        if recorded_water != Some(update.water) || record.trailing_activated != update.activated {
            self.tracker.update(instrument, |r| {
                r.trailing_activated = update.activated;
                match r.side {
                    Side::Long => r.high_water_price = Some(update.water),
                    Side::Short => r.low_water_price = Some(update.water),
                }
            });
        }

        if update.newly_activated {
            tracing::info!(
                instrument = %instrument,
                %price,
                entry = %record.entry_price,
                "Trailing stop activated"
            );
        }

        // No live stop: the cycle audit repairs it, not the trailing engine.
        if record.sl_order_ref.is_none() {
            return;
        }
        if let Some(stop) = update.new_stop {
            tracing::info!(
                instrument = %instrument,
                old = ?record.current_sl_price,
                new = %stop,
                water = %update.water,
                "Trailing stop ratchet"
            );
            self.replace_protective(instrument, ProtectiveKind::StopLoss, stop)
                .await;
        }
    }
}
