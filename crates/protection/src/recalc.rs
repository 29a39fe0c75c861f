//! Per-cycle recalculation of protection from market structure.

use perp_guard_core::{
    Instrument, MarketStructure, PositionProtectionRecord, ProtectionConfig, ProtectiveKind,
};
use rust_decimal::Decimal;

use crate::engine::ProtectionEngine;
use crate::validation::{relative_change, reward_risk, structure_levels, validate_levels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecalcDecision {
    Unchanged,
    Replace {
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
}

fn is_material(previous: Option<Decimal>, next: Decimal, materiality_pct: Decimal) -> bool {
    match previous {
        Some(prev) => prev != next && relative_change(prev, next) >= materiality_pct,
        None => true,
    }
}

/// Recomputes SL/TP from structure around the current price.
///
/// The stop only tightens: the result is the more protective of the recalculated
/// and the live stop (which already includes any trailing move). The TP may move
/// either way while reward:risk from the current price stays above the minimum.
#[must_use]
pub fn recalculate(
    record: &PositionProtectionRecord,
    structure: &MarketStructure,
    config: &ProtectionConfig,
) -> RecalcDecision {
    let side = record.side;
    let price = structure.price;

    let Ok((sl, tp)) = structure_levels(side, structure, config.structure_buffer_pct) else {
        return RecalcDecision::Unchanged;
    };
    let levels = match validate_levels(side, price, sl, tp, config) {
        Ok(levels) => levels,
        Err(reason) => {
            tracing::debug!(instrument = %record.instrument, %reason, "Recalculated levels rejected");
            return RecalcDecision::Unchanged;
        }
    };

    let stop_loss = match record.current_sl_price {
        Some(prev) => side.most_protective(levels.stop_loss, prev),
        None => levels.stop_loss,
    };
    let sl_changed = is_material(record.current_sl_price, stop_loss, config.materiality_pct);

    let tp_valid = reward_risk(side, price, stop_loss, levels.take_profit)
        .is_ok_and(|ratio| ratio >= config.min_reward_risk);
    let tp_changed = tp_valid
        && is_material(record.current_tp_price, levels.take_profit, config.materiality_pct);

    if !sl_changed && !tp_changed {
        return RecalcDecision::Unchanged;
    }
    RecalcDecision::Replace {
        stop_loss: sl_changed.then_some(stop_loss),
        take_profit: tp_changed.then_some(levels.take_profit),
    }
}

impl ProtectionEngine {
    /// Applies [`recalculate`] to the live position, if any.
    pub async fn recalculate_protection(
        &mut self,
        instrument: &Instrument,
        structure: &MarketStructure,
    ) -> RecalcDecision {
        if self.check_idle(instrument).is_err() {
            return RecalcDecision::Unchanged;
        }
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return RecalcDecision::Unchanged;
        };

        let decision = recalculate(&record, structure, &self.config.protection);
        if let RecalcDecision::Replace {
            stop_loss,
            take_profit,
        } = decision
        {
            tracing::info!(
                instrument = %instrument,
                sl = ?stop_loss,
                tp = ?take_profit,
                "Recalculated protection"
            );
            if let Some(sl) = stop_loss {
                self.replace_protective(instrument, ProtectiveKind::StopLoss, sl)
                    .await;
            }
            if let Some(tp) = take_profit {
                self.replace_protective(instrument, ProtectiveKind::TakeProfit, tp)
                    .await;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perp_guard_core::Side;
    use rust_decimal_macros::dec;

    fn record(sl: Decimal, tp: Decimal) -> PositionProtectionRecord {
        let mut record = PositionProtectionRecord::new("BTC".into(), Side::Long, dec!(100), dec!(1));
        record.set_protection(ProtectiveKind::StopLoss, "sl".into(), sl);
        record.set_protection(ProtectiveKind::TakeProfit, "tp".into(), tp);
        record
    }

    fn structure(price: Decimal, support: Decimal, resistance: Decimal) -> MarketStructure {
        MarketStructure::new("BTC".into(), price, Some(support), Some(resistance))
    }

    #[test]
    fn tighter_structure_raises_stop() {
        // SL 98.8 × 0.998 = 98.6024 over prior 97
        let decision = recalculate(
            &record(dec!(97), dec!(106)),
            &structure(dec!(101), dec!(98.8), dec!(110)),
            &ProtectionConfig::default(),
        );
        assert_eq!(
            decision,
            RecalcDecision::Replace {
                stop_loss: Some(dec!(98.6024)),
                take_profit: Some(dec!(109.78)),
            }
        );
    }

    #[test]
    fn looser_structure_keeps_stop() {
        // Structure SL 94.81 is looser than the live 99; only the TP moves.
        let decision = recalculate(
            &record(dec!(99), dec!(109.78)),
            &structure(dec!(101), dec!(95), dec!(115)),
            &ProtectionConfig::default(),
        );
        assert_eq!(
            decision,
            RecalcDecision::Replace {
                stop_loss: None,
                take_profit: Some(dec!(114.77)),
            }
        );
    }

    #[test]
    fn unchanged_structure_is_idempotent() {
        let config = ProtectionConfig::default();
        let structure = structure(dec!(101), dec!(98.8), dec!(110));
        let mut rec = record(dec!(97), dec!(106));

        if let RecalcDecision::Replace {
            stop_loss,
            take_profit,
        } = recalculate(&rec, &structure, &config)
        {
            rec.current_sl_price = stop_loss.or(rec.current_sl_price);
            rec.current_tp_price = take_profit.or(rec.current_tp_price);
        }
        assert_eq!(recalculate(&rec, &structure, &config), RecalcDecision::Unchanged);
    }

    #[test]
    fn immaterial_change_is_skipped() {
        // Recalculated SL 98.6024 vs live 98.6 is a 0.002% move.
        let decision = recalculate(
            &record(dec!(98.6), dec!(109.78)),
            &structure(dec!(101), dec!(98.8), dec!(110)),
            &ProtectionConfig::default(),
        );
        assert_eq!(decision, RecalcDecision::Unchanged);
    }
}
