//! Bracket level validation.
//!
//! Every stop-loss / take-profit pair passes through [`validate_levels`] before it
//! reaches an order, whether it came from a signal or from market structure.

use perp_guard_core::{MarketStructure, ProtectionConfig, Side, ValidationFailure};
use rust_decimal::Decimal;

/// Where a validated pair of levels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Signal,
    Structure,
}

/// A stop-loss / take-profit pair that passed validation against an entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BracketLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub reward_risk: Decimal,
    pub source: LevelSource,
}

/// Reward:risk of a bracket around `entry`.
///
/// # Errors
/// [`ValidationFailure::NonPositiveRisk`] if the stop is at or beyond the entry.
pub fn reward_risk(
    side: Side,
    entry: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
) -> Result<Decimal, ValidationFailure> {
    let (risk, reward) = match side {
        Side::Long => (entry - stop_loss, take_profit - entry),
        Side::Short => (stop_loss - entry, entry - take_profit),
    };
    if risk <= Decimal::ZERO {
        return Err(ValidationFailure::NonPositiveRisk {
            entry,
            stop: stop_loss,
        });
    }
    Ok(reward / risk)
}

/// Checks side, minimum stop distance and minimum reward:risk.
///
/// # Errors
/// Returns the first rule the pair violates.
pub fn validate_levels(
    side: Side,
    entry: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
    config: &ProtectionConfig,
) -> Result<BracketLevels, ValidationFailure> {
    if entry <= Decimal::ZERO {
        return Err(ValidationFailure::NonPositiveRisk {
            entry,
            stop: stop_loss,
        });
    }

    let (sl_ok, tp_ok) = match side {
        Side::Long => (stop_loss < entry, take_profit > entry),
        Side::Short => (stop_loss > entry, take_profit < entry),
    };
    if !sl_ok {
        return Err(ValidationFailure::WrongSide {
            level: "stop_loss",
            price: stop_loss,
            entry,
        });
    }
    if !tp_ok {
        return Err(ValidationFailure::WrongSide {
            level: "take_profit",
            price: take_profit,
            entry,
        });
    }

    let distance_pct = (entry - stop_loss).abs() / entry;
    if distance_pct < config.min_stop_distance_pct {
        return Err(ValidationFailure::StopTooTight {
            distance_pct,
            min_pct: config.min_stop_distance_pct,
        });
    }

    let ratio = reward_risk(side, entry, stop_loss, take_profit)?;
    if ratio < config.min_reward_risk {
        return Err(ValidationFailure::RewardRiskTooLow {
            ratio,
            min: config.min_reward_risk,
        });
    }

    Ok(BracketLevels {
        stop_loss,
        take_profit,
        reward_risk: ratio,
        source: LevelSource::Signal,
    })
}

/// Levels derived from nearest support/resistance.
///
/// Long: SL just under support, TP just under resistance. Short mirrors.
///
/// # Errors
/// [`ValidationFailure::MissingStructure`] if either level is unknown.
pub fn structure_levels(
    side: Side,
    structure: &MarketStructure,
    buffer_pct: Decimal,
) -> Result<(Decimal, Decimal), ValidationFailure> {
    let (support, resistance) = structure
        .levels()
        .ok_or(ValidationFailure::MissingStructure)?;
    let below = Decimal::ONE - buffer_pct;
    let above = Decimal::ONE + buffer_pct;
    Ok(match side {
        Side::Long => (support * below, resistance * below),
        Side::Short => (resistance * above, support * above),
    })
}

/// Validates the proposed pair, falling back to structure-derived levels.
///
/// # Errors
/// Returns the fallback's failure when both candidates are rejected, or the
/// original failure when no structure is available.
pub fn resolve_levels(
    side: Side,
    entry: Decimal,
    proposed: Option<(Decimal, Decimal)>,
    structure: Option<&MarketStructure>,
    config: &ProtectionConfig,
) -> Result<BracketLevels, ValidationFailure> {
    let primary = match proposed {
        Some((sl, tp)) => validate_levels(side, entry, sl, tp, config),
        None => Err(ValidationFailure::MissingLevels),
    };

    let reason = match primary {
        Ok(levels) => return Ok(levels),
        Err(reason) => reason,
    };

    let Some(structure) = structure else {
        return Err(reason);
    };
    tracing::debug!(
        %side,
        %entry,
        %reason,
        "Proposed levels rejected, trying structure fallback"
    );

    let (sl, tp) = structure_levels(side, structure, config.structure_buffer_pct)?;
    let mut levels = validate_levels(side, entry, sl, tp, config)?;
    levels.source = LevelSource::Structure;
    Ok(levels)
}

/// Take-profit to use once the real fill price is known.
///
/// Returns `(take_profit, adjusted)`. When slippage pushed reward:risk under
/// `min_reward_risk`, the TP is moved out just far enough to restore it; the stop
/// is never touched.
///
/// # Errors
/// [`ValidationFailure::NonPositiveRisk`] if the fill landed at or through the stop.
pub fn take_profit_for_fill(
    side: Side,
    fill_price: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
    min_reward_risk: Decimal,
) -> Result<(Decimal, bool), ValidationFailure> {
    let ratio = reward_risk(side, fill_price, stop_loss, take_profit)?;
    if ratio >= min_reward_risk {
        return Ok((take_profit, false));
    }

    let risk = (fill_price - stop_loss).abs();
    let restored = match side {
        Side::Long => fill_price + min_reward_risk * risk,
        Side::Short => fill_price - min_reward_risk * risk,
    };
    if restored <= Decimal::ZERO {
        return Err(ValidationFailure::RewardRiskTooLow {
            ratio,
            min: min_reward_risk,
        });
    }
    Ok((restored, true))
}

/// `|to - from| / from`; any move away from zero counts as material.
#[must_use]
pub fn relative_change(from: Decimal, to: Decimal) -> Decimal {
    if from.is_zero() {
        return if to.is_zero() { Decimal::ZERO } else { Decimal::MAX };
    }
    ((to - from) / from).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> ProtectionConfig {
        ProtectionConfig::default()
    }

    fn structure(support: Decimal, resistance: Decimal) -> MarketStructure {
        MarketStructure::new("BTC".into(), dec!(100), Some(support), Some(resistance))
    }

    #[test]
    fn accepts_three_to_one_long() {
        let levels = validate_levels(Side::Long, dec!(100), dec!(99), dec!(103), &config()).unwrap();
        assert_eq!(levels.reward_risk, dec!(3));
        assert_eq!(levels.source, LevelSource::Signal);
    }

    #[test]
    fn rejects_stop_on_wrong_side() {
        let err = validate_levels(Side::Long, dec!(100), dec!(101), dec!(103), &config()).unwrap_err();
        assert!(matches!(err, ValidationFailure::WrongSide { level: "stop_loss", .. }));

        let err = validate_levels(Side::Short, dec!(100), dec!(101), dec!(102), &config()).unwrap_err();
        assert!(matches!(err, ValidationFailure::WrongSide { level: "take_profit", .. }));
    }

    #[test]
    fn rejects_tight_stop() {
        let err = validate_levels(Side::Long, dec!(100), dec!(99.8), dec!(100.5), &config()).unwrap_err();
        assert!(matches!(err, ValidationFailure::StopTooTight { .. }));
    }

    #[test]
    fn rejects_low_reward_risk() {
        let err = validate_levels(Side::Short, dec!(100), dec!(102), dec!(98.5), &config()).unwrap_err();
        assert_eq!(
            err,
            ValidationFailure::RewardRiskTooLow {
                ratio: dec!(0.75),
                min: dec!(1.5)
            }
        );
    }

    #[test]
    fn structure_fallback_rescues_bad_proposal() {
        let levels = resolve_levels(
            Side::Long,
            dec!(100),
            Some((dec!(99.8), dec!(100.5))),
            Some(&structure(dec!(97), dec!(106))),
            &config(),
        )
        .unwrap();
        assert_eq!(levels.source, LevelSource::Structure);
        assert_eq!(levels.stop_loss, dec!(96.806));
        assert_eq!(levels.take_profit, dec!(105.788));
    }

    #[test]
    fn fallback_failure_is_reported() {
        let err = resolve_levels(
            Side::Long,
            dec!(100),
            Some((dec!(99.8), dec!(100.5))),
            Some(&structure(dec!(95), dec!(101))),
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationFailure::RewardRiskTooLow { .. }));
    }

    #[test]
    fn missing_structure_keeps_original_reason() {
        let err = resolve_levels(Side::Long, dec!(100), None, None, &config()).unwrap_err();
        assert_eq!(err, ValidationFailure::MissingLevels);
    }

    #[test]
    fn short_structure_levels_mirror_long() {
        let (sl, tp) = structure_levels(Side::Short, &structure(dec!(95), dec!(105)), dec!(0.01)).unwrap();
        assert_eq!(sl, dec!(106.05));
        assert_eq!(tp, dec!(95.95));
    }

    #[test]
    fn slippage_moves_take_profit_out() {
        // Planned at 100 (SL 99, TP 101.5). Filled at 100.4: reward 1.1 / risk 1.4.
        let (tp, adjusted) =
            take_profit_for_fill(Side::Long, dec!(100.4), dec!(99), dec!(101.5), dec!(1.5)).unwrap();
        assert!(adjusted);
        assert_eq!(tp, dec!(102.5));

        let (tp, adjusted) =
            take_profit_for_fill(Side::Long, dec!(100), dec!(99), dec!(103), dec!(1.5)).unwrap();
        assert!(!adjusted);
        assert_eq!(tp, dec!(103));
    }

    #[test]
    fn fill_through_stop_has_no_risk() {
        let err = take_profit_for_fill(Side::Short, dec!(103), dec!(102), dec!(97), dec!(1.5)).unwrap_err();
        assert!(matches!(err, ValidationFailure::NonPositiveRisk { .. }));
    }

    #[test]
    fn relative_change_handles_zero() {
        assert_eq!(relative_change(dec!(100), dec!(101)), dec!(0.01));
        assert_eq!(relative_change(dec!(0), dec!(0)), dec!(0));
        assert_eq!(relative_change(dec!(0), dec!(1)), Decimal::MAX);
    }
}
