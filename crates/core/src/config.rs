use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::signal::Confidence;
use crate::types::Instrument;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub trailing: TrailingConfig,
    #[serde(default)]
    pub reversal: ReversalConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_id: String,
    pub instruments: Vec<String>,
    pub cycle_interval_secs: u64,
    pub account_equity: Decimal,
    pub leverage: u8,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_id: "perp-guard".to_string(),
            instruments: vec!["BTC".to_string()],
            cycle_interval_secs: 60,
            account_equity: Decimal::from(10_000),
            leverage: 1,
        }
    }
}

impl BotConfig {
    #[must_use]
    pub fn instruments(&self) -> Vec<Instrument> {
        self.instruments.iter().map(|s| Instrument::new(s.as_str())).collect()
    }
}

/// Bracket validation and protective-order policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Minimum reward:risk for any SL/TP pair (e.g. 1.5 = 1.5:1).
    pub min_reward_risk: Decimal,
    /// Minimum |entry - SL| / entry.
    pub min_stop_distance_pct: Decimal,
    /// Offset applied to support/resistance when deriving fallback levels.
    pub structure_buffer_pct: Decimal,
    /// Distance of the last-resort stop from the current price.
    pub emergency_sl_pct: Decimal,
    /// Relative change below which a recalculated level is not replaced.
    pub materiality_pct: Decimal,
    /// Relative size change below which a scale signal is ignored.
    pub min_adjust_pct: Decimal,
    pub min_open_confidence: Confidence,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            min_reward_risk: Decimal::new(15, 1),
            min_stop_distance_pct: Decimal::new(5, 3),
            structure_buffer_pct: Decimal::new(2, 3),
            emergency_sl_pct: Decimal::new(2, 2),
            materiality_pct: Decimal::new(1, 3),
            min_adjust_pct: Decimal::new(1, 1),
            min_open_confidence: Confidence::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enabled: bool,
    pub activation_pct: Decimal,
    pub trail_pct: Decimal,
    pub update_threshold_pct: Decimal,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_pct: Decimal::new(1, 2),
            trail_pct: Decimal::new(5, 3),
            update_threshold_pct: Decimal::new(1, 3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversalConfig {
    pub enabled: bool,
    pub min_confidence: Confidence,
    pub timeout_secs: u64,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: Confidence::High,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub default_position_pct: Decimal,
    pub max_position_pct: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            default_position_pct: Decimal::new(1, 1),
            max_position_pct: Decimal::new(5, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Minimum order notional in quote currency.
    pub min_notional: Decimal,
    /// Multiplier on `min_notional` used when rounding small orders up.
    pub notional_safety_margin: Decimal,
    pub qty_step: Decimal,
    pub paper_slippage_bps: Decimal,
    pub paper_commission_rate: Decimal,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            min_notional: Decimal::from(10),
            notional_safety_margin: Decimal::new(11, 1),
            qty_step: Decimal::new(1, 3),
            paper_slippage_bps: Decimal::from(5),
            paper_commission_rate: Decimal::new(25, 5),
        }
    }
}

impl AppConfig {
    /// Rejects values that would make the protection rules meaningless.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first inconsistent field.
    pub fn validate(&self) -> Result<()> {
        let one = Decimal::ONE;
        let zero = Decimal::ZERO;

        ensure!(!self.bot.instruments.is_empty(), "bot.instruments must not be empty");
        ensure!(self.bot.cycle_interval_secs > 0, "bot.cycle_interval_secs must be positive");
        ensure!(self.bot.account_equity > zero, "bot.account_equity must be positive");
        ensure!(
            (1..=50).contains(&self.bot.leverage),
            "bot.leverage must be between 1 and 50"
        );

        let p = &self.protection;
        ensure!(p.min_reward_risk > zero, "protection.min_reward_risk must be positive");
        ensure!(
            p.min_stop_distance_pct >= zero && p.min_stop_distance_pct < one,
            "protection.min_stop_distance_pct must be in [0, 1)"
        );
        ensure!(
            p.structure_buffer_pct >= zero && p.structure_buffer_pct < one,
            "protection.structure_buffer_pct must be in [0, 1)"
        );
        ensure!(
            p.emergency_sl_pct > zero && p.emergency_sl_pct < one,
            "protection.emergency_sl_pct must be in (0, 1)"
        );
        ensure!(p.materiality_pct >= zero, "protection.materiality_pct must not be negative");
        ensure!(p.min_adjust_pct >= zero, "protection.min_adjust_pct must not be negative");

        let t = &self.trailing;
        ensure!(
            t.trail_pct > zero && t.trail_pct < one,
            "trailing.trail_pct must be in (0, 1)"
        );
        ensure!(t.activation_pct >= zero, "trailing.activation_pct must not be negative");
        ensure!(
            t.update_threshold_pct >= zero,
            "trailing.update_threshold_pct must not be negative"
        );

        ensure!(self.reversal.timeout_secs > 0, "reversal.timeout_secs must be positive");

        let s = &self.sizing;
        ensure!(
            s.max_position_pct > zero && s.max_position_pct <= one,
            "sizing.max_position_pct must be in (0, 1]"
        );
        ensure!(
            s.default_position_pct > zero && s.default_position_pct <= s.max_position_pct,
            "sizing.default_position_pct must be in (0, max_position_pct]"
        );

        let e = &self.exchange;
        ensure!(e.min_notional >= zero, "exchange.min_notional must not be negative");
        ensure!(
            e.notional_safety_margin >= one,
            "exchange.notional_safety_margin must be at least 1"
        );
        ensure!(e.qty_step > zero, "exchange.qty_step must be positive");
        ensure!(e.paper_slippage_bps >= zero, "exchange.paper_slippage_bps must not be negative");

        Ok(())
    }
}
