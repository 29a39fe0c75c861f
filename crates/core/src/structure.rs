//! Market structure inputs for fallback and recalculated protection levels.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::traits::MarketStructureProvider;
use crate::types::Instrument;

/// Nearest support/resistance around the current price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStructure {
    pub instrument: Instrument,
    pub price: Decimal,
    pub support: Option<Decimal>,
    pub resistance: Option<Decimal>,
}

impl MarketStructure {
    #[must_use]
    pub const fn new(
        instrument: Instrument,
        price: Decimal,
        support: Option<Decimal>,
        resistance: Option<Decimal>,
    ) -> Self {
        Self {
            instrument,
            price,
            support,
            resistance,
        }
    }

    /// Both levels, if known.
    #[must_use]
    pub fn levels(&self) -> Option<(Decimal, Decimal)> {
        self.support.zip(self.resistance)
    }
}

/// Support = lowest and resistance = highest price over a bounded window.
#[derive(Debug, Clone)]
pub struct RollingStructure {
    window: usize,
    prices: HashMap<Instrument, VecDeque<Decimal>>,
}

impl RollingStructure {
    /// Windows shorter than two prices are widened to two.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            prices: HashMap::new(),
        }
    }

    #[must_use]
    pub fn last_price(&self, instrument: &Instrument) -> Option<Decimal> {
        self.prices.get(instrument).and_then(|w| w.back().copied())
    }
}

impl Default for RollingStructure {
    fn default() -> Self {
        Self::new(50)
    }
}

impl MarketStructureProvider for RollingStructure {
    fn on_price(&mut self, instrument: &Instrument, price: Decimal) {
        let window = self.prices.entry(instrument.clone()).or_default();
        window.push_back(price);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    fn structure(&self, instrument: &Instrument) -> Option<MarketStructure> {
        let window = self.prices.get(instrument)?;
        let price = *window.back()?;
        let (support, resistance) = if window.len() < 2 {
            (None, None)
        } else {
            (window.iter().min().copied(), window.iter().max().copied())
        };
        Some(MarketStructure::new(instrument.clone(), price, support, resistance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn single_price_has_no_levels() {
        let mut rolling = RollingStructure::new(5);
        rolling.on_price(&"BTC".into(), dec!(100));
        let structure = rolling.structure(&"BTC".into()).unwrap();
        assert_eq!(structure.price, dec!(100));
        assert!(structure.levels().is_none());
    }

    #[test]
    fn window_tracks_low_and_high() {
        let mut rolling = RollingStructure::new(3);
        let btc: Instrument = "BTC".into();
        for price in [dec!(90), dec!(100), dec!(105), dec!(98)] {
            rolling.on_price(&btc, price);
        }
        // 90 has rolled out of the window
        let structure = rolling.structure(&btc).unwrap();
        assert_eq!(structure.levels(), Some((dec!(98), dec!(105))));
        assert_eq!(rolling.last_price(&btc), Some(dec!(98)));
    }

    #[test]
    fn unknown_instrument() {
        assert!(RollingStructure::default().structure(&"ETH".into()).is_none());
    }
}
