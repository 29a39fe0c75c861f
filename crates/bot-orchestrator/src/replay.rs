//! File-backed signal and price feeds for paper runs.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use perp_guard_core::{Instrument, MarketEvent, MarketStructure, RawSignal, SignalProducer, TradingSignal};
use rust_decimal::Decimal;

/// Replays recorded producer output, one signal per instrument per cycle.
///
/// Payloads are kept raw and validated when handed out, so a malformed entry
/// surfaces as a producer error in the cycle that would have used it.
#[derive(Debug, Default)]
pub struct ReplaySignalProducer {
    queues: HashMap<Instrument, VecDeque<RawSignal>>,
}

impl ReplaySignalProducer {
    #[must_use]
    pub fn from_raw(signals: impl IntoIterator<Item = RawSignal>) -> Self {
        let mut queues: HashMap<Instrument, VecDeque<RawSignal>> = HashMap::new();
        for raw in signals {
            queues
                .entry(Instrument::new(raw.instrument.trim()))
                .or_default()
                .push_back(raw);
        }
        Self { queues }
    }

    /// Loads a JSON-lines file of [`RawSignal`]s. Blank lines are ignored.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line is not valid JSON.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signal file {}", path.display()))?;

        let mut signals = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawSignal = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid signal", path.display(), index + 1))?;
            signals.push(raw);
        }
        tracing::info!(path = %path.display(), count = signals.len(), "Loaded replay signals");
        Ok(Self::from_raw(signals))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl SignalProducer for ReplaySignalProducer {
    async fn next_signal(
        &mut self,
        instrument: &Instrument,
        _structure: &MarketStructure,
    ) -> Result<Option<TradingSignal>> {
        let Some(raw) = self.queues.get_mut(instrument).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        let signal = TradingSignal::try_from_raw(&raw)
            .with_context(|| format!("Rejected replayed signal for {instrument}"))?;
        Ok(Some(signal))
    }

    fn name(&self) -> &str {
        "replay"
    }
}

/// Reads `instrument,price` rows into ticks, in file order.
///
/// # Errors
/// Returns an error if the file cannot be opened or a price does not parse.
pub fn load_price_csv(path: impl AsRef<Path>) -> Result<Vec<MarketEvent>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open price file {}", path.display()))?;

    let mut ticks = Vec::new();
    for result in reader.records() {
        let record = result?;
        let (Some(instrument), Some(price)) = (record.get(0), record.get(1)) else {
            anyhow::bail!("{}: expected instrument,price row, got {record:?}", path.display());
        };
        let price = Decimal::from_str(price.trim())
            .with_context(|| format!("{}: invalid price {price:?}", path.display()))?;
        if price <= Decimal::ZERO {
            anyhow::bail!("{}: non-positive price {price}", path.display());
        }
        ticks.push(MarketEvent::tick(Instrument::new(instrument.trim()), price));
    }
    Ok(ticks)
}
