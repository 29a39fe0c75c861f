//! Position State Tracker.
//!
//! Single source of truth for "what protection currently exists". The tracker is
//! owned and mutated by the core task only; other threads read a consistent copy
//! through a [`TrackerSnapshot`] published after every mutation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Instrument, OrderId, ProtectiveKind, Side};

/// Protection state of one open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionProtectionRecord {
    pub instrument: Instrument,
    pub side: Side,
    /// Average fill price.
    pub entry_price: Decimal,
    /// Mirrors the live exchange quantity; always positive.
    pub quantity: Decimal,
    pub current_sl_price: Option<Decimal>,
    pub current_tp_price: Option<Decimal>,
    pub sl_order_ref: Option<OrderId>,
    pub tp_order_ref: Option<OrderId>,
    /// Best price since trailing activation (Long).
    pub high_water_price: Option<Decimal>,
    /// Best price since trailing activation (Short).
    pub low_water_price: Option<Decimal>,
    pub trailing_activated: bool,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PositionProtectionRecord {
    #[must_use]
    pub fn new(instrument: Instrument, side: Side, entry_price: Decimal, quantity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            instrument,
            side,
            entry_price,
            quantity,
            current_sl_price: None,
            current_tp_price: None,
            sl_order_ref: None,
            tp_order_ref: None,
            high_water_price: None,
            low_water_price: None,
            trailing_activated: false,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Folds an additional same-side fill into the average entry price.
    pub fn apply_add(&mut self, quantity: Decimal, price: Decimal) {
        let total_cost = self.entry_price * self.quantity + price * quantity;
        self.quantity += quantity;
        if !self.quantity.is_zero() {
            self.entry_price = total_cost / self.quantity;
        }
        self.updated_at = Utc::now();
    }

    /// Removes closed quantity. Returns the realized `PnL` of the reduced part.
    pub fn apply_reduce(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let closed = quantity.min(self.quantity);
        let pnl = match self.side {
            Side::Long => (price - self.entry_price) * closed,
            Side::Short => (self.entry_price - price) * closed,
        };
        self.quantity -= closed;
        self.updated_at = Utc::now();
        pnl
    }

    #[must_use]
    pub fn order_ref(&self, kind: ProtectiveKind) -> Option<&OrderId> {
        match kind {
            ProtectiveKind::StopLoss => self.sl_order_ref.as_ref(),
            ProtectiveKind::TakeProfit => self.tp_order_ref.as_ref(),
        }
    }

    #[must_use]
    pub const fn price(&self, kind: ProtectiveKind) -> Option<Decimal> {
        match kind {
            ProtectiveKind::StopLoss => self.current_sl_price,
            ProtectiveKind::TakeProfit => self.current_tp_price,
        }
    }

    /// Records a live protective order.
    pub fn set_protection(&mut self, kind: ProtectiveKind, order_id: OrderId, price: Decimal) {
        match kind {
            ProtectiveKind::StopLoss => {
                self.sl_order_ref = Some(order_id);
                self.current_sl_price = Some(price);
            }
            ProtectiveKind::TakeProfit => {
                self.tp_order_ref = Some(order_id);
                self.current_tp_price = Some(price);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Forgets the live order reference but keeps the last known price.
    pub fn clear_order_ref(&mut self, kind: ProtectiveKind) -> Option<OrderId> {
        self.updated_at = Utc::now();
        match kind {
            ProtectiveKind::StopLoss => self.sl_order_ref.take(),
            ProtectiveKind::TakeProfit => self.tp_order_ref.take(),
        }
    }

    /// Which protective role `order_id` plays for this position, if any.
    #[must_use]
    pub fn kind_of(&self, order_id: &OrderId) -> Option<ProtectiveKind> {
        if self.sl_order_ref.as_ref() == Some(order_id) {
            Some(ProtectiveKind::StopLoss)
        } else if self.tp_order_ref.as_ref() == Some(order_id) {
            Some(ProtectiveKind::TakeProfit)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    /// Unrealized `PnL` at `price`.
    #[must_use]
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        match self.side {
            Side::Long => (price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - price) * self.quantity,
        }
    }
}

/// Read-only view of the tracker shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct TrackerSnapshot {
    inner: Arc<RwLock<HashMap<Instrument, PositionProtectionRecord>>>,
}

impl TrackerSnapshot {
    #[must_use]
    pub fn get(&self, instrument: &Instrument) -> Option<PositionProtectionRecord> {
        self.inner.read().get(instrument).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<PositionProtectionRecord> {
        let mut records: Vec<_> = self.inner.read().values().cloned().collect();
        records.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        records
    }

    fn publish(&self, records: &HashMap<Instrument, PositionProtectionRecord>) {
        *self.inner.write() = records.clone();
    }
}

/// Owner of every [`PositionProtectionRecord`].
#[derive(Debug, Default)]
pub struct PositionTracker {
    records: HashMap<Instrument, PositionProtectionRecord>,
    snapshot: TrackerSnapshot,
}

impl PositionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, instrument: &Instrument) -> Option<&PositionProtectionRecord> {
        self.records.get(instrument)
    }

    /// Inserts or replaces the record for its instrument.
    pub fn upsert(&mut self, record: PositionProtectionRecord) {
        self.records.insert(record.instrument.clone(), record);
        self.snapshot.publish(&self.records);
    }

    /// Mutates an existing record in place. Returns `None` if there is no record.
    pub fn update<R>(
        &mut self,
        instrument: &Instrument,
        f: impl FnOnce(&mut PositionProtectionRecord) -> R,
    ) -> Option<R> {
        let result = self.records.get_mut(instrument).map(f);
        if result.is_some() {
            self.snapshot.publish(&self.records);
        }
        result
    }

    pub fn clear(&mut self, instrument: &Instrument) -> Option<PositionProtectionRecord> {
        let removed = self.records.remove(instrument);
        if removed.is_some() {
            self.snapshot.publish(&self.records);
        }
        removed
    }

    /// Finds the instrument whose SL or TP reference matches `order_id`.
    #[must_use]
    pub fn find_by_order(&self, order_id: &OrderId) -> Option<(&Instrument, ProtectiveKind)> {
        self.records
            .iter()
            .find_map(|(instrument, record)| record.kind_of(order_id).map(|kind| (instrument, kind)))
    }

    #[must_use]
    pub fn instruments(&self) -> Vec<Instrument> {
        self.records.keys().cloned().collect()
    }

    /// Handle for concurrent readers.
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.snapshot.clone()
    }
}
