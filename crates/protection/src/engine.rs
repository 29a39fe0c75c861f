//! Protection engine.
//!
//! [`ProtectionEngine`] owns the [`PositionTracker`] and is the only thing that
//! mutates protective-order state. It is driven one call at a time by a single
//! task; readers on other threads use [`ProtectionEngine::snapshot`].
//!
//! The component modules (`validation`, `oco`, `trailing`, `scaling`, `recalc`,
//! `reversal`) hold the decision logic. This module holds the shared side-effecting
//! steps they compose: placing, replacing and repairing protection, the emergency
//! stop, and closing out a record.

use std::collections::HashMap;
use std::sync::Arc;

use perp_guard_core::{
    AlertSeverity, AppConfig, ExchangeGateway, GatewayError, Instrument, MarketStructure, OrderId,
    PositionProtectionRecord, PositionTracker, ProtectionError, ProtectionEvent, ProtectiveKind,
    Side, TrackerSnapshot,
};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::reversal::{PendingReversal, ReversalBook};
use crate::submission::{OrderSubmitter, PlacedOrder};
use crate::validation::resolve_levels;
use crate::validation::BracketLevels;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What an entry order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Open,
    Add,
}

/// Entry order submitted but not yet completely filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub instrument: Instrument,
    pub side: Side,
    pub kind: EntryKind,
    pub ordered_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

/// Why a reduce-only market order was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducePurpose {
    /// Partial scale-down. The record is resized when the order is sent.
    Reduce,
    Close,
    Reversal,
}

/// Reduce-only market order the engine is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReduce {
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub purpose: ReducePurpose,
}

/// Result of acting on a signal or command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Held,
    Opened(OrderId),
    Added(OrderId),
    Reduced { quantity: Decimal },
    Closing,
    ReversalStarted,
    /// Deliberately not acted on; not an error.
    Skipped(String),
}

pub struct ProtectionEngine {
    pub(crate) submitter: OrderSubmitter,
    pub(crate) tracker: PositionTracker,
    pub(crate) config: AppConfig,
    pub(crate) pending_entries: HashMap<OrderId, PendingEntry>,
    pub(crate) pending_reduces: HashMap<OrderId, PendingReduce>,
    pub(crate) reversals: ReversalBook,
    pub(crate) last_prices: HashMap<Instrument, Decimal>,
    event_tx: broadcast::Sender<ProtectionEvent>,
}

impl ProtectionEngine {
    #[must_use]
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: AppConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            submitter: OrderSubmitter::new(gateway, config.exchange.clone()),
            tracker: PositionTracker::new(),
            config,
            pending_entries: HashMap::new(),
            pending_reduces: HashMap::new(),
            reversals: ReversalBook::default(),
            last_prices: HashMap::new(),
            event_tx,
        }
    }

    // =========================================================================
    // Read access
    // =========================================================================

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProtectionEvent> {
        self.event_tx.subscribe()
    }

    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<ProtectionEvent> {
        self.event_tx.clone()
    }

    /// Consistent read-only view for other threads.
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.tracker.snapshot()
    }

    #[must_use]
    pub fn record(&self, instrument: &Instrument) -> Option<&PositionProtectionRecord> {
        self.tracker.get(instrument)
    }

    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn last_price(&self, instrument: &Instrument) -> Option<Decimal> {
        self.last_prices.get(instrument).copied()
    }

    #[must_use]
    pub fn has_pending_entry(&self, instrument: &Instrument) -> bool {
        self.pending_entries
            .values()
            .any(|entry| &entry.instrument == instrument)
    }

    #[must_use]
    pub fn pending_reversal(&self, instrument: &Instrument) -> Option<&PendingReversal> {
        self.reversals.get(instrument)
    }

    /// Applies new parameters; takes effect on the next action.
    pub fn update_config(&mut self, config: AppConfig) {
        self.submitter.set_exchange_config(config.exchange.clone());
        self.config = config;
        tracing::info!("Protection engine configuration updated");
    }

    // =========================================================================
    // Events and alerts
    // =========================================================================

    pub(crate) fn emit(&self, event: ProtectionEvent) {
        tracing::debug!(instrument = %event.instrument(), ?event, "Protection event");
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn alert(&self, severity: AlertSeverity, instrument: &Instrument, message: impl Into<String>) {
        let message = message.into();
        match severity {
            AlertSeverity::Critical => tracing::error!(instrument = %instrument, "CRITICAL: {}", message),
            AlertSeverity::Warning => tracing::warn!(instrument = %instrument, "{}", message),
            AlertSeverity::Info => tracing::info!(instrument = %instrument, "{}", message),
        }
        self.emit(ProtectionEvent::Alert {
            severity,
            instrument: instrument.clone(),
            message,
        });
    }

    pub(crate) fn skip(&self, instrument: &Instrument, reason: impl Into<String>) -> SignalOutcome {
        let reason = reason.into();
        tracing::info!(instrument = %instrument, "Skipped: {}", reason);
        self.emit(ProtectionEvent::ActionSkipped {
            instrument: instrument.clone(),
            reason: reason.clone(),
        });
        SignalOutcome::Skipped(reason)
    }

    /// Latest traded price, else the structure snapshot's price.
    pub(crate) fn reference_price(
        &self,
        instrument: &Instrument,
        structure: Option<&MarketStructure>,
    ) -> Option<Decimal> {
        self.last_price(instrument)
            .or_else(|| structure.map(|s| s.price))
    }

    /// Errors if another multi-step operation owns the instrument.
    pub(crate) fn check_idle(&self, instrument: &Instrument) -> Result<(), ProtectionError> {
        if self.reversals.contains(instrument) {
            return Err(ProtectionError::ReversalInFlight(instrument.clone()));
        }
        if self.has_pending_entry(instrument) {
            return Err(ProtectionError::EntryInFlight(instrument.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Bracket entry
    // =========================================================================

    /// Phase one of the bracket protocol: validate levels, then send the entry.
    ///
    /// Protection is placed only when the entry's fill is reported. If neither the
    /// proposed levels nor the structure fallback validate, nothing is submitted.
    ///
    /// # Errors
    /// Validation failure, an entry rejection, or another operation in flight.
    pub async fn open_position(
        &mut self,
        instrument: &Instrument,
        side: Side,
        quantity: Decimal,
        proposed: Option<(Decimal, Decimal)>,
        structure: Option<&MarketStructure>,
    ) -> Result<OrderId, ProtectionError> {
        self.check_idle(instrument)?;
        if self.tracker.get(instrument).is_some() {
            return Err(ProtectionError::invariant(instrument, "position already tracked"));
        }

        let price = self
            .reference_price(instrument, structure)
            .ok_or_else(|| ProtectionError::NoMarketPrice(instrument.clone()))?;

        let levels = resolve_levels(side, price, proposed, structure, &self.config.protection)
            .map_err(|reason| {
                tracing::warn!(instrument = %instrument, %side, %reason, "Open aborted, no valid protection levels");
                reason
            })?;

        tracing::info!(
            instrument = %instrument,
            %side,
            %quantity,
            stop_loss = %levels.stop_loss,
            take_profit = %levels.take_profit,
            reward_risk = %levels.reward_risk,
            source = ?levels.source,
            "Opening bracketed position"
        );

        self.submit_entry_order(instrument, side, EntryKind::Open, quantity, levels, price)
            .await
    }

    pub(crate) async fn submit_entry_order(
        &mut self,
        instrument: &Instrument,
        side: Side,
        kind: EntryKind,
        quantity: Decimal,
        levels: BracketLevels,
        price: Decimal,
    ) -> Result<OrderId, ProtectionError> {
        let placed = match self.submitter.submit_entry(instrument, side, quantity, price).await {
            Ok(placed) => placed,
            Err(e) => {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("{side} entry rejected, no protection submitted: {e}"),
                );
                return Err(e.into());
            }
        };

        self.pending_entries.insert(
            placed.order_id.clone(),
            PendingEntry {
                instrument: instrument.clone(),
                side,
                kind,
                ordered_quantity: placed.quantity,
                filled_quantity: Decimal::ZERO,
                stop_loss: levels.stop_loss,
                take_profit: levels.take_profit,
            },
        );
        Ok(placed.order_id)
    }

    // =========================================================================
    // Protective orders
    // =========================================================================

    /// Submits one protective leg and records it. A failed SL escalates to the
    /// emergency stop; a failed TP raises a CRITICAL alert.
    async fn submit_protective_leg(
        &mut self,
        instrument: &Instrument,
        kind: ProtectiveKind,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Option<PlacedOrder> {
        match self
            .submitter
            .submit_protective(kind, instrument, side, quantity, price)
            .await
        {
            Ok(Some(placed)) => {
                self.tracker.update(instrument, |r| {
                    r.set_protection(kind, placed.order_id.clone(), placed.price);
                });
                Some(placed)
            }
            Ok(None) => {
                self.skip(instrument, format!("{kind} not placed, position already closed"));
                None
            }
            Err(e) => {
                match kind {
                    ProtectiveKind::StopLoss => {
                        self.emergency_stop(instrument, &format!("stop-loss submission failed: {e}"))
                            .await;
                    }
                    ProtectiveKind::TakeProfit => {
                        self.alert(
                            AlertSeverity::Critical,
                            instrument,
                            format!("take-profit submission at {price} failed: {e}"),
                        );
                    }
                }
                None
            }
        }
    }

    /// Places a protective order where none is live.
    pub(crate) async fn place_protective(
        &mut self,
        instrument: &Instrument,
        kind: ProtectiveKind,
        price: Decimal,
        quantity: Decimal,
    ) -> bool {
        let Some(side) = self.tracker.get(instrument).map(|r| r.side) else {
            return false;
        };
        let Some(placed) = self
            .submit_protective_leg(instrument, kind, side, price, quantity)
            .await
        else {
            return false;
        };
        self.emit(ProtectionEvent::ProtectionPlaced {
            instrument: instrument.clone(),
            kind,
            order_id: placed.order_id,
            price: placed.price,
            quantity: placed.quantity,
        });
        true
    }

    /// Cancels the live `kind` order (if any) and recreates it at `price` for the
    /// record's quantity.
    pub(crate) async fn replace_protective(
        &mut self,
        instrument: &Instrument,
        kind: ProtectiveKind,
        price: Decimal,
    ) -> bool {
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return false;
        };
        let old_price = record.price(kind);

        if let Some(old_id) = record.order_ref(kind) {
            match self.submitter.cancel(instrument, old_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Filled or cancelled underneath us.
                    if let Ok(None) = self.submitter.live_position(instrument).await {
                        self.skip(instrument, format!("{kind} replace abandoned, position closed"));
                        return false;
                    }
                }
                Err(e) => match kind {
                    ProtectiveKind::StopLoss => {
                        if !self.settle_failed_stop_cancel(instrument, old_id, &e).await {
                            return false;
                        }
                    }
                    ProtectiveKind::TakeProfit => {
                        self.alert(
                            AlertSeverity::Warning,
                            instrument,
                            format!("cancel of take-profit {old_id} failed, keeping it: {e}"),
                        );
                        return false;
                    }
                },
            }
            self.tracker.update(instrument, |r| r.clear_order_ref(kind));
        }

        let Some(placed) = self
            .submit_protective_leg(instrument, kind, record.side, price, record.quantity)
            .await
        else {
            return false;
        };
        tracing::info!(
            instrument = %instrument,
            %kind,
            old = ?old_price,
            new = %placed.price,
            quantity = %placed.quantity,
            "Protective order replaced"
        );
        self.emit(ProtectionEvent::ProtectionReplaced {
            instrument: instrument.clone(),
            kind,
            old_price,
            new_price: placed.price,
            quantity: placed.quantity,
        });
        true
    }

    /// Retries a failed stop-loss cancel once, then asks the exchange whether the
    /// old stop is still resting. `true` only when it is confirmed gone.
    ///
    /// A stop that may still be live stays the recorded stop, price and ref
    /// unchanged, so the instrument never carries two stops.
    async fn settle_failed_stop_cancel(
        &mut self,
        instrument: &Instrument,
        old_id: &OrderId,
        error: &GatewayError,
    ) -> bool {
        tracing::warn!(instrument = %instrument, order_id = %old_id, "Stop-loss cancel failed, retrying: {}", error);
        match self.submitter.cancel(instrument, old_id).await {
            Ok(_) => return true,
            Err(e) => {
                tracing::warn!(instrument = %instrument, order_id = %old_id, "Stop-loss cancel retry failed: {}", e);
            }
        }

        match self.submitter.open_orders(instrument).await {
            Ok(orders) if orders.iter().any(|o| &o.order_id == old_id) => {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("cancel of stop-loss {old_id} failed, keeping existing stop: {error}"),
                );
                false
            }
            Ok(_) => {
                tracing::info!(instrument = %instrument, order_id = %old_id, "Old stop-loss no longer resting");
                true
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("cancel of stop-loss {old_id} failed and open orders unreadable ({e}); keeping recorded stop"),
                );
                false
            }
        }
    }

    /// Replaces both legs for the record's current quantity. `None` keeps the
    /// recorded price of that leg.
    pub(crate) async fn refresh_protection(
        &mut self,
        instrument: &Instrument,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) {
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };
        match stop_loss.or(record.current_sl_price) {
            Some(sl) => {
                self.replace_protective(instrument, ProtectiveKind::StopLoss, sl)
                    .await;
            }
            None => {
                self.emergency_stop(instrument, "no stop-loss level recorded").await;
            }
        }
        if let Some(tp) = take_profit.or(record.current_tp_price) {
            self.replace_protective(instrument, ProtectiveKind::TakeProfit, tp)
                .await;
        }
    }

    /// Re-places a missing leg at its recorded price when that price is still on
    /// the correct side of the market. A stop that cannot be restored falls back to
    /// the emergency stop.
    pub(crate) async fn repair_protection(&mut self, instrument: &Instrument, kind: ProtectiveKind) {
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };
        if record.order_ref(kind).is_some() {
            return;
        }
        let market = self.last_price(instrument).unwrap_or(record.entry_price);

        let restorable = record.price(kind).filter(|&level| match (kind, record.side) {
            (ProtectiveKind::StopLoss, Side::Long) | (ProtectiveKind::TakeProfit, Side::Short) => {
                level < market
            }
            (ProtectiveKind::StopLoss, Side::Short) | (ProtectiveKind::TakeProfit, Side::Long) => {
                level > market
            }
        });

        match (kind, restorable) {
            (_, Some(level)) => {
                tracing::info!(instrument = %instrument, %kind, %level, "Restoring protective order");
                self.place_protective(instrument, kind, level, record.quantity)
                    .await;
            }
            (ProtectiveKind::StopLoss, None) => {
                self.emergency_stop(instrument, "stop-loss missing and recorded level unusable")
                    .await;
            }
            (ProtectiveKind::TakeProfit, None) => {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    "take-profit missing and recorded level unusable; running with stop-loss only",
                );
            }
        }
    }

    /// Makes sure a stop-loss is live for a tracked position.
    pub(crate) async fn ensure_protected(&mut self, instrument: &Instrument) {
        self.repair_protection(instrument, ProtectiveKind::StopLoss)
            .await;
    }

    /// Last-resort stop at a fixed offset from the current price.
    ///
    /// Uses the exchange's view of the position when available and the tracked
    /// record otherwise. Always raises a CRITICAL alert.
    pub(crate) async fn emergency_stop(&mut self, instrument: &Instrument, reason: &str) -> bool {
        let live = match self.submitter.live_position(instrument).await {
            Ok(None) => {
                tracing::info!(instrument = %instrument, "No live position, emergency stop not needed");
                self.finalize_close(instrument, None).await;
                return true;
            }
            Ok(Some(position)) => Some(position),
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Position query failed before emergency stop: {}", e);
                None
            }
        };

        let target = match (&live, self.tracker.get(instrument)) {
            (Some(position), _) => Some((
                position.side,
                position.quantity,
                position.mark_price,
                position.entry_price,
            )),
            (None, Some(record)) => Some((
                record.side,
                record.quantity,
                self.last_price(instrument).unwrap_or(record.entry_price),
                record.entry_price,
            )),
            (None, None) => None,
        };
        let Some((side, quantity, reference, entry)) = target else {
            self.alert(
                AlertSeverity::Critical,
                instrument,
                format!("{reason}; position unknown, emergency stop NOT placed"),
            );
            return false;
        };

        let pct = self.config.protection.emergency_sl_pct;
        match self
            .submitter
            .submit_emergency_sl(instrument, side, quantity, reference, pct)
            .await
        {
            Ok(placed) => {
                let tracked = self
                    .tracker
                    .get(instrument)
                    .is_some_and(|r| r.side == side);
                if !tracked {
                    self.tracker.upsert(PositionProtectionRecord::new(
                        instrument.clone(),
                        side,
                        entry,
                        quantity,
                    ));
                }
                self.tracker.update(instrument, |r| {
                    r.quantity = quantity;
                    r.set_protection(ProtectiveKind::StopLoss, placed.order_id.clone(), placed.price);
                });
                self.emit(ProtectionEvent::EmergencyStopPlaced {
                    instrument: instrument.clone(),
                    order_id: placed.order_id,
                    price: placed.price,
                    quantity: placed.quantity,
                });
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("{reason}; emergency stop placed at {}", placed.price),
                );
                true
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("{reason}; emergency stop FAILED ({e}), position UNPROTECTED"),
                );
                false
            }
        }
    }

    // =========================================================================
    // Position lifecycle
    // =========================================================================

    /// Position is flat: cancel leftover reduce-only orders and drop the record.
    pub(crate) async fn finalize_close(&mut self, instrument: &Instrument, realized_pnl: Option<Decimal>) {
        match self.submitter.cancel_reduce_only(instrument, None).await {
            Ok(cancelled) if !cancelled.is_empty() => {
                tracing::info!(instrument = %instrument, count = cancelled.len(), "Cancelled peer reduce-only orders");
            }
            Ok(_) => {}
            Err(e) => self.alert(
                AlertSeverity::Warning,
                instrument,
                format!("could not cancel leftover reduce-only orders: {e}"),
            ),
        }

        self.pending_reduces.retain(|_, r| &r.instrument != instrument);

        if let Some(record) = self.tracker.clear(instrument) {
            let realized_pnl = realized_pnl.unwrap_or_default();
            tracing::info!(
                instrument = %instrument,
                side = %record.side,
                %realized_pnl,
                "Position closed"
            );
            self.emit(ProtectionEvent::PositionClosed {
                instrument: instrument.clone(),
                side: record.side,
                realized_pnl,
            });
        }
    }

    /// Brings the record and both legs back in line with the exchange position.
    pub(crate) async fn resize_to_live(&mut self, instrument: &Instrument) {
        match self.submitter.live_position(instrument).await {
            Ok(None) => self.finalize_close(instrument, None).await,
            Ok(Some(position)) => {
                let matches = self
                    .tracker
                    .get(instrument)
                    .is_some_and(|r| r.side == position.side);
                if !matches {
                    self.reconcile_instrument(instrument).await;
                    return;
                }
                self.tracker
                    .update(instrument, |r| r.quantity = position.quantity);
                self.refresh_protection(instrument, None, None).await;
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("could not verify live position: {e}"),
                );
                self.ensure_protected(instrument).await;
            }
        }
    }
}
