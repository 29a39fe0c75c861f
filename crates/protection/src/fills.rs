//! Exchange event handling: fills, closes and orders that died on the exchange.

use perp_guard_core::{
    AlertSeverity, ExchangeEvent, FillEvent, Instrument, OrderId, PositionProtectionRecord,
    ProtectionEvent, ProtectiveKind,
};
use rust_decimal::Decimal;

use crate::engine::{EntryKind, ProtectionEngine, ReducePurpose};
use crate::oco::{self, OcoAction, OcoTrigger, ProtectionState};
use crate::validation::take_profit_for_fill;

impl ProtectionEngine {
    /// Applies one exchange event. Events are expected in exchange order.
    pub async fn on_exchange_event(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Filled(fill) => self.on_fill(&fill).await,
            ExchangeEvent::PositionClosed {
                instrument,
                realized_pnl,
                ..
            } => self.on_position_closed(&instrument, realized_pnl).await,
            ExchangeEvent::Rejected {
                order_id,
                instrument,
                reason,
            } => {
                self.on_order_dead(&instrument, &order_id, &format!("rejected: {reason}"))
                    .await;
            }
            ExchangeEvent::Canceled {
                order_id,
                instrument,
            } => self.on_order_dead(&instrument, &order_id, "cancelled").await,
            ExchangeEvent::Expired {
                order_id,
                instrument,
            } => self.on_order_dead(&instrument, &order_id, "expired").await,
        }
    }

    async fn on_fill(&mut self, fill: &FillEvent) {
        tracing::debug!(
            instrument = %fill.instrument,
            order_id = %fill.order_id,
            side = %fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            reduce_only = fill.reduce_only,
            "Fill received"
        );

        let protective = self
            .tracker
            .find_by_order(&fill.order_id)
            .map(|(_, kind)| kind);

        if self.pending_entries.contains_key(&fill.order_id) {
            self.on_entry_fill(fill).await;
        } else if self.pending_reduces.contains_key(&fill.order_id) {
            self.on_reduce_fill(fill).await;
        } else if let Some(kind) = protective {
            self.on_protective_fill(fill, kind).await;
        } else if fill.reduce_only {
            self.on_untracked_reduce_fill(fill).await;
        } else {
            self.alert(
                AlertSeverity::Warning,
                &fill.instrument,
                format!("fill for unknown order {}, reconciling", fill.order_id),
            );
            self.reconcile_instrument(&fill.instrument).await;
        }
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Second phase of the bracket: protection sized to what actually filled.
    async fn on_entry_fill(&mut self, fill: &FillEvent) {
        let Some(entry) = self.pending_entries.get_mut(&fill.order_id) else {
            return;
        };
        let first_fill = entry.filled_quantity.is_zero();
        entry.filled_quantity += fill.quantity;
        let entry = entry.clone();
        if entry.filled_quantity >= entry.ordered_quantity {
            self.pending_entries.remove(&fill.order_id);
        }

        let instrument = &fill.instrument;
        match self.tracker.get(instrument).cloned() {
            None => {
                self.tracker.upsert(PositionProtectionRecord::new(
                    instrument.clone(),
                    entry.side,
                    fill.price,
                    fill.quantity,
                ));
                tracing::info!(
                    instrument = %instrument,
                    side = %entry.side,
                    quantity = %fill.quantity,
                    price = %fill.price,
                    "Position opened"
                );
                self.emit(ProtectionEvent::PositionOpened {
                    instrument: instrument.clone(),
                    side: entry.side,
                    quantity: fill.quantity,
                    entry_price: fill.price,
                });
                self.protect_fill(instrument, fill.price, entry.stop_loss, entry.take_profit)
                    .await;
            }
            Some(record) if record.side == entry.side => {
                self.tracker
                    .update(instrument, |r| r.apply_add(fill.quantity, fill.price));
                if entry.kind == EntryKind::Add {
                    self.emit(ProtectionEvent::PositionScaled {
                        instrument: instrument.clone(),
                        side: record.side,
                        old_quantity: record.quantity,
                        new_quantity: record.quantity + fill.quantity,
                    });
                }
                if first_fill && entry.kind == EntryKind::Add {
                    self.protect_fill(instrument, fill.price, entry.stop_loss, entry.take_profit)
                        .await;
                } else {
                    // Later partial fill: same levels, bigger size.
                    self.refresh_protection(instrument, None, None).await;
                }
            }
            Some(record) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!(
                        "{} entry filled against tracked {} position, reconciling",
                        entry.side, record.side
                    ),
                );
                self.reconcile_instrument(instrument).await;
            }
        }
    }

    /// Places (or replaces) SL and TP after a fill at `fill_price`, moving the TP
    /// out if slippage cost reward:risk.
    async fn protect_fill(
        &mut self,
        instrument: &Instrument,
        fill_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) {
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };

        let min_rr = self.config.protection.min_reward_risk;
        let take_profit = match take_profit_for_fill(record.side, fill_price, stop_loss, take_profit, min_rr) {
            Ok((tp, adjusted)) => {
                if adjusted {
                    tracing::info!(
                        instrument = %instrument,
                        %fill_price,
                        planned = %take_profit,
                        restored = %tp,
                        "Fill slippage degraded reward:risk, moving take-profit"
                    );
                }
                tp
            }
            Err(reason) => {
                self.emergency_stop(
                    instrument,
                    &format!("fill at {fill_price} invalidates stop {stop_loss}: {reason}"),
                )
                .await;
                return;
            }
        };

        if ProtectionState::of(&record) == ProtectionState::NoProtection {
            self.place_protective(instrument, ProtectiveKind::StopLoss, stop_loss, record.quantity)
                .await;
            self.place_protective(instrument, ProtectiveKind::TakeProfit, take_profit, record.quantity)
                .await;
        } else {
            self.refresh_protection(instrument, Some(stop_loss), Some(take_profit))
                .await;
        }
    }

    // =========================================================================
    // Reduce-only fills
    // =========================================================================

    async fn on_reduce_fill(&mut self, fill: &FillEvent) {
        let Some(reduce) = self.pending_reduces.get_mut(&fill.order_id) else {
            return;
        };
        reduce.filled_quantity += fill.quantity;
        let reduce = reduce.clone();
        if reduce.filled_quantity >= reduce.quantity {
            self.pending_reduces.remove(&fill.order_id);
        }

        match reduce.purpose {
            // Record and protection were resized when the order went out.
            ReducePurpose::Reduce => {
                tracing::info!(
                    instrument = %fill.instrument,
                    quantity = %fill.quantity,
                    price = %fill.price,
                    "Reduce order filled"
                );
            }
            ReducePurpose::Close | ReducePurpose::Reversal => {
                self.apply_closing_fill(fill).await;
            }
        }
    }

    async fn on_protective_fill(&mut self, fill: &FillEvent, kind: ProtectiveKind) {
        let instrument = &fill.instrument;
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };
        let (pnl, remaining) = self
            .tracker
            .update(instrument, |r| (r.apply_reduce(fill.quantity, fill.price), r.quantity))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        tracing::info!(
            instrument = %instrument,
            %kind,
            order_id = %fill.order_id,
            quantity = %fill.quantity,
            price = %fill.price,
            %remaining,
            "Protective order filled"
        );

        let (_, action) = oco::transition(ProtectionState::of(&record), OcoTrigger::Filled { kind, remaining });
        match action {
            OcoAction::CancelPeers => self.finalize_close(instrument, Some(pnl)).await,
            OcoAction::ResizePeer { kind: peer, .. } => {
                if let Some(price) = record.price(peer) {
                    self.replace_protective(instrument, peer, price).await;
                }
            }
            OcoAction::None | OcoAction::Repair(_) => {}
        }
    }

    /// Reduce-only fill of an order we did not place (manual, or a stale stop).
    async fn on_untracked_reduce_fill(&mut self, fill: &FillEvent) {
        let instrument = &fill.instrument;
        if self.tracker.get(instrument).is_none() {
            return;
        }
        self.alert(
            AlertSeverity::Warning,
            instrument,
            format!("untracked reduce-only order {} filled", fill.order_id),
        );
        let remaining = self.apply_closing_fill(fill).await;
        if remaining.is_some_and(|q| q > Decimal::ZERO) {
            self.resize_to_live(instrument).await;
        }
    }

    /// Removes filled quantity; finalizes the close when nothing is left.
    /// Returns the remaining tracked quantity.
    async fn apply_closing_fill(&mut self, fill: &FillEvent) -> Option<Decimal> {
        let instrument = &fill.instrument;
        let (pnl, remaining) = self
            .tracker
            .update(instrument, |r| (r.apply_reduce(fill.quantity, fill.price), r.quantity))?;
        if remaining <= Decimal::ZERO {
            self.finalize_close(instrument, Some(pnl)).await;
        }
        Some(remaining)
    }

    // =========================================================================
    // Closes and dead orders
    // =========================================================================

    async fn on_position_closed(&mut self, instrument: &Instrument, realized_pnl: Decimal) {
        tracing::info!(instrument = %instrument, %realized_pnl, "Exchange confirmed position closed");
        self.finalize_close(instrument, Some(realized_pnl)).await;

        if let Some(pending) = self.reversals.take(instrument) {
            self.complete_reversal(pending).await;
        }
    }

    async fn on_order_dead(&mut self, instrument: &Instrument, order_id: &OrderId, what: &str) {
        if let Some(entry) = self.pending_entries.remove(order_id) {
            if entry.filled_quantity.is_zero() {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("{} entry order {order_id} {what}", entry.side),
                );
            } else {
                tracing::info!(
                    instrument = %instrument,
                    order_id = %order_id,
                    filled = %entry.filled_quantity,
                    "Remainder of partially filled entry {}", what
                );
            }
            return;
        }

        if let Some(reduce) = self.pending_reduces.remove(order_id) {
            match reduce.purpose {
                ReducePurpose::Reversal => {
                    if self.reversals.take(instrument).is_some() {
                        self.alert(
                            AlertSeverity::Critical,
                            instrument,
                            format!("reversal close order {order_id} {what}, reversal abandoned"),
                        );
                    }
                }
                ReducePurpose::Close => self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("close order {order_id} {what}, position still open"),
                ),
                ReducePurpose::Reduce => self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("reduce order {order_id} {what}, resizing protection to live position"),
                ),
            }
            self.resize_to_live(instrument).await;
            return;
        }

        let Some((_, kind)) = self.tracker.find_by_order(order_id) else {
            tracing::debug!(instrument = %instrument, order_id = %order_id, "Untracked order {}", what);
            return;
        };
        let Some(record) = self.tracker.get(instrument).cloned() else {
            return;
        };

        let (_, action) = oco::transition(ProtectionState::of(&record), OcoTrigger::Lost(kind));
        self.tracker.update(instrument, |r| r.clear_order_ref(kind));
        self.alert(
            AlertSeverity::Warning,
            instrument,
            format!("{kind} order {order_id} {what} by exchange"),
        );
        if let OcoAction::Repair(kind) = action {
            self.repair_protection(instrument, kind).await;
        }
    }
}
