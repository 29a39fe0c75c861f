//! Startup reconciliation.
//!
//! Rebuilds the tracker from what the exchange actually holds. Any live position
//! found without a stop gets an emergency stop before the first decision cycle.

use perp_guard_core::{
    AlertSeverity, Instrument, OpenOrder, OrderId, PositionProtectionRecord, ProtectiveKind, Side,
};
use rust_decimal::Decimal;

use crate::engine::ProtectionEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Flat,
    /// Live stop (and possibly TP) found and adopted.
    Rehydrated,
    /// No usable stop; emergency stop attempted.
    Emergency,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub flat: Vec<Instrument>,
    pub rehydrated: Vec<Instrument>,
    pub emergency: Vec<Instrument>,
    pub failed: Vec<Instrument>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.emergency.is_empty() && self.failed.is_empty()
    }
}

/// A live protective order picked up from the exchange.
#[derive(Debug, Clone)]
struct LiveLeg {
    order_id: OrderId,
    price: Decimal,
    quantity: Decimal,
}

/// Picks the most protective stop. Returns it and the order ids of the rest.
fn select_stop(side: Side, orders: &[OpenOrder]) -> (Option<LiveLeg>, Vec<OrderId>) {
    let mut best: Option<LiveLeg> = None;
    let mut duplicates = Vec::new();
    for order in orders.iter().filter(|o| o.is_stop_for(side)) {
        let Some(price) = order.trigger_price else {
            duplicates.push(order.order_id.clone());
            continue;
        };
        let leg = LiveLeg {
            order_id: order.order_id.clone(),
            price,
            quantity: order.quantity,
        };
        match best.take() {
            Some(current) if !side.is_more_protective(price, current.price) => {
                duplicates.push(leg.order_id);
                best = Some(current);
            }
            Some(current) => {
                duplicates.push(current.order_id);
                best = Some(leg);
            }
            None => best = Some(leg),
        }
    }
    (best, duplicates)
}

/// First reduce-only take-profit; the rest are duplicates.
fn select_take_profit(side: Side, orders: &[OpenOrder]) -> (Option<LiveLeg>, Vec<OrderId>) {
    let mut legs = orders
        .iter()
        .filter(|o| o.is_take_profit_for(side))
        .filter_map(|o| {
            o.price.map(|price| LiveLeg {
                order_id: o.order_id.clone(),
                price,
                quantity: o.quantity,
            })
        });
    let first = legs.next();
    (first, legs.map(|leg| leg.order_id).collect())
}

impl ProtectionEngine {
    /// Reconciles every configured instrument. Runs once, before the first cycle.
    pub async fn reconcile(&mut self, instruments: &[Instrument]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for instrument in instruments {
            let bucket = match self.reconcile_instrument(instrument).await {
                ReconcileOutcome::Flat => &mut report.flat,
                ReconcileOutcome::Rehydrated => &mut report.rehydrated,
                ReconcileOutcome::Emergency => &mut report.emergency,
                ReconcileOutcome::Failed => &mut report.failed,
            };
            bucket.push(instrument.clone());
        }
        tracing::info!(
            flat = report.flat.len(),
            rehydrated = report.rehydrated.len(),
            emergency = report.emergency.len(),
            failed = report.failed.len(),
            "Startup reconciliation complete"
        );
        report
    }

    pub(crate) async fn reconcile_instrument(&mut self, instrument: &Instrument) -> ReconcileOutcome {
        let position = match self.submitter.live_position(instrument).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                if self.tracker.clear(instrument).is_some() {
                    tracing::info!(instrument = %instrument, "Exchange flat, dropped stale record");
                }
                return ReconcileOutcome::Flat;
            }
            Err(e) => {
                self.alert(
                    AlertSeverity::Critical,
                    instrument,
                    format!("reconcile failed, position unknown: {e}"),
                );
                return ReconcileOutcome::Failed;
            }
        };
        let side = position.side;
        self.last_prices
            .entry(instrument.clone())
            .or_insert(position.mark_price);

        let mut record = PositionProtectionRecord::new(
            instrument.clone(),
            side,
            position.entry_price,
            position.quantity,
        );
        if let Some(existing) = self.tracker.get(instrument).filter(|r| r.side == side) {
            record.trailing_activated = existing.trailing_activated;
            record.high_water_price = existing.high_water_price;
            record.low_water_price = existing.low_water_price;
            record.opened_at = existing.opened_at;
        }

        let orders = match self.submitter.open_orders(instrument).await {
            Ok(orders) => orders,
            Err(e) => {
                self.tracker.upsert(record);
                self.emergency_stop(instrument, &format!("open orders unavailable during reconcile: {e}"))
                    .await;
                return ReconcileOutcome::Emergency;
            }
        };

        let (stop, mut stale) = select_stop(side, &orders);
        let (take_profit, stale_tps) = select_take_profit(side, &orders);
        stale.extend(stale_tps);
        for order_id in &stale {
            if let Err(e) = self.submitter.cancel(instrument, order_id).await {
                self.alert(
                    AlertSeverity::Warning,
                    instrument,
                    format!("could not cancel duplicate protective order {order_id}: {e}"),
                );
            }
        }

        for (kind, leg) in [
            (ProtectiveKind::StopLoss, &stop),
            (ProtectiveKind::TakeProfit, &take_profit),
        ] {
            if let Some(leg) = leg {
                record.set_protection(kind, leg.order_id.clone(), leg.price);
            }
        }
        tracing::info!(
            instrument = %instrument,
            %side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            sl = ?record.current_sl_price,
            tp = ?record.current_tp_price,
            duplicates = stale.len(),
            "Reconciled live position"
        );
        self.tracker.upsert(record);

        let Some(stop) = stop else {
            self.emergency_stop(instrument, "position found without stop-loss")
                .await;
            return ReconcileOutcome::Emergency;
        };
        if stop.quantity != position.quantity {
            self.replace_protective(instrument, ProtectiveKind::StopLoss, stop.price)
                .await;
        }
        if let Some(tp) = take_profit.filter(|tp| tp.quantity != position.quantity) {
            self.replace_protective(instrument, ProtectiveKind::TakeProfit, tp.price)
                .await;
        }
        ReconcileOutcome::Rehydrated
    }
}
