//! Manual one-cancels-other for independently submitted SL/TP orders.
//!
//! The exchange does not link the two protective orders, so the pair is modelled
//! as a small per-instrument state machine. [`transition`] is the only place that
//! decides what happens to the peer when one side fills or disappears.

use perp_guard_core::{PositionProtectionRecord, ProtectiveKind};
use rust_decimal::Decimal;

/// Live protective orders for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    NoProtection,
    SlOnly,
    TpOnly,
    Protected,
}

impl ProtectionState {
    #[must_use]
    pub fn of(record: &PositionProtectionRecord) -> Self {
        Self::from_flags(record.sl_order_ref.is_some(), record.tp_order_ref.is_some())
    }

    const fn from_flags(sl: bool, tp: bool) -> Self {
        match (sl, tp) {
            (false, false) => Self::NoProtection,
            (true, false) => Self::SlOnly,
            (false, true) => Self::TpOnly,
            (true, true) => Self::Protected,
        }
    }

    #[must_use]
    pub const fn has(self, kind: ProtectiveKind) -> bool {
        match kind {
            ProtectiveKind::StopLoss => matches!(self, Self::SlOnly | Self::Protected),
            ProtectiveKind::TakeProfit => matches!(self, Self::TpOnly | Self::Protected),
        }
    }

    #[must_use]
    pub const fn with(self, kind: ProtectiveKind) -> Self {
        match kind {
            ProtectiveKind::StopLoss => Self::from_flags(true, self.has(ProtectiveKind::TakeProfit)),
            ProtectiveKind::TakeProfit => Self::from_flags(self.has(ProtectiveKind::StopLoss), true),
        }
    }

    #[must_use]
    pub const fn without(self, kind: ProtectiveKind) -> Self {
        match kind {
            ProtectiveKind::StopLoss => Self::from_flags(false, self.has(ProtectiveKind::TakeProfit)),
            ProtectiveKind::TakeProfit => Self::from_flags(self.has(ProtectiveKind::StopLoss), false),
        }
    }

    /// A position is only safe while a stop-loss is live.
    #[must_use]
    pub const fn is_safe(self) -> bool {
        self.has(ProtectiveKind::StopLoss)
    }
}

/// Something that happened to one protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcoTrigger {
    Placed(ProtectiveKind),
    /// Fill of a protective order; `remaining` is the position left afterwards.
    Filled {
        kind: ProtectiveKind,
        remaining: Decimal,
    },
    /// Cancelled, expired or rejected by the exchange without our request.
    Lost(ProtectiveKind),
}

/// What the engine must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcoAction {
    None,
    /// Position is flat: cancel every other reduce-only order.
    CancelPeers,
    /// Position shrank: re-size the peer to the remaining quantity.
    ResizePeer {
        kind: ProtectiveKind,
        quantity: Decimal,
    },
    /// Re-place the missing order.
    Repair(ProtectiveKind),
}

#[must_use]
pub fn transition(state: ProtectionState, trigger: OcoTrigger) -> (ProtectionState, OcoAction) {
    match trigger {
        OcoTrigger::Placed(kind) => (state.with(kind), OcoAction::None),
        OcoTrigger::Filled { .. } if state == ProtectionState::NoProtection => {
            (state, OcoAction::CancelPeers)
        }
        OcoTrigger::Filled { remaining, .. } if remaining <= Decimal::ZERO => {
            (ProtectionState::NoProtection, OcoAction::CancelPeers)
        }
        OcoTrigger::Filled { kind, remaining } => {
            let peer = kind.peer();
            if state.has(peer) {
                (
                    state,
                    OcoAction::ResizePeer {
                        kind: peer,
                        quantity: remaining,
                    },
                )
            } else {
                (state, OcoAction::None)
            }
        }
        OcoTrigger::Lost(kind) => (state.without(kind), OcoAction::Repair(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn placing_both_legs_reaches_protected() {
        let (state, _) = transition(ProtectionState::NoProtection, OcoTrigger::Placed(ProtectiveKind::StopLoss));
        assert_eq!(state, ProtectionState::SlOnly);
        let (state, action) = transition(state, OcoTrigger::Placed(ProtectiveKind::TakeProfit));
        assert_eq!(state, ProtectionState::Protected);
        assert_eq!(action, OcoAction::None);
    }

    #[test]
    fn full_fill_cancels_peers() {
        let (state, action) = transition(
            ProtectionState::Protected,
            OcoTrigger::Filled {
                kind: ProtectiveKind::TakeProfit,
                remaining: dec!(0),
            },
        );
        assert_eq!(state, ProtectionState::NoProtection);
        assert_eq!(action, OcoAction::CancelPeers);
    }

    #[test]
    fn partial_fill_resizes_peer() {
        let (state, action) = transition(
            ProtectionState::Protected,
            OcoTrigger::Filled {
                kind: ProtectiveKind::TakeProfit,
                remaining: dec!(0.4),
            },
        );
        assert_eq!(state, ProtectionState::Protected);
        assert_eq!(
            action,
            OcoAction::ResizePeer {
                kind: ProtectiveKind::StopLoss,
                quantity: dec!(0.4)
            }
        );
    }

    #[test]
    fn partial_fill_without_peer_is_noop() {
        let (_, action) = transition(
            ProtectionState::SlOnly,
            OcoTrigger::Filled {
                kind: ProtectiveKind::StopLoss,
                remaining: dec!(1),
            },
        );
        assert_eq!(action, OcoAction::None);
    }

    #[test]
    fn lost_stop_requires_repair() {
        let (state, action) = transition(ProtectionState::Protected, OcoTrigger::Lost(ProtectiveKind::StopLoss));
        assert_eq!(state, ProtectionState::TpOnly);
        assert!(!state.is_safe());
        assert_eq!(action, OcoAction::Repair(ProtectiveKind::StopLoss));
    }
}
