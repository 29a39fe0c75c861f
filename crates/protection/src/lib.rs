//! Position protection and order lifecycle state machine.
//!
//! Keeps every open position covered by a live stop-loss (and normally a
//! take-profit) through entries, scale-ins, scale-outs, trailing, reversals and
//! restarts. [`ProtectionEngine`] is driven by a single task: signals through
//! [`ProtectionEngine::on_signal`], exchange events through
//! [`ProtectionEngine::on_exchange_event`], prices through
//! [`ProtectionEngine::on_price`] and the timer through
//! [`ProtectionEngine::run_maintenance`].

pub mod cycle;
pub mod engine;
mod fills;
pub mod manual;
pub mod oco;
pub mod recalc;
pub mod reconciler;
pub mod reversal;
pub mod scaling;
pub mod submission;
pub mod trailing;
pub mod validation;

pub use cycle::DEFAULT_REDUCE_FRACTION;
pub use engine::{EntryKind, PendingEntry, PendingReduce, ProtectionEngine, ReducePurpose, SignalOutcome};
pub use oco::{OcoAction, OcoTrigger, ProtectionState};
pub use recalc::RecalcDecision;
pub use reconciler::{ReconcileOutcome, ReconcileReport};
pub use reversal::PendingReversal;
pub use validation::{BracketLevels, LevelSource};
