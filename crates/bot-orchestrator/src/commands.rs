use perp_guard_core::{Instrument, ProtectionError};
use perp_guard_protection::SignalOutcome;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub type OutcomeReply = oneshot::Sender<Result<SignalOutcome, ProtectionError>>;
pub type ModifyReply = oneshot::Sender<Result<(), ProtectionError>>;

/// Requests from the control surface. Applied by the actor's own loop, never
/// directly against the engine.
#[derive(Debug)]
pub enum ControlCommand {
    Pause,
    Resume,
    Close {
        instrument: Instrument,
        reply: OutcomeReply,
    },
    Reduce {
        instrument: Instrument,
        /// Fraction of the position in `(0, 1]`.
        fraction: Decimal,
        reply: OutcomeReply,
    },
    ModifyStopLoss {
        instrument: Instrument,
        price: Decimal,
        reply: ModifyReply,
    },
    ModifyTakeProfit {
        instrument: Instrument,
        price: Decimal,
        reply: ModifyReply,
    },
    /// Runs one decision cycle now and replies when it has finished.
    RunCycle(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BotState {
    /// Reconciling with the exchange; no cycles yet.
    #[default]
    Starting,
    Running,
    /// Signals ignored. Protection, trailing and fills still handled.
    Paused,
    Stopped,
}
