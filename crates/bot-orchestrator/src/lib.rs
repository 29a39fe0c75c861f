//! Event-reactive orchestration around the protection engine.
//!
//! [`TradingActor`] is the single task allowed to mutate protection state. It
//! multiplexes exchange events, price ticks, control commands, config reloads
//! and timer-driven decision cycles. [`ControlHandle`] is the cross-task surface:
//! commands are queued to the actor and status is read from a lock-guarded
//! snapshot.

pub mod bot_actor;
pub mod bot_handle;
pub mod commands;
pub mod replay;
pub mod status;
pub mod ticker;

pub use bot_actor::{ActorInputs, TradingActor};
pub use bot_handle::ControlHandle;
pub use commands::{BotState, ControlCommand};
pub use replay::{load_price_csv, ReplaySignalProducer};
pub use status::{SharedStatus, StatusSnapshot};
pub use ticker::{spawn_ticker, CycleGuard, CycleToken};
