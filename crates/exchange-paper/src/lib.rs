//! Paper trading exchange.
//!
//! [`PaperExchange`] implements [`perp_guard_core::ExchangeGateway`] entirely in
//! memory. It makes no network calls and cannot place real trades. Fills,
//! closes and cancellations are reported on an event channel, the same way a
//! live gateway delivers them.

mod paper;

pub use paper::{PaperAccount, PaperExchange};
