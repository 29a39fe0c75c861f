use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use perp_guard_core::{Instrument, PositionProtectionRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::commands::BotState;

/// Point-in-time view published by the actor for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub bot_id: String,
    pub state: BotState,
    pub prices: BTreeMap<Instrument, Decimal>,
    pub positions: Vec<PositionProtectionRecord>,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    #[must_use]
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            state: BotState::Starting,
            prices: BTreeMap::new(),
            positions: Vec::new(),
            cycles_completed: 0,
            last_cycle_at: None,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn position(&self, instrument: &Instrument) -> Option<&PositionProtectionRecord> {
        self.positions.iter().find(|p| &p.instrument == instrument)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state == BotState::Paused
    }
}

/// The single lock guarding everything the control surface can see.
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;
