pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod events;
pub mod position;
pub mod position_sizing;
pub mod signal;
pub mod structure;
pub mod traits;
pub mod types;

pub use config::{
    AppConfig, BotConfig, ExchangeConfig, ProtectionConfig, ReversalConfig, SizingConfig,
    TrailingConfig,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{GatewayError, ProtectionError, SignalError, ValidationFailure};
pub use events::{AlertSeverity, ExchangeEvent, FillEvent, MarketEvent, ProtectionEvent};
pub use position::{PositionProtectionRecord, PositionTracker, TrackerSnapshot};
pub use signal::{Confidence, RawSignal, SignalAction, TradingSignal};
pub use structure::{MarketStructure, RollingStructure};
pub use traits::{ExchangeGateway, MarketStructureProvider, SignalProducer};
pub use types::{
    ExchangePosition, Instrument, OpenOrder, OrderId, OrderRequest, OrderSide, OrderType,
    ProtectiveKind, Side, TimeInForce,
};
