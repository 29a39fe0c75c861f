use std::ops::ControlFlow;
use std::time::Duration;

use crate::bot_handle::ControlHandle;
use crate::commands::{BotState, ControlCommand};
use crate::status::{SharedStatus, StatusSnapshot};
use crate::ticker::{spawn_ticker, CycleGuard};
use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use perp_guard_core::{
    AppConfig, ExchangeEvent, Instrument, MarketEvent, MarketStructure, MarketStructureProvider,
    SignalProducer, TrackerSnapshot,
};
use perp_guard_protection::ProtectionEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// External inputs the actor reacts to.
pub struct ActorInputs {
    pub exchange_events: mpsc::UnboundedReceiver<ExchangeEvent>,
    pub ticks: mpsc::Receiver<MarketEvent>,
    /// Hot-reloaded configuration, if a watcher is running.
    pub config_updates: Option<watch::Receiver<AppConfig>>,
}

/// Owns the [`ProtectionEngine`] and applies every mutation on one task.
///
/// Startup reconciliation runs before the loop, so the first cycle always sees
/// a rebuilt tracker. Inside the loop, exchange events and ticks are drained
/// ahead of commands and cycle requests.
pub struct TradingActor {
    bot_id: String,
    instruments: Vec<Instrument>,
    engine: ProtectionEngine,
    signals: Box<dyn SignalProducer>,
    structure: Box<dyn MarketStructureProvider>,
    state: BotState,
    cycle_interval: Duration,
    guard: CycleGuard,
    cycles_completed: u64,

    rx: mpsc::Receiver<ControlCommand>,
    inputs: ActorInputs,

    status: SharedStatus,
    positions: TrackerSnapshot,
}

impl TradingActor {
    /// Creates the actor and its control handle. Nothing runs until [`Self::run`].
    #[must_use]
    pub fn new(
        engine: ProtectionEngine,
        signals: Box<dyn SignalProducer>,
        structure: Box<dyn MarketStructureProvider>,
        inputs: ActorInputs,
    ) -> (Self, ControlHandle) {
        let config = engine.config();
        let bot_id = config.bot.bot_id.clone();
        let instruments = config.bot.instruments();
        let cycle_interval = Duration::from_secs(config.bot.cycle_interval_secs);

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(StatusSnapshot::new(bot_id.clone())));
        let handle = ControlHandle::new(tx, Arc::clone(&status), engine.event_sender());
        let positions = engine.snapshot();

        let actor = Self {
            bot_id,
            instruments,
            engine,
            signals,
            structure,
            state: BotState::Starting,
            cycle_interval,
            guard: CycleGuard::new(),
            cycles_completed: 0,
            rx,
            inputs,
            status,
            positions,
        };
        (actor, handle)
    }

    /// Overrides the configured cycle period.
    #[must_use]
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Reconciles, then runs until shutdown or until every handle is dropped.
    ///
    /// # Errors
    /// Does not currently fail.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            bot_id = %self.bot_id,
            signals = self.signals.name(),
            instruments = ?self.instruments,
            "Trading actor starting"
        );

        let report = self.engine.reconcile(&self.instruments).await;
        if report.is_clean() {
            tracing::info!(bot_id = %self.bot_id, ?report, "Startup reconciliation complete");
        } else {
            tracing::warn!(bot_id = %self.bot_id, ?report, "Startup reconciliation needed repairs");
        }

        self.state = BotState::Running;
        self.publish_status();

        let (ticker, mut cycles) = spawn_ticker(self.cycle_interval, self.guard.clone());
        // Without a watcher the placeholder never changes.
        let (_config_tx, placeholder) = watch::channel(self.engine.config().clone());
        let mut config_updates = self.inputs.config_updates.take().unwrap_or(placeholder);

        loop {
            tokio::select! {
                biased;

                Some(event) = self.inputs.exchange_events.recv() => {
                    self.engine.on_exchange_event(event).await;
                    self.publish_status();
                }
                Some(tick) = self.inputs.ticks.recv() => {
                    self.on_tick(&tick).await;
                }
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::info!(bot_id = %self.bot_id, "All control handles dropped");
                        break;
                    };
                    if self.handle_command(cmd).await.is_break() {
                        break;
                    }
                }
                Ok(()) = config_updates.changed() => {
                    let config = config_updates.borrow_and_update().clone();
                    self.apply_config(config);
                }
                Some(()) = cycles.recv() => {
                    self.run_cycle().await;
                }
            }
        }

        ticker.abort();
        self.state = BotState::Stopped;
        self.publish_status();
        tracing::info!(bot_id = %self.bot_id, "Trading actor stopped");
        Ok(())
    }

    async fn on_tick(&mut self, tick: &MarketEvent) {
        let instrument = tick.instrument();
        let price = tick.price();
        self.structure.on_price(instrument, price);
        self.engine.on_price(instrument, price).await;
        self.status.write().prices.insert(instrument.clone(), price);
        self.publish_status();
    }

    async fn handle_command(&mut self, cmd: ControlCommand) -> ControlFlow<()> {
        match cmd {
            ControlCommand::Pause => {
                if self.state == BotState::Running {
                    tracing::info!(bot_id = %self.bot_id, "Paused, signals will be ignored");
                    self.state = BotState::Paused;
                    self.publish_status();
                } else {
                    tracing::warn!(bot_id = %self.bot_id, state = ?self.state, "Cannot pause");
                }
            }
            ControlCommand::Resume => {
                if self.state == BotState::Paused {
                    tracing::info!(bot_id = %self.bot_id, "Resumed");
                    self.state = BotState::Running;
                    self.publish_status();
                } else {
                    tracing::warn!(bot_id = %self.bot_id, state = ?self.state, "Not paused, ignoring resume");
                }
            }
            ControlCommand::Close { instrument, reply } => {
                tracing::info!(bot_id = %self.bot_id, instrument = %instrument, "Close requested");
                let result = self.engine.close_position(&instrument).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            ControlCommand::Reduce {
                instrument,
                fraction,
                reply,
            } => {
                tracing::info!(bot_id = %self.bot_id, instrument = %instrument, %fraction, "Reduce requested");
                let structure = self.structure.structure(&instrument);
                let result = self
                    .engine
                    .reduce_by_fraction(&instrument, fraction, structure.as_ref())
                    .await;
                self.publish_status();
                let _ = reply.send(result);
            }
            ControlCommand::ModifyStopLoss {
                instrument,
                price,
                reply,
            } => {
                tracing::info!(bot_id = %self.bot_id, instrument = %instrument, %price, "Stop-loss change requested");
                let result = self.engine.modify_stop_loss(&instrument, price).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            ControlCommand::ModifyTakeProfit {
                instrument,
                price,
                reply,
            } => {
                tracing::info!(bot_id = %self.bot_id, instrument = %instrument, %price, "Take-profit change requested");
                let result = self.engine.modify_take_profit(&instrument, price).await;
                self.publish_status();
                let _ = reply.send(result);
            }
            ControlCommand::RunCycle(done) => {
                self.run_cycle().await;
                let _ = done.send(());
            }
            ControlCommand::Shutdown => {
                tracing::info!(bot_id = %self.bot_id, "Shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// One decision cycle: expire stale reversals, then per instrument act on
    /// the next signal (unless paused) and run protection maintenance.
    async fn run_cycle(&mut self) {
        let Some(_token) = self.guard.try_acquire() else {
            tracing::debug!(bot_id = %self.bot_id, "Cycle already running, skipping");
            return;
        };

        self.engine.expire_reversals(Utc::now()).await;

        for instrument in self.instruments.clone() {
            let structure = self.structure.structure(&instrument);

            if self.state == BotState::Running {
                match structure.as_ref() {
                    Some(current) => self.process_signal(&instrument, current).await,
                    None => {
                        tracing::debug!(instrument = %instrument, "No market data yet, skipping signal");
                    }
                }
            }

            self.engine.run_maintenance(&instrument, structure.as_ref()).await;
        }

        self.cycles_completed += 1;
        {
            let mut status = self.status.write();
            status.cycles_completed = self.cycles_completed;
            status.last_cycle_at = Some(Utc::now());
        }
        self.publish_status();
    }

    async fn process_signal(&mut self, instrument: &Instrument, structure: &MarketStructure) {
        let signal = match self.signals.next_signal(instrument, structure).await {
            Ok(Some(signal)) => signal,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(instrument = %instrument, "Signal producer failed: {:#}", e);
                return;
            }
        };
        if &signal.instrument != instrument {
            tracing::warn!(
                instrument = %instrument,
                signal_instrument = %signal.instrument,
                "Signal for a different instrument, ignoring"
            );
            return;
        }

        match self.engine.on_signal(&signal, Some(structure)).await {
            Ok(outcome) => {
                tracing::info!(instrument = %instrument, action = ?signal.action, ?outcome, "Signal processed");
            }
            Err(e) => {
                tracing::error!(instrument = %instrument, action = ?signal.action, "Signal handling failed: {}", e);
            }
        }
    }

    fn apply_config(&mut self, config: AppConfig) {
        if let Err(e) = config.validate() {
            tracing::error!(bot_id = %self.bot_id, "Ignoring invalid config reload: {:#}", e);
            return;
        }
        if config.bot.instruments() != self.instruments {
            tracing::warn!(bot_id = %self.bot_id, "Instrument list changes apply on restart");
        }
        self.engine.update_config(config);
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.state = self.state;
        status.positions = self.positions.all();
        status.updated_at = Utc::now();
    }
}
