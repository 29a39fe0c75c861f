use crate::commands::ControlCommand;
use crate::status::{SharedStatus, StatusSnapshot};
use anyhow::{Context, Result};
use perp_guard_core::{Instrument, ProtectionEvent};
use perp_guard_protection::SignalOutcome;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Cloneable control surface for a running [`crate::TradingActor`].
///
/// Mutating calls are queued to the actor and go through the engine's normal
/// validated paths. [`ControlHandle::status`] only reads the published snapshot.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
    status: SharedStatus,
    events: broadcast::Sender<ProtectionEvent>,
}

impl ControlHandle {
    #[must_use]
    pub const fn new(
        tx: mpsc::Sender<ControlCommand>,
        status: SharedStatus,
        events: broadcast::Sender<ProtectionEvent>,
    ) -> Self {
        Self { tx, status, events }
    }

    /// Stops acting on new signals. Protection keeps running.
    ///
    /// # Errors
    /// Returns an error if the actor has stopped.
    pub async fn pause(&self) -> Result<()> {
        self.tx.send(ControlCommand::Pause).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the actor has stopped.
    pub async fn resume(&self) -> Result<()> {
        self.tx.send(ControlCommand::Resume).await?;
        Ok(())
    }

    /// Flattens the position on `instrument`.
    ///
    /// # Errors
    /// Returns an error if the actor has stopped or the engine refused the close.
    pub async fn close(&self, instrument: Instrument) -> Result<SignalOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ControlCommand::Close { instrument, reply }).await?;
        let outcome = rx.await.context("actor dropped close request")??;
        Ok(outcome)
    }

    /// Reduces the position on `instrument` by `fraction` of its size.
    ///
    /// # Errors
    /// Returns an error if the actor has stopped or the engine refused the reduce.
    pub async fn reduce(&self, instrument: Instrument, fraction: Decimal) -> Result<SignalOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::Reduce {
                instrument,
                fraction,
                reply,
            })
            .await?;
        let outcome = rx.await.context("actor dropped reduce request")??;
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error if the actor has stopped or the new stop failed validation.
    pub async fn modify_sl(&self, instrument: Instrument, price: Decimal) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::ModifyStopLoss {
                instrument,
                price,
                reply,
            })
            .await?;
        rx.await.context("actor dropped stop-loss request")??;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the actor has stopped or the new target failed validation.
    pub async fn modify_tp(&self, instrument: Instrument, price: Decimal) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::ModifyTakeProfit {
                instrument,
                price,
                reply,
            })
            .await?;
        rx.await.context("actor dropped take-profit request")??;
        Ok(())
    }

    /// Runs a decision cycle immediately and waits for it to finish.
    ///
    /// # Errors
    /// Returns an error if the actor has stopped.
    pub async fn run_cycle(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControlCommand::RunCycle(tx)).await?;
        rx.await.context("actor dropped cycle request")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the actor has already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(ControlCommand::Shutdown).await?;
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.read().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProtectionEvent> {
        self.events.subscribe()
    }
}
