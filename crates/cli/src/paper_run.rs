use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use perp_guard_core::{ConfigLoader, ConfigWatcher, MarketEvent, ProtectionEvent, RollingStructure};
use perp_guard_orchestrator::{load_price_csv, ActorInputs, ControlHandle, ReplaySignalProducer, TradingActor};
use perp_guard_paper::PaperExchange;
use perp_guard_protection::ProtectionEngine;
use tokio::sync::{broadcast, mpsc};

const TICK_CHANNEL_CAPACITY: usize = 256;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
    /// CSV of `instrument,price` rows, replayed in order
    #[arg(long)]
    pub prices: String,
    /// JSON-lines file of raw signals, one consumed per instrument per cycle
    #[arg(long)]
    pub signals: Option<String>,
    /// Delay between replayed prices
    #[arg(long, default_value_t = 0)]
    pub tick_ms: u64,
    /// Run a decision cycle after every N prices instead of on the timer
    #[arg(long)]
    pub cycle_every: Option<usize>,
    /// Override the configured cycle period
    #[arg(long)]
    pub cycle_ms: Option<u64>,
    /// Prices kept per instrument for support/resistance
    #[arg(long, default_value_t = 50)]
    pub structure_window: usize,
    /// Reload the config file when it changes
    #[arg(long)]
    pub watch: bool,
    /// Write logs here instead of stderr
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Replays the price file through the paper exchange and the actor, printing
/// every protection event as a JSON line and the final status at the end.
pub async fn run(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load_from(&args.config)?;
    let ticks = load_price_csv(&args.prices)?;
    let signals = match &args.signals {
        Some(path) => ReplaySignalProducer::from_jsonl(path)?,
        None => ReplaySignalProducer::default(),
    };
    tracing::info!(
        bot_id = %config.bot.bot_id,
        ticks = ticks.len(),
        signals = signals.remaining(),
        "Starting paper replay"
    );

    let (paper, exchange_events) = PaperExchange::new(&config.exchange);
    let engine = ProtectionEngine::new(paper.clone(), config.clone());

    let config_updates = if args.watch {
        let (watcher, rx) = ConfigWatcher::new(config.clone());
        let path = args.config.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch(path).await {
                tracing::error!("Config watcher stopped: {:#}", e);
            }
        });
        Some(rx)
    } else {
        None
    };

    let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
    let inputs = ActorInputs {
        exchange_events,
        ticks: tick_rx,
        config_updates,
    };
    let (mut actor, handle) = TradingActor::new(
        engine,
        Box::new(signals),
        Box::new(RollingStructure::new(args.structure_window)),
        inputs,
    );
    if let Some(ms) = args.cycle_ms {
        actor = actor.with_cycle_interval(Duration::from_millis(ms));
    }

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let actor_task = tokio::spawn(actor.run());

    tokio::select! {
        result = replay(&paper, ticks, &tick_tx, &handle, &args) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    handle.run_cycle().await?;
    let status = handle.status();
    let account = paper.account();
    handle.shutdown().await?;
    actor_task.await.context("actor task panicked")??;
    // Last sender gone: the printer drains and exits.
    drop(handle);
    printer.await.context("event printer panicked")?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    tracing::info!(
        realized_pnl = %account.realized_pnl,
        commissions = %account.commissions,
        fills = account.fills,
        cycles = status.cycles_completed,
        "Paper replay finished"
    );
    Ok(())
}

async fn replay(
    paper: &Arc<PaperExchange>,
    ticks: Vec<MarketEvent>,
    tick_tx: &mpsc::Sender<MarketEvent>,
    handle: &ControlHandle,
    args: &RunArgs,
) -> Result<()> {
    for (index, tick) in ticks.into_iter().enumerate() {
        paper.update_price(tick.instrument(), tick.price());
        tick_tx.send(tick).await.context("actor stopped during replay")?;

        if let Some(every) = args.cycle_every.filter(|n| *n > 0) {
            if (index + 1) % every == 0 {
                handle.run_cycle().await?;
            }
        }
        if args.tick_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.tick_ms)).await;
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ProtectionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
