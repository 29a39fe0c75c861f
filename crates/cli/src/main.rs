use clap::{Parser, Subcommand, ValueEnum};
use perp_guard_core::{ConfigLoader, Instrument, MarketStructure, ProtectionConfig, Side};
use perp_guard_protection::validation::resolve_levels;
use rust_decimal::Decimal;

mod paper_run;

use paper_run::RunArgs;

#[derive(Parser)]
#[command(name = "perp-guard")]
#[command(about = "Position protection and order lifecycle engine for perpetual futures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay prices and signals through the engine against the paper exchange
    Run(RunArgs),
    /// Load and validate a configuration file, then print the effective config
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Validate a stop-loss / take-profit pair the way an entry would
    CheckBracket {
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        #[arg(long, value_enum)]
        side: SideArg,
        #[arg(long)]
        entry: Decimal,
        #[arg(long)]
        stop_loss: Option<Decimal>,
        #[arg(long)]
        take_profit: Option<Decimal>,
        /// Nearest support, used as fallback
        #[arg(long)]
        support: Option<Decimal>,
        /// Nearest resistance, used as fallback
        #[arg(long)]
        resistance: Option<Decimal>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SideArg {
    Long,
    Short,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Long => Self::Long,
            SideArg::Short => Self::Short,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(RunArgs {
            log_file: Some(path),
            ..
        }) => {
            // stdout carries the event stream; logs go to the file
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match cli.command {
        Commands::Run(args) => {
            paper_run::run(args).await?;
        }
        Commands::CheckConfig { config } => {
            let config = ConfigLoader::load_from(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::CheckBracket {
            config,
            side,
            entry,
            stop_loss,
            take_profit,
            support,
            resistance,
        } => {
            let config = ConfigLoader::load_from(&config)?;
            let proposed = stop_loss.zip(take_profit);
            let report = bracket_report(
                side.into(),
                entry,
                proposed,
                support,
                resistance,
                &config.protection,
            );
            println!("{report}");
        }
    }

    Ok(())
}

fn bracket_report(
    side: Side,
    entry: Decimal,
    proposed: Option<(Decimal, Decimal)>,
    support: Option<Decimal>,
    resistance: Option<Decimal>,
    config: &ProtectionConfig,
) -> String {
    let structure = (support.is_some() || resistance.is_some())
        .then(|| MarketStructure::new(Instrument::new("CHECK"), entry, support, resistance));
    match resolve_levels(side, entry, proposed, structure.as_ref(), config) {
        Ok(levels) => format!(
            "ACCEPTED {side} entry={entry} stop_loss={} take_profit={} reward_risk={:.2} source={:?}",
            levels.stop_loss, levels.take_profit, levels.reward_risk, levels.source
        ),
        Err(reason) => format!("REJECTED {side} entry={entry}: {reason}"),
    }
}
