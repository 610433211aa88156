use breakoutbot::clock::SystemClock;
use breakoutbot::config::{BotConfig, Credentials};
use breakoutbot::models::Timeframe;
use breakoutbot::venue::{IndexerClient, VenueClient};
use breakoutbot::Bot;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_VENUE_UNREACHABLE: u8 = 2;
const EXIT_CIRCUIT_BROKEN: u8 = 3;

#[derive(Parser)]
#[command(
    name = "breakoutbot",
    about = "Breakout trading daemon for dYdX v4 perpetuals (testnet)"
)]
struct Cli {
    /// Data directory for trades.jsonl, performance.json and credentials.
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop.
    Start(StartArgs),
    /// Print the account snapshot and any persisted open position.
    Status,
    /// Capture venue credentials interactively.
    Setup,
}

#[derive(Args)]
struct StartArgs {
    /// Market to trade, e.g. ETH-USD.
    #[arg(long)]
    instrument: Option<String>,

    /// Candle timeframe: 1m, 5m, 15m, 30m, 1h, 4h or 1d.
    #[arg(long)]
    timeframe: Option<Timeframe>,

    /// Volume factor for breakout confirmation.
    #[arg(long)]
    volume_factor: Option<f64>,

    /// Closed-candle lookback for the resistance level.
    #[arg(long)]
    resistance_periods: Option<usize>,

    /// Take-profit distance as a multiple of the stop distance.
    #[arg(long)]
    risk_reward: Option<f64>,

    /// Notional per entry in USD.
    #[arg(long)]
    position_size: Option<f64>,

    /// Control-loop period in seconds.
    #[arg(long)]
    update_interval: Option<u64>,

    /// Synthesise fills locally instead of submitting orders (default).
    #[arg(long, conflicts_with = "live")]
    simulation: bool,

    /// Submit real orders to the venue.
    #[arg(long)]
    live: bool,

    /// Keep an open position across restarts instead of closing it on
    /// shutdown.
    #[arg(long)]
    persist_position: bool,
}

impl StartArgs {
    fn apply(self, config: &mut BotConfig) {
        if let Some(instrument) = self.instrument {
            config.instrument = instrument;
        }
        if let Some(timeframe) = self.timeframe {
            config.timeframe = timeframe;
        }
        if let Some(volume_factor) = self.volume_factor {
            config.volume_factor = volume_factor;
        }
        if let Some(resistance_periods) = self.resistance_periods {
            config.resistance_periods = resistance_periods;
        }
        if let Some(risk_reward) = self.risk_reward {
            config.risk_reward_ratio = risk_reward;
        }
        if let Some(position_size) = self.position_size {
            config.position_size_usd = position_size;
        }
        if let Some(update_interval) = self.update_interval {
            config.update_interval_s = update_interval;
        }
        if self.live {
            config.simulation_mode = false;
        }
        if self.simulation {
            config.simulation_mode = true;
        }
        if self.persist_position {
            config.persist_position_on_shutdown = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "breakoutbot=info,breakoutbot::strategy=debug".to_string()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => start(cli.data_dir, args).await,
        Command::Status => status(cli.data_dir).await,
        Command::Setup => setup(cli.data_dir),
    }
}

async fn start(data_dir: PathBuf, args: StartArgs) -> ExitCode {
    let mut config = BotConfig::default();
    config.data_dir = data_dir.clone();
    args.apply(&mut config);

    if let Err(err) = config.validate() {
        tracing::error!(%err, "invalid configuration");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let credentials = Credentials::load(&data_dir);
    if credentials.is_none() {
        tracing::warn!("no credentials configured; account queries will fail (run `setup`)");
    }
    let venue: Arc<dyn VenueClient> = Arc::new(IndexerClient::new(credentials));

    let mut bot = match Bot::new(config, venue, Arc::new(SystemClock)) {
        Ok(bot) => bot,
        Err(err) => {
            tracing::error!(%err, "failed to initialise bot");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if bot.startup_breaker_tripped() {
        tracing::error!(
            daily_pnl = bot.daily_pnl(),
            "circuit breaker already tripped by replayed same-day trades"
        );
        return ExitCode::from(EXIT_CIRCUIT_BROKEN);
    }

    if let Err(err) = bot.connect().await {
        tracing::error!(%err, "venue connectivity failed to initialise");
        return ExitCode::from(EXIT_VENUE_UNREACHABLE);
    }

    match bot.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "bot terminated abnormally");
            ExitCode::FAILURE
        }
    }
}

async fn status(data_dir: PathBuf) -> ExitCode {
    let Some(credentials) = Credentials::load(&data_dir) else {
        eprintln!("No credentials configured; run `breakoutbot setup` first.");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    };

    let venue = IndexerClient::new(Some(credentials));
    match venue.get_account().await {
        Ok(account) => {
            println!("Equity:          ${:.2}", account.equity_usd);
            println!("Free collateral: ${:.2}", account.free_collateral_usd);
        }
        Err(err) => {
            eprintln!("Failed to fetch account: {err:#}");
            return ExitCode::from(EXIT_VENUE_UNREACHABLE);
        }
    }

    match breakoutbot::persistence::TradeStore::open(&data_dir) {
        Ok(store) => {
            match store.load_open_position() {
                Some(position) => {
                    println!(
                        "Open position:   {} {:?} {:.4} @ {:.2} (stop {:.2}, target {:.2})",
                        position.instrument,
                        position.side,
                        position.size_base,
                        position.entry_price,
                        position.stop_loss,
                        position.take_profit
                    );
                }
                None => println!("Open position:   none"),
            }
            let metrics = store.metrics();
            println!(
                "Recorded trades: {} (total PnL ${:.2})",
                metrics.total_trades, metrics.total_pnl
            );
        }
        Err(err) => {
            eprintln!("Failed to open trade store: {err:#}");
        }
    }

    ExitCode::SUCCESS
}

fn setup(data_dir: PathBuf) -> ExitCode {
    println!("dYdX v4 testnet indexer credentials");

    let address = match prompt("Address (dydx1...): ") {
        Ok(value) if !value.is_empty() => value,
        Ok(_) => {
            eprintln!("Address must not be empty.");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        Err(err) => {
            eprintln!("Failed to read input: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let subaccount = match prompt("Subaccount number [0]: ") {
        Ok(value) if value.is_empty() => 0,
        Ok(value) => match value.parse() {
            Ok(n) => n,
            Err(_) => {
                eprintln!("Subaccount must be a number.");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        },
        Err(err) => {
            eprintln!("Failed to read input: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let credentials = Credentials {
        address,
        subaccount,
    };
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        eprintln!("Failed to create {}: {err}", data_dir.display());
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }
    match credentials.save(&data_dir) {
        Ok(()) => {
            println!(
                "Saved credentials to {}",
                Credentials::file_path(&data_dir).display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Failed to save credentials: {err:#}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn prompt(label: &str) -> std::io::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
