use std::path::PathBuf;

use clap::Parser;
use tokio::io::{self, AsyncBufRead, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{RateLimiter, RuleSet};
use turnstile::replay::{process_until, OutputFormat};

/// Stream `<client> <timestamp>` requests through a sliding-window admission controller.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); environment overrides use `TURNSTILE__`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rules file, replacing the rules from the configuration
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Request file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output format for decisions
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }
    init_tracing(&config.logging);

    info!("Starting Turnstile admission controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = match &cli.rules {
        Some(path) => {
            RateLimiter::with_eviction(RuleSet::from_file(path)?, config.limiter.eviction.policy()?)
        }
        None => RateLimiter::from_config(&config.limiter)?,
    };
    if limiter.rules().is_empty() {
        warn!("No rate limit rules configured, every request will be admitted");
    }

    match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            run(&limiter, BufReader::new(file), cli.format).await?;
        }
        None => run(&limiter, BufReader::new(io::stdin()), cli.format).await?,
    }

    let stats = limiter.stats().snapshot();
    info!(
        admitted = stats.admitted,
        rejected_over_limit = stats.rejected_over_limit,
        rejected_cooldown = stats.rejected_cooldown,
        rejected_out_of_order = stats.rejected_out_of_order,
        clients = limiter.client_count(),
        "Turnstile stopped"
    );
    Ok(())
}

/// Logs go to stderr so stdout carries only decisions.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Process the request stream until it ends or a shutdown signal arrives.
async fn run<R>(limiter: &RateLimiter, reader: R, format: OutputFormat) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut stdout = io::stdout();

    match process_until(limiter, reader, &mut stdout, format, shutdown_signal()).await? {
        Some(summary) => info!(
            admitted = summary.admitted,
            rejected = summary.rejected,
            malformed = summary.malformed,
            "Request stream complete"
        ),
        None => info!("Stopping before end of input"),
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping request stream");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping request stream");
        }
    }
}
