//! Teak CLI - operator tool for the Teak SDK core
//!
//! Provides a `teak` command that computes request signatures and inspects or
//! replays the persistent request cache.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use teak_core::request::DEFAULT_HOSTNAME;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{CacheCommand, cache, config, sign};

/// Teak CLI - inspect and exercise the Teak SDK core
#[derive(Parser, Debug)]
#[command(name = "teak", author, version, about = "Teak SDK core operator tool")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (defaults to ./teak.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the signature header for a request
    Sign {
        /// API key used as the signing secret
        #[arg(long)]
        secret: String,

        /// Endpoint path, e.g. /games/1234/users.json
        #[arg(long)]
        endpoint: String,

        /// Host the request is sent to
        #[arg(long, default_value = DEFAULT_HOSTNAME)]
        host: String,

        /// HTTP method
        #[arg(long, default_value = "POST")]
        method: String,

        /// Request body exactly as sent
        #[arg(long, default_value = "{}")]
        body: String,

        /// Also print the canonical string that was signed
        #[arg(long)]
        canonical: bool,
    },

    /// Inspect or replay the persistent request cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let sdk_config = config::load(args.config.as_deref())?;

    match args.command {
        Command::Sign { secret, endpoint, host, method, body, canonical } => {
            sign::execute(&sdk_config, &sign::SignRequest { secret, endpoint, host, method, body }, canonical)
        }
        Command::Cache(command) => cache::execute(command, &sdk_config).await,
        Command::Config => config::show(&sdk_config),
    }
}
