use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::clock::{Clock, SystemClock};
use floodgate::config::FloodgateConfig;
use floodgate::diagnostics;
use floodgate::intercept::Interceptor;
use floodgate::keys::{CallIdentity, ClientInfo};
use floodgate::store;

/// Operator tooling for the Floodgate admission store.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML configuration file; `FLOODGATE__*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report subsystem state and live key counts
    Status,
    /// Run the configured rate limit for an operation, consuming a permit
    Check {
        /// Operation name, e.g. `OrderController.create`
        operation: String,
        #[arg(long)]
        principal: Option<String>,
        #[arg(long)]
        ip: Option<IpAddr>,
    },
    /// Try to take a duplicate-submission lock
    Lock {
        key: String,
        #[arg(long, default_value_t = 5)]
        secs: u64,
    },
    /// Drop a duplicate-submission lock
    Release { key: String },
    /// Delete the rate limit state behind a key
    Clear { key: String },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = match &cli.config {
        Some(path) => FloodgateConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FloodgateConfig::default(),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        "Floodgate configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = store::connect(&config.store, clock.clone())
        .await
        .context("connecting to admission store")?;
    let interceptor = Interceptor::new(&config, store.clone(), clock);

    match cli.command {
        Command::Status => {
            print_json(&diagnostics::status(&config, store.as_ref()).await)?;
        }
        Command::Check { operation, principal, ip } => {
            let mut call = CallIdentity::from_operation(&operation)
                .with_context(|| format!("'{}' is not of the form Declaring.method", operation))?;
            if let Some(principal) = principal {
                call = call.with_principal(principal);
            }
            if let Some(ip) = ip {
                call = call.with_client(ClientInfo::default().with_peer(ip));
            }

            let policies = interceptor.policies();
            let policy = policies
                .rate_limit(&operation)
                .with_context(|| format!("no rate limit configured for '{}'", operation))?;
            match interceptor.check_rate_limit(&call, policy).await {
                Ok(result) => print_json(&result)?,
                Err(e) if e.is_denied() => {
                    print_json(&serde_json::json!({
                        "allowed": false,
                        "message": e.to_string(),
                        "retry_after": e.retry_after(),
                    }))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Lock { key, secs } => {
            let acquired = interceptor.guard().check_and_lock(&key, secs).await?;
            print_json(&serde_json::json!({ "key": key, "acquired": acquired }))?;
        }
        Command::Release { key } => {
            interceptor.guard().release(&key).await;
            info!(key = %key, "Lock released");
        }
        Command::Clear { key } => {
            interceptor.limiter().clear(&key).await?;
            info!(key = %key, "Rate limit state cleared");
        }
    }

    Ok(())
}
