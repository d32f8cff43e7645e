//! PhoneHome bridge daemon.
//!
//! Listens for VM boot callbacks and serves remote waits until stopped, or
//! answers a single callback and exits.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use phonehome_bridge::PhoneHomeBridge;
use phonehome_bridge::events::EVENT_LOG_TARGET;
use phonehome_common::config::parse_duration;
use phonehome_common::{BridgeConfig, EnvParser, ServeMode};

#[derive(Parser)]
#[command(name = "phonehomed")]
#[command(author, version, about = "PhoneHome bridge - routes VM boot callbacks to waiting tests")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Callback endpoint URL advertised to VMs; its port is the listen port
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Port to listen on when no endpoint is configured
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Serve mode: forever or single_shot
    #[arg(long)]
    mode: Option<ServeMode>,

    /// Shorthand for --mode single_shot
    #[arg(long, conflicts_with = "mode")]
    once: bool,

    /// Default and maximum wait for remote waiters (e.g. "175s", "3m")
    #[arg(long, value_parser = parse_duration)]
    wait_timeout: Option<Duration>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Defaults, then the config file, then `PHONEHOME_*`, then flags.
fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(cli.config.as_deref())
        .with_context(|| match &cli.config {
            Some(path) => format!("failed to load {}", path.display()),
            None => "failed to load configuration".to_string(),
        })?;
    config
        .apply_env(&mut EnvParser::new())
        .context("invalid PHONEHOME_* environment")?;

    if let Some(endpoint) = &cli.endpoint {
        config.callback_endpoint = Some(endpoint.clone());
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if cli.once {
        config.mode = ServeMode::SingleShot;
    }
    if let Some(timeout) = cli.wait_timeout {
        config.wait_timeout = timeout;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = load_config(&cli)?;
    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mode = config.mode;
    let mut bridge = PhoneHomeBridge::new(config)?;
    if tracing::enabled!(target: EVENT_LOG_TARGET, Level::DEBUG) {
        bridge.bus().events().spawn_log_forwarder();
    }
    let addr = bridge.start().await?;
    info!("Waiting for phone-home callbacks on {}", addr);

    if mode == ServeMode::Forever {
        let stop = bridge.stop_handle();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received; shutting down");
                    stop.stop();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    bridge.join().await?;
    info!("PhoneHome bridge exited");
    Ok(())
}
