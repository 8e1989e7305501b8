use anyhow::{Context, Result};
use clap::Parser;
use flowd::{config::Config, service};
use log::{info, warn};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "flowd",
    version,
    about = "Flow and packet marking daemon - reports experiment/activity of network flows",
    long_about = "flowd\n\n\
        Watches TCP connections and reports their lifecycle with:\n\
        - IPv6 flow labels set by a tc classifier\n\
        - UDP fireflies sent to the flow destination and collectors\n\
        - Per-flow Prometheus gauges\n\n\
        Examples:\n  \
          # Run with /etc/flowd/flowd.toml\n  \
          flowd --fg\n\n  \
          # Override the producer and backends\n  \
          flowd --config ./flowd.toml --source netlink --backend firefly --backend prometheus"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'd')]
    debug: bool,

    /// Stay attached to the terminal and log with timestamps
    #[arg(long)]
    fg: bool,

    /// Producer override (netstat, netlink, iperf, firefly, np-api)
    #[arg(long)]
    source: Option<String>,

    /// Backend override, repeatable (flow-label, firefly, prometheus)
    #[arg(long)]
    backend: Vec<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(source) = &args.source {
        config.source.kind = source.clone();
    }
    if !args.backend.is_empty() {
        config.backends.enabled = args.backend.clone();
    }
    Ok(config)
}

fn init_logging(args: &Args, config: &Config) {
    let level = if args.debug {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if !args.fg {
        // The service manager stamps each line
        builder.format_timestamp(None);
    }
    builder.init();
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("Failed to load configuration")?;

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(&args, &config);
    info!("Starting flowd v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Exiting...");
        signal_cancel.cancel();
    });

    service::run(config, cancel).await
}
