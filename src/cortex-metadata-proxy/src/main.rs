//! Metadata proxy binary.

use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cortex_metadata_proxy::{PathMatching, ProxyConfig, run_with_shutdown};

/// Filtering proxy for the instance metadata server
#[derive(Parser)]
#[command(name = "cortex-metadata-proxy")]
#[command(about = "Conceal node secrets from workloads by filtering metadata server requests")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Address at which to listen and proxy
    #[arg(long)]
    addr: Option<String>,

    /// Address at which to publish metrics
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Metadata server URL
    #[arg(long)]
    upstream: Option<String>,

    /// Maximum number of concurrently served connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Path matching policy: case-sensitive or case-insensitive
    #[arg(long)]
    path_matching: Option<PathMatching>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    /// Apply command-line overrides on top of file and environment values.
    fn apply(self, mut config: ProxyConfig) -> ProxyConfig {
        if let Some(addr) = self.addr {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
        if let Some(upstream) = self.upstream {
            config.upstream_url = upstream;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(matching) = self.path_matching {
            config.path_matching = matching;
        }
        config
    }
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<ProxyConfig> {
    let config = match path {
        Some(path) => ProxyConfig::load(path)
            .map_err(|e| anyhow::anyhow!("failed to load config from {}: {}", path, e))?,
        None => ProxyConfig::default(),
    };
    Ok(config.apply_env()?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => args.apply(config),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        listen_addr = %config.listen_addr,
        metrics_addr = config.metrics_addr.as_deref().unwrap_or("disabled"),
        upstream = %config.upstream_url,
        path_matching = %config.path_matching,
        "Starting metadata proxy"
    );
    info!("Press Ctrl+C to stop");

    if let Err(e) = run_with_shutdown(config, shutdown_signal()).await {
        error!("Metadata proxy error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Metadata proxy stopped");
    ExitCode::SUCCESS
}
