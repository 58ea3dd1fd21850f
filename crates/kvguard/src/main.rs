use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kvguard::config::{Config, TransportKind};
use kvguard::transport::{LoopbackServer, LoopbackTransport};
use kvguard::KvGuard;
use kvguard_core::connection::Transport;
use kvguard_core::health::OverallStatus;
use kvguard_core::StoreConfig;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// kvguard - Cache, sessions and pub/sub that survive Redis outages
#[derive(Parser, Debug)]
#[command(name = "kvguard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Redis host
    #[arg(long, short = 'H', env = "REDIS_HOST")]
    host: Option<String>,

    /// Redis port
    #[arg(long, short, env = "REDIS_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the substrate until Ctrl+C or SIGTERM (default)
    Serve,
    /// Run the health checks once and print the report as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing();

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.redis_host = host;
    }
    if let Some(port) = cli.port {
        config.redis_port = port;
    }
    let transport_kind = config.transport;
    let store_config = config.into_store_config();
    let transport = build_transport(transport_kind, &store_config)?;

    tracing::info!(
        host = %store_config.connection.host,
        port = store_config.connection.port,
        transport = ?transport_kind,
        "Starting kvguard"
    );
    let guard = KvGuard::start(store_config, transport).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            shutdown_signal().await;
            guard.shutdown().await;
        }
        Commands::Status => {
            let report = guard.status().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            guard.shutdown().await;
            if report.status == OverallStatus::Unhealthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Installs the tracing subscriber. `KVGUARD_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kvguard=info".into());
    let json = std::env::var("KVGUARD_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn build_transport(kind: TransportKind, config: &StoreConfig) -> Result<Arc<dyn Transport>> {
    match kind {
        TransportKind::Loopback => Ok(Arc::new(LoopbackTransport::new(LoopbackServer::new()))),
        #[cfg(feature = "redis")]
        TransportKind::Redis => {
            let url = config.connection.redis_url();
            Ok(Arc::new(kvguard::transport::RedisTransport::new(&url)?))
        }
        #[cfg(not(feature = "redis"))]
        TransportKind::Redis => {
            let _ = config;
            anyhow::bail!("kvguard was built without the `redis` feature")
        }
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
