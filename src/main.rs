//! Provision Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use provision_mock_server::{AdminServer, MockServerEngine, ProcessConfig, TrafficServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "provision-mock-server",
    about = "Stateful HTTP mock server - provisioned responses, state flows and event history",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Admin plane listen address, overrides the configuration file
    #[arg(long, value_name = "ADDR")]
    admin_listen: Option<SocketAddr>,

    /// Traffic plane listen address, overrides the configuration file
    #[arg(long, value_name = "ADDR")]
    traffic_listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ProcessConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no provisions)");
        ProcessConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} provisions defined)",
            config.provisions.len()
        );
        return Ok(());
    }

    if let Some(addr) = args.admin_listen {
        config.admin.listen = addr;
    }
    if let Some(addr) = args.traffic_listen {
        config.traffic.listen = addr;
    }

    let engine = Arc::new(MockServerEngine::from_config(&config)?);

    let admin = AdminServer::new(config.admin.listen, &config.admin.api_path, engine.clone());
    let traffic = TrafficServer::new(
        config.traffic.listen,
        config.traffic.api_path.as_deref(),
        engine.clone(),
    );

    tokio::select! {
        result = admin.run() => result?,
        result = traffic.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(
                requests = engine.total_requests(),
                provisioned = engine.total_provisioned(),
                unprovisioned = engine.total_unprovisioned(),
                "Shutting down"
            );
        }
    }

    Ok(())
}
