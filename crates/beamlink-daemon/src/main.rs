//! Beamlink Daemon - Main entry point
//!
//! Runs discovery against the device backend and serves the registry API.

use anyhow::Result;
use beamlink_control::{Connector, WsConnector};
use beamlink_daemon::collab::{ConfigSettings, ConsolePrompt, LogNotifier};
use beamlink_daemon::master::Collaborators;
use beamlink_daemon::{config, server, state};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "beamlink")]
#[command(about = "Laser cutter discovery and control daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "beamlink.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the devices found in one discovery window and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Beamlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        backend = %format!("{}:{}", config.backend.host, config.backend.port),
        poke_ips = config.discovery.poke_ips.len(),
        "Configuration loaded"
    );

    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(&config.backend.host, config.backend.port));
    let collab = Collaborators {
        prompt: Arc::new(ConsolePrompt),
        notifier: Arc::new(LogNotifier),
        settings: Arc::new(ConfigSettings::new(&config)),
    };
    let state = state::AppState::new(config.clone(), connector.clone(), collab).await;

    let cancel = CancellationToken::new();
    let discovery = {
        let feed = state.feed.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { feed.run(connector.as_ref(), &cancel).await })
    };

    if args.scan_once {
        info!("Running a single discovery window");
        tokio::time::sleep(config.feed_config().redeliver).await;
        let devices = state.feed.snapshot().await;
        println!("Discovered {} devices:", devices.len());
        for device in devices {
            println!("  - {} ({}) at {}", device.name, device.uuid, device.ipaddr);
            println!("    Model: {}  Firmware: {}", device.model, device.firmware_version);
            if let Some(label) = &device.st_label {
                println!("    Status: {} ({})", label, device.st_id);
            }
        }
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    cancel.cancel();
    let _ = discovery.await;
    Ok(())
}
