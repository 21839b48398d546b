use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_ns::bus::{Bus, MemoryBus};
use lora_ns::config::Config;
use lora_ns::gateway::tracker::TimestampTracker;
use lora_ns::gateway::GatewayBridge;
use lora_ns::region::Cn470Region;
use lora_ns::storage::{MemoryStore, Store};
use lora_ns::uplink::rxcache::DeviceRxCache;
use lora_ns::uplink::UplinkPipeline;

#[derive(Parser)]
#[command(name = "lora-ns")]
#[command(about = "CN470 LoRaWAN network server core")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing file at the default path yields a development
    // configuration; a file that exists but fails to load is fatal.
    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: config file {:?} not found, using default configuration",
            cli.config
        );
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    info!("lora-ns v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let region = Arc::new(Cn470Region::from_config(&config.cn470)?);
    info!(
        "CN470 {} (configured {}), RX2 {:.1} MHz DR{}",
        region.mode,
        config.cn470.mode,
        region.rx2_frequency as f64 / 1e6,
        region.rx2_data_rate
    );

    // The relational store and broker are external collaborators; the
    // core runs against its in-process implementations until an adapter
    // is attached.
    let store: Arc<dyn Store> = MemoryStore::new();
    let bus: Arc<dyn Bus> = MemoryBus::new();
    warn!(
        "running with in-process store and bus (configured: {} / {})",
        config.database.dsn, config.nats.url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = Arc::new(config);

    let pipeline = UplinkPipeline::new(
        config.clone(),
        region,
        store.clone(),
        bus.clone(),
        TimestampTracker::new(),
        DeviceRxCache::new(),
    )?;
    pipeline.start(shutdown_rx.clone()).await;

    let bridge =
        GatewayBridge::start(&config.gateway.udp_bind, bus.clone(), store.clone(), shutdown_rx)
            .await?;
    info!("network server running, gateway endpoint {}", bridge.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    // Give in-flight handlers a moment to finish.
    tokio::time::sleep(Duration::from_millis(250)).await;
    Ok(())
}
