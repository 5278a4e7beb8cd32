//! tspid — TSPI channel and replay orchestration daemon
//!
//! Runs the whole engine in one process: UDP ingest, the broker hub, the
//! dedup archiver, the live channel fan-out, the channel manager with
//! discovery, and the operator roster.
//!
//! ## Usage
//!
//! ```bash
//! # Listen for TSPI datagrams on the default port
//! tspid
//!
//! # Custom ingest address
//! TSPI_UDP_ADDR=0.0.0.0:6000 tspid
//!
//! # Seed ten seconds of synthetic traffic on startup
//! TSPI_DEMO_TRAFFIC=1 tspid
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use tspi::generator::default_base_epoch;
use tspi::{
    drain_status, live_consumer_config, serve_discovery, Archiver, Broker, ChannelDirectory,
    ChannelManager, ClientRoster, Datastore, FlightConfig, FlightGenerator, MemoryDatastore,
    TspiProducer, UdpIngest,
};

/// Daemon configuration from environment
struct Config {
    udp_addr: SocketAddr,
    buffer_capacity: usize,
    private_expiry: Duration,
    roster_stale: Duration,
    demo_traffic: bool,
}

impl Config {
    fn from_env() -> Self {
        let udp_addr = std::env::var("TSPI_UDP_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| "0.0.0.0:5005".parse().expect("valid default address"));

        let buffer_capacity: usize = std::env::var("TSPI_BUFFER_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024);

        let private_expiry = Duration::from_secs(
            std::env::var("TSPI_PRIVATE_EXPIRY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        );

        let roster_stale = Duration::from_secs(
            std::env::var("TSPI_ROSTER_STALE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        );

        let demo_traffic = std::env::var("TSPI_DEMO_TRAFFIC")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            udp_addr,
            buffer_capacity,
            private_expiry,
            roster_stale,
            demo_traffic,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("tspid starting");
    info!("  UDP ingest: {}", config.udp_addr);
    info!("  Buffer capacity: {}", config.buffer_capacity);
    info!("  Private replay expiry: {:?}", config.private_expiry);

    let broker = Broker::new(config.buffer_capacity);
    let datastore = Arc::new(MemoryDatastore::new());
    let directory = Arc::new(ChannelDirectory::new());
    let roster = Arc::new(ClientRoster::new());
    let producer = Arc::new(TspiProducer::new(broker.clone()));
    let manager = ChannelManager::new(
        broker.clone(),
        directory.clone(),
        datastore.clone(),
        config.private_expiry,
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Archiver drains every ingest subject into the datastore
    let archiver = Arc::new(Archiver::new(datastore.clone(), broker.clone()));
    {
        let archiver = archiver.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = archiver.run(cancel).await {
                warn!("Archiver error: {}", e);
            }
        });
    }

    // Live channel fan-out
    let _live_fanout = broker.bind_consumer(live_consumer_config(), cancel.clone());

    // Roster aggregation from client heartbeats
    {
        let broker = broker.clone();
        let roster = roster.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            drain_status(&broker, &roster, cancel).await;
        });
    }

    // Channel discovery responder
    {
        let broker = broker.clone();
        let directory = directory.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = serve_discovery(&broker, &directory, cancel).await {
                warn!("Discovery responder error: {}", e);
            }
        });
    }

    // Periodic roster aging and private replay expiry
    {
        let roster = roster.clone();
        let manager = manager.clone();
        let stale = config.roster_stale;
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let mut tick = interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        roster.prune(chrono::Utc::now(), stale);
                        manager.prune_private_replays(&roster);
                    }
                }
            }
        });
    }

    // UDP ingest
    let ingest = Arc::new(UdpIngest::bind(config.udp_addr, producer.clone()).await?);
    {
        let ingest = ingest.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = ingest.run(cancel).await {
                warn!("UDP ingest error: {}", e);
            }
        });
    }

    if config.demo_traffic {
        info!("Seeding demo traffic");
        let mut generator = FlightGenerator::new(FlightConfig::default());
        let seeded = generator.stream_to_producer(&producer, 10.0, default_base_epoch())?;
        info!("Seeded {} demo records", seeded.len());
    }

    tracker.close();

    run_headless(broker, archiver, roster, manager, datastore, cancel, tracker).await
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tspi=info".parse().expect("valid directive")),
        )
        .init();
}

/// Headless mode: log stats periodically, shut down on SIGINT
async fn run_headless(
    broker: Broker,
    archiver: Arc<Archiver<MemoryDatastore>>,
    roster: Arc<ClientRoster>,
    manager: ChannelManager<MemoryDatastore>,
    datastore: Arc<MemoryDatastore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    info!("Waiting for telemetry...");
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => {
                let archived = datastore.count_records().await.unwrap_or(0);
                info!(
                    "Stats: {} published, {} suppressed, {} archived rows ({} dropped), {} clients, {} replays",
                    broker.published(), broker.suppressed(), archived, archiver.failed(),
                    roster.snapshot().len(), manager.active_replays()
                );
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}
