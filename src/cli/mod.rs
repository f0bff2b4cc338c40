//! Command-line interface and daemon wiring
//!
//! `start` assembles the whole pipeline: store, plugin and handler
//! registries (built once, passed by Arc, no globals), clipboard
//! monitor, task executor, discovery and the sync server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::clipboard;
use crate::collect::Collector;
use crate::config::Config;
use crate::discovery::{DiscoveredPeer, Discovery, MdnsDiscovery};
use crate::monitor::ClipboardMonitor;
use crate::net::{ws, WsTransport};
use crate::pairing::{DeviceKeys, PairingManager};
use crate::peers::PeerRegistry;
use crate::plugins::PluginRegistry;
use crate::postprocess::PostProcessChain;
use crate::render::NoopRenderer;
use crate::store::SqliteStore;
use crate::sync::SyncManager;
use crate::tasks::{TaskContext, TaskExecutor, TaskHandlers, TaskKind};

#[derive(Parser)]
#[command(name = "pastebeam", version, about = "Clipboard capture and peer replication service")]
pub struct Cli {
    /// Config file path (defaults to the platform config dir).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the capture/sync daemon.
    Start,

    /// Pair with a peer that is displaying a token.
    Pair {
        /// Peer endpoint, host:port.
        #[arg(long)]
        endpoint: String,

        /// The 6-digit token shown on the peer.
        #[arg(long)]
        token: u32,
    },

    /// List known peers and their trust state.
    Peers,

    /// Show instance status.
    Status,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load_or_init(&config_path)
        .await
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    init_logging(&config.log_level);

    match cli.command {
        Command::Start => start_daemon(config).await,
        Command::Pair { endpoint, token } => pair(config, &endpoint, token).await,
        Command::Peers => list_peers(config).await,
        Command::Status => status(config).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn start_daemon(config: Config) -> Result<()> {
    let device_id = config.device.id;
    info!(device = %device_id, name = %config.device.name, version = crate::VERSION, "starting pastebeam");

    let store = Arc::new(SqliteStore::open(&config.storage.db_path).await?);
    let keys = Arc::new(DeviceKeys::load_or_generate(&config.storage.keys_path).await?);
    let registry = Arc::new(PeerRegistry::load(config.storage.peers_path.clone()).await?);

    let collector = Arc::new(Collector::new(
        device_id,
        store.clone(),
        store.clone(),
        Arc::new(PluginRegistry::stock()),
        Arc::new(PostProcessChain::stock()),
        config.storage.data_dir.clone(),
        config.capture.dedup_window,
    ));

    let pairing = Arc::new(PairingManager::new(
        Arc::clone(&keys),
        device_id,
        config.device.name.clone(),
        Arc::clone(&registry),
    ));

    let transport = Arc::new(WsTransport::new());
    let sync = Arc::new(SyncManager::new(
        device_id,
        Arc::clone(&registry),
        store.clone(),
        store.clone(),
        transport,
        Arc::clone(&collector),
        Arc::clone(&pairing),
        config.sync.fanout_limit,
        config.storage.data_dir.clone(),
    ));

    let ctx = Arc::new(TaskContext {
        store: store.clone(),
        tasks: store.clone(),
        renderer: Arc::new(NoopRenderer),
        peer_client: sync.clone(),
        data_dir: config.storage.data_dir.clone(),
        task_retention: config.task_retention(),
        tombstone_retention: config.tombstone_retention(),
    });
    let executor = Arc::new(TaskExecutor::new(
        Arc::clone(&ctx),
        Arc::new(TaskHandlers::stock()),
        config.tasks.pool_size,
    ));

    let port: Arc<dyn clipboard::ClipboardPort> = Arc::from(clipboard::select_port()?);
    let monitor = Arc::new(ClipboardMonitor::new(
        port,
        Arc::clone(&collector),
        config.poll_interval(),
        config.capture.excluded_apps.clone(),
        config.capture.capture_at_launch,
    ));

    let executor_handle = tokio::spawn(Arc::clone(&executor).run());
    let monitor_handle = tokio::spawn(Arc::clone(&monitor).run());

    let mut sync_server = None;
    let mut sync_handle = None;
    if config.sync.enabled {
        let (addr, server) = ws::serve(&config.sync.listen_addr, device_id, sync.clone()).await?;
        info!(%addr, "sync server listening");
        sync_server = Some(server);

        // Seed statically configured peers, then live discovery.
        for peer in &config.sync.static_peers {
            registry
                .observe_discovered(&DiscoveredPeer {
                    device_id: peer.device_id,
                    name: peer.name.clone(),
                    endpoint: peer.endpoint.clone(),
                    metadata: Default::default(),
                })
                .await;
        }

        let discovery_rx = match MdnsDiscovery::new(device_id, config.device.name.clone()) {
            Ok(discovery) => {
                let endpoint = format!("{}:{}", "0.0.0.0", addr.port());
                if let Err(e) = discovery.publish(&endpoint, Default::default()).await {
                    warn!("failed to publish mdns service: {e}");
                }
                match discovery.subscribe().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!("mdns browse unavailable: {e}");
                        let (_tx, rx) = tokio::sync::mpsc::channel(1);
                        rx
                    }
                }
            }
            Err(e) => {
                warn!("mdns unavailable, static peers only: {e}");
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                rx
            }
        };

        let events = collector.subscribe();
        sync_handle = Some(tokio::spawn(
            Arc::clone(&sync).run(events, discovery_rx),
        ));

        let token = pairing.display_token().await;
        info!("pairing token: {token}");
    }

    // Periodic queue hygiene; re-enqueued by each run's completion via
    // the scheduler below.
    let tasks = ctx.tasks.clone();
    if let Err(e) = tasks
        .enqueue(TaskKind::CleanupOrphans, None, serde_json::json!({}))
        .await
    {
        warn!("failed to enqueue cleanup task: {e}");
    }
    let cleanup_tasks = ctx.tasks.clone();
    let cleanup_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = cleanup_tasks
                .enqueue(TaskKind::CleanupOrphans, None, serde_json::json!({}))
                .await
            {
                warn!("failed to enqueue cleanup task: {e}");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    monitor.stop();
    executor.stop();
    sync.stop();
    cleanup_handle.abort();
    if let Some(server) = sync_server {
        server.abort();
    }
    if let Some(handle) = sync_handle {
        let _ = handle.await;
    }
    let _ = monitor_handle.await;
    let _ = executor_handle.await;
    Ok(())
}

async fn pair(config: Config, endpoint: &str, token: u32) -> Result<()> {
    let keys = Arc::new(DeviceKeys::load_or_generate(&config.storage.keys_path).await?);
    let registry = Arc::new(PeerRegistry::load(config.storage.peers_path.clone()).await?);
    let pairing = PairingManager::new(
        keys,
        config.device.id,
        config.device.name.clone(),
        registry,
    );

    let transport = WsTransport::new();
    let peer = pairing
        .request_pairing(&transport, endpoint, token, None)
        .await?;
    println!("Paired with {peer} at {endpoint}");
    Ok(())
}

async fn list_peers(config: Config) -> Result<()> {
    let registry = PeerRegistry::load(config.storage.peers_path.clone()).await?;
    let peers = registry.all().await;
    if peers.is_empty() {
        println!("No known peers.");
        return Ok(());
    }
    for peer in peers {
        println!(
            "{}  {:?}  {}  {}",
            peer.id,
            peer.trust,
            peer.name,
            peer.endpoint.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    println!("pastebeam {}", crate::VERSION);
    println!("device:   {} ({})", config.device.id, config.device.name);
    println!("database: {}", config.storage.db_path.display());
    println!("data dir: {}", config.storage.data_dir.display());
    println!(
        "sync:     {} on {}",
        if config.sync.enabled { "enabled" } else { "disabled" },
        config.sync.listen_addr
    );
    Ok(())
}
