//! QuorumKV Server Binary
//!
//! Runs one cluster member: the Raft node plus the client service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quorumkv::config::{parse_peers, SnapshotPolicy, WalSyncStrategy};
use quorumkv::network::Server;
use quorumkv::{Config, Replica};
use tracing_subscriber::{fmt, EnvFilter};

/// QuorumKV Server
#[derive(Parser, Debug)]
#[command(name = "quorumkv-server")]
#[command(about = "Replicated key-value store on Raft")]
#[command(version)]
struct Args {
    /// Node id (1-based position in --cluster)
    #[arg(long, default_value = "1")]
    id: u64,

    /// Comma-separated raft addresses of all members
    #[arg(long, default_value = "127.0.0.1:12379")]
    cluster: String,

    /// Join an existing cluster
    #[arg(long)]
    join: bool,

    /// Data directory
    #[arg(short, long, default_value = "./quorumkv_data")]
    data_dir: PathBuf,

    /// Client listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    listen: String,

    /// Maximum concurrent client connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Logical tick length in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Applied entries between snapshots
    #[arg(long, default_value = "10000")]
    snapshot_count: u64,

    /// fsync log entries every N records (0 = every write)
    #[arg(long, default_value = "0")]
    wal_sync_every: usize,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,quorumkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("QuorumKV Server v{}", quorumkv::VERSION);
    tracing::info!("Node id: {}", args.id);
    tracing::info!("Data directory: {}", args.data_dir.display());
    tracing::info!("Listen address: {}", args.listen);

    let config = Config::builder()
        .node_id(args.id)
        .peers(parse_peers(&args.cluster))
        .join(args.join)
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .tick_interval(Duration::from_millis(args.tick_ms))
        .wal_sync_strategy(match args.wal_sync_every {
            0 => WalSyncStrategy::EveryWrite,
            count => WalSyncStrategy::EveryNEntries { count },
        })
        .snapshot_policy(SnapshotPolicy {
            snapshot_count: args.snapshot_count,
            ..SnapshotPolicy::default()
        })
        .build();

    let replica = match Replica::start_tcp(config.clone()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Node {} started", replica.id());

    // A fatal control-loop error takes the process down
    let errors = replica.errors();
    std::thread::spawn(move || {
        if let Ok(e) = errors.recv() {
            tracing::error!("Raft node failed: {}", e);
            std::process::exit(1);
        }
    });

    let server = match Server::bind(&config, Arc::clone(&replica)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to bind client service: {}", e);
            std::process::exit(1);
        }
    };

    // SIGINT, SIGTERM and SIGHUP stop the client service, then the node
    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal, stopping...");
        shutdown.shutdown();
    }) {
        tracing::warn!("Failed to install signal handler: {}", e);
    }

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
    }

    if let Err(e) = replica.shutdown() {
        tracing::warn!("Shutdown error: {}", e);
    }
    tracing::info!("Server stopped");
}
