use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use specboard_sync::config::{ServerConfig, StoreConfig, WatcherConfig};
use specboard_sync::storage::{ConflictStore, FsDocumentStore, MemoryConflictStore, RocksStore};
use specboard_sync::watcher::PollingWatcher;
use specboard_sync::{SyncError, SyncServer};

/// Change-notification server for spec project documents.
#[derive(Debug, Parser)]
#[command(name = "specboard-server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4455")]
    bind: String,

    /// Directory holding `<project>/<document>` files
    #[arg(long, default_value = "projects")]
    data_dir: PathBuf,

    /// RocksDB directory for conflicts and warnings (in memory when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds between heartbeats on every event stream
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Milliseconds between polls of watched projects
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Shared secret clients must present
    #[arg(long, env = "SPECBOARD_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting specboard server...");

    let documents = Arc::new(FsDocumentStore::new(&args.data_dir));
    let conflicts: Arc<dyn ConflictStore> = match &args.db {
        Some(path) => Arc::new(RocksStore::open(StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })?),
        None => {
            log::warn!("No --db given; conflicts are kept in memory only");
            Arc::new(MemoryConflictStore::new())
        }
    };
    let watcher = PollingWatcher::new(
        documents.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(args.poll_ms.max(1)),
        },
    );

    let config = ServerConfig {
        bind_addr: args.bind,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        token: args.token,
        ..ServerConfig::default()
    };
    info!("Serving documents from {}", args.data_dir.display());

    let server = SyncServer::new(config, documents, conflicts, Arc::new(watcher));
    server.run().await
}
