//! `ferryd`: the ferry file sync daemon.
//!
//! Runs the sync engine against an in-memory remote node and offers a few
//! diagnostics over the on-disk metadata store.
//!
//! # Usage
//!
//! ```text
//! ferryd start                                   # run until Ctrl-C
//! ferryd start -c ferry.toml                     # start with a config file
//! ferryd start --memory --limit 1048576          # throwaway run, 1 MiB quota
//! ferryd start --file a.jpg --file b.pdf --space photos
//! ferryd queue                                   # dump the file queue
//! ferryd usage                                   # show cached node usage
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferry_meta::{ItemStore, MetaStore, keys};
use ferry_node::{MemoryNode, RemoteNode};
use ferry_store::{BlockStore, DagBuilder, MemoryBlockStore};
use ferry_sync::{AddFileRequest, FileInfo, FileStatus, FileSync, ObserverError, QUEUE_NAME};
use ferry_types::events::{EventBus, FileLimitReached, FileLimitUpdated, FileSpaceUsage};
use ferry_types::{FullFileId, NodeUsage};
use tracing::{info, warn};

use config::DaemonConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ferryd", version, about = "Ferry file sync daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine until interrupted.
    Start {
        /// Override data directory.
        #[arg(short, long, env = "FERRY_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Keep the metadata store in a temporary directory.
        #[arg(short, long)]
        memory: bool,

        /// Account byte limit of the remote node.
        #[arg(short, long)]
        limit: Option<u64>,

        /// File to import and upload. Can be given multiple times.
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// Space the imported files belong to.
        #[arg(short, long)]
        space: Option<String>,
    },

    /// Show the file queue from the local metadata store.
    Queue,

    /// Show the cached node usage.
    Usage,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            memory,
            limit,
            file,
            space,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(limit) = limit {
                config.remote.limit_bytes = limit;
            }
            if let Some(space) = space {
                config.node.space_id = space;
            }
            cmd_start(config, memory, file).await
        }
        Commands::Queue => cmd_queue(&config),
        Commands::Usage => cmd_usage(&config),
    }
}

// -----------------------------------------------------------------------
// ferryd start
// -----------------------------------------------------------------------

async fn cmd_start(config: DaemonConfig, memory: bool, files: Vec<PathBuf>) -> Result<()> {
    info!(
        data_dir = %config.node.data_dir.display(),
        memory,
        limit = config.remote.limit_bytes,
        upload_workers = config.sync.upload_workers,
        "starting ferryd"
    );

    let meta = if memory {
        info!("using temporary metadata store");
        MetaStore::open_temporary().context("failed to create temporary metadata store")?
    } else {
        std::fs::create_dir_all(&config.node.data_dir).context("failed to create data directory")?;
        MetaStore::open(config.meta_path()).context("failed to open metadata store")?
    };

    let node = Arc::new(MemoryNode::new(config.remote.limit_bytes));
    let blocks = Arc::new(MemoryBlockStore::unbounded());
    let events = EventBus::new();
    let sync = FileSync::new(
        &meta,
        node.clone() as Arc<dyn RemoteNode>,
        blocks.clone() as Arc<dyn BlockStore>,
        events.clone(),
        config.file_sync(),
    )
    .context("failed to build file sync")?;

    sync.on_status_updated(Arc::new(
        |object_id: &str, file: &FullFileId, status: FileStatus| -> Result<(), ObserverError> {
            info!(object_id, file_id = %file.file_id, space_id = %file.space_id, ?status, "file status");
            Ok(())
        },
    ));
    let event_log = tokio::spawn(log_events(events));

    let builder = DagBuilder::new(config.remote.chunk_size);
    for path in &files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let dag = builder
            .import(blocks.as_ref(), &data)
            .await
            .context("failed to import file")?;
        let object_id = path.display().to_string();
        info!(%object_id, file_id = %dag.root, bytes = dag.total_size(), "imported file");

        sync.add_file(AddFileRequest {
            object_id,
            file: FullFileId::new(config.node.space_id.clone(), dag.root),
            variants: Vec::new(),
            added_by_user: true,
            imported: false,
        })
        .await
        .context("failed to queue file")?;
    }

    sync.start().await.context("failed to start file sync")?;
    info!("ferryd running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    sync.close().await;
    event_log.abort();

    let stats = node.stats();
    info!(
        blocks_added = stats.blocks_added,
        cids_bound = stats.cids_bound,
        files_deleted = stats.files_deleted,
        total_usage = node.total_usage(),
        "remote node totals"
    );
    Ok(())
}

/// Log user-facing events until the bus goes away.
async fn log_events(events: EventBus) {
    let mut usage = events.subscribe::<FileSpaceUsage>();
    let mut limit_updated = events.subscribe::<FileLimitUpdated>();
    let mut limit_reached = events.subscribe::<FileLimitReached>();
    drop(events);

    loop {
        tokio::select! {
            Some(e) = usage.recv() => info!(space_id = %e.space_id, bytes = e.bytes_usage, "space usage changed"),
            Some(e) = limit_updated.recv() => info!(bytes = e.bytes_limit, "account limit changed"),
            Some(e) = limit_reached.recv() => warn!(space_id = %e.space_id, "space limit reached"),
            else => break,
        }
    }
}

// -----------------------------------------------------------------------
// ferryd queue
// -----------------------------------------------------------------------

fn open_meta(config: &DaemonConfig) -> Result<MetaStore> {
    let path = config.meta_path();
    MetaStore::open(&path).map_err(|e| {
        anyhow::anyhow!(
            "cannot open metadata at {}. Is another ferryd running? ({e})",
            path.display(),
        )
    })
}

fn cmd_queue(config: &DaemonConfig) -> Result<()> {
    let meta = open_meta(config)?;
    let items = queued_files(&meta)?;
    println!("Queue: {} files", items.len());
    for it in &items {
        println!(
            "  {} state={:?} space={} scheduled_at={} residual_bytes={}",
            it.object_id, it.state, it.space_id, it.scheduled_at, it.bytes_to_upload_or_bind,
        );
    }
    Ok(())
}

/// Every queue record, earliest scheduled first.
fn queued_files(meta: &MetaStore) -> Result<Vec<FileInfo>> {
    let mut items = meta.item_store::<FileInfo>(QUEUE_NAME)?.list_all()?;
    items.sort_by_key(|it| it.scheduled_at);
    Ok(items)
}

// -----------------------------------------------------------------------
// ferryd usage
// -----------------------------------------------------------------------

fn cmd_usage(config: &DaemonConfig) -> Result<()> {
    let meta = open_meta(config)?;
    let Some(usage) = meta.system().get::<NodeUsage>(keys::NODE_USAGE)? else {
        println!("No usage recorded yet.");
        return Ok(());
    };

    println!(
        "Account: {} / {} bytes ({} left, {} cids)",
        usage.total_bytes_usage, usage.account_bytes_limit, usage.bytes_left, usage.total_cids_count,
    );
    for space in &usage.spaces {
        println!(
            "  {} files={} cids={} bytes={}",
            space.space_id, space.file_count, space.cids_count, space.space_bytes_usage,
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
