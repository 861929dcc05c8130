//! Satchel CLI - Command line interface for the offline content engine.
//!
//! Content is served from a local library directory: each item lives at
//! `<library>/<id>/` with a `meta.json` and a `package.bin`. Synced
//! mutations are appended to `<library>/mutations.log`, one JSON object
//! per line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use satchel_common::ContentId;
use satchel_engine::{
    DrainOutcome, DownloadProgress, EngineConfig, MutationKind, ResolveAction, StaticMonitor,
    SyncEngine,
};
use satchel_storage::LocalStore;

mod remote;

use remote::DirRemote;

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Satchel - Offline learning content manager")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Local data directory (defaults to the platform data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Content library directory acting as the remote.
    #[arg(short, long)]
    library: PathBuf,

    /// Treat the remote as unreachable.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a content item from the library.
    Download {
        /// Content identifier.
        id: String,

        /// Re-transfer even if the local copy is already current.
        #[arg(short, long)]
        force: bool,
    },

    /// Remove a downloaded item and its stored package.
    Remove {
        /// Content identifier.
        id: String,
    },

    /// List downloaded content.
    List,

    /// Check the library for newer versions of downloaded content.
    Check,

    /// Record reading progress for an item.
    Progress {
        /// Content identifier.
        id: String,

        /// Lesson or section reached.
        #[arg(short, long)]
        lesson: u32,
    },

    /// Bookmark a position in an item.
    Bookmark {
        /// Content identifier.
        id: String,

        /// Page to bookmark.
        #[arg(short, long)]
        page: u32,
    },

    /// Save a note against an item.
    Note {
        /// Content identifier.
        id: String,

        /// Note text.
        text: String,
    },

    /// Show the pending mutation queue.
    Queue,

    /// Deliver pending mutations to the library.
    Sync,

    /// Resolve a conflicted mutation.
    Resolve {
        /// Queue item identifier.
        item: Uuid,

        /// Drop the mutation instead of retrying it.
        #[arg(long)]
        discard: bool,
    },

    /// Show storage and sync statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = open_engine(&cli).await?;

    match cli.command {
        Commands::Download { id, force } => cmd_download(&engine, &id, force).await,

        Commands::Remove { id } => cmd_remove(&engine, &id).await,

        Commands::List => cmd_list(&engine).await,

        Commands::Check => cmd_check(&engine).await,

        Commands::Progress { id, lesson } => {
            cmd_enqueue(
                &engine,
                &id,
                MutationKind::ProgressUpdate,
                serde_json::json!({ "lesson": lesson }),
            )
            .await
        }

        Commands::Bookmark { id, page } => {
            cmd_enqueue(
                &engine,
                &id,
                MutationKind::BookmarkSet,
                serde_json::json!({ "page": page }),
            )
            .await
        }

        Commands::Note { id, text } => {
            cmd_enqueue(
                &engine,
                &id,
                MutationKind::NoteSaved,
                serde_json::json!({ "text": text }),
            )
            .await
        }

        Commands::Queue => cmd_queue(&engine).await,

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Resolve { item, discard } => cmd_resolve(&engine, item, discard).await,

        Commands::Stats => cmd_stats(&engine).await,
    }
}

async fn open_engine(cli: &Cli) -> Result<Arc<SyncEngine>> {
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("satchel"),
    };

    let store = Arc::new(LocalStore::new(&data_dir).context("Failed to open data directory")?);
    let remote = Arc::new(DirRemote::new(cli.library.clone()));
    let monitor = Arc::new(if cli.offline {
        StaticMonitor::offline()
    } else {
        StaticMonitor::online()
    });

    SyncEngine::open(store, remote, monitor, EngineConfig::default())
        .await
        .context("Failed to open engine")
}

fn parse_id(id: &str) -> Result<ContentId> {
    ContentId::new(id).context("Invalid content id")
}

/// Download one item, printing progress as it arrives.
async fn cmd_download(engine: &Arc<SyncEngine>, id: &str, force: bool) -> Result<()> {
    let id = parse_id(id)?;
    info!("Downloading {}", id);

    let mut progress = engine.download_content(&id, force).await;
    let mut last_percent = None;
    loop {
        let event = progress.borrow_and_update().clone();
        match &event {
            DownloadProgress::Resolving => {}
            DownloadProgress::Started {
                version,
                size_in_bytes,
            } => {
                println!("Fetching version {version} ({size_in_bytes} bytes)");
            }
            DownloadProgress::Transferring { percent } => {
                if last_percent != Some(*percent) {
                    println!("  {percent}%");
                    last_percent = Some(*percent);
                }
            }
            DownloadProgress::Completed(entry) => {
                println!("Downloaded {} (version {})", entry.content_id, entry.version);
                println!("  Title: {}", entry.title);
                println!("  Size: {} bytes", entry.size_in_bytes);
                return Ok(());
            }
            DownloadProgress::Failed(reason) => {
                anyhow::bail!("Download failed: {reason}");
            }
            DownloadProgress::Cancelled => {
                anyhow::bail!("Download cancelled");
            }
        }
        if progress.changed().await.is_err() {
            anyhow::bail!("Download ended without a result");
        }
    }
}

async fn cmd_remove(engine: &Arc<SyncEngine>, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    if engine.remove_content(&id).await? {
        println!("Removed {id}");
    } else {
        println!("{id} is not downloaded");
    }
    Ok(())
}

async fn cmd_list(engine: &Arc<SyncEngine>) -> Result<()> {
    let entries = engine.manifest_snapshot().await;
    if entries.is_empty() {
        println!("No downloaded content.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  v{}  {} bytes  {}  [{}]",
            entry.content_id, entry.version, entry.size_in_bytes, entry.title, entry.subject
        );
    }
    Ok(())
}

async fn cmd_check(engine: &Arc<SyncEngine>) -> Result<()> {
    let updates = engine.check_for_updates().await?;
    let newer: Vec<_> = updates.iter().filter(|(_, newer)| **newer).collect();
    if newer.is_empty() {
        println!("All downloaded content is up to date ({} checked).", updates.len());
    } else {
        for (id, _) in newer {
            println!("{id}: update available");
        }
    }
    Ok(())
}

async fn cmd_enqueue(
    engine: &Arc<SyncEngine>,
    id: &str,
    kind: MutationKind,
    payload: serde_json::Value,
) -> Result<()> {
    let id = parse_id(id)?;
    let item = engine.enqueue_mutation(id, kind, payload).await?;
    println!("Queued {item}");

    if engine.is_online() {
        cmd_sync(engine).await?;
    } else {
        println!("Offline; will deliver on next sync.");
    }
    Ok(())
}

async fn cmd_queue(engine: &Arc<SyncEngine>) -> Result<()> {
    let items = engine.queue_snapshot().await;
    if items.is_empty() {
        println!("Sync queue is empty.");
        return Ok(());
    }
    for item in items {
        let error = item.last_error.as_deref().unwrap_or("-");
        println!(
            "{}  {}  {:?}  {:?}  attempts={}  {}",
            item.id, item.content_id, item.kind, item.status, item.attempt_count, error
        );
    }
    Ok(())
}

async fn cmd_sync(engine: &Arc<SyncEngine>) -> Result<()> {
    let report = engine.sync_pending_changes().await?;
    match report.outcome {
        DrainOutcome::Offline => println!("Offline; nothing sent."),
        DrainOutcome::AlreadyRunning => println!("A sync is already running."),
        DrainOutcome::Cancelled => println!("Sync cancelled."),
        DrainOutcome::Completed | DrainOutcome::Partial => {
            println!(
                "Synced: {} delivered, {} retrying, {} conflicted, {} failed",
                report.succeeded, report.retrying, report.conflicted, report.failed_terminal
            );
            for (item, reason) in &report.failures {
                println!("  {item}: {reason}");
            }
        }
    }
    Ok(())
}

async fn cmd_resolve(engine: &Arc<SyncEngine>, item: Uuid, discard: bool) -> Result<()> {
    let action = if discard {
        ResolveAction::Discard
    } else {
        ResolveAction::Retry
    };
    if engine.resolve_conflict(item, action).await? {
        println!("Resolved {item}");
    } else {
        println!("No such queue item: {item}");
    }
    Ok(())
}

async fn cmd_stats(engine: &Arc<SyncEngine>) -> Result<()> {
    let stats = engine.stats().await;
    println!("Content items:      {}", stats.content_count);
    println!("Storage used:       {} bytes", stats.storage_used);
    println!("Pending mutations:  {}", stats.pending_mutations);
    println!("Conflicted:         {}", stats.conflicted_mutations);
    println!("Failed (terminal):  {}", stats.terminal_failures);
    match stats.last_sync_time {
        Some(t) => println!("Last full sync:     {t}"),
        None => println!("Last full sync:     never"),
    }
    Ok(())
}
