//! notesync CLI - Command line interface for the offline-first note store.
//!
//! Local edits are saved immediately and queued; `sync` and `run` push
//! them to the configured remote and pull changes from other devices.

mod config;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use notesync_common::{DeviceIdentity, DocumentId, DocumentKind, DocumentPatch, OwnerId};
use notesync_sync::{CycleOutcome, SyncScheduler};

use crate::config::{default_config_path, default_remote_path, CliConfig, RemoteConfig};

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "notesync - Offline-first note synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/notesync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Note,
    Journal,
    Task,
}

impl KindArg {
    fn into_kind(self) -> DocumentKind {
        match self {
            KindArg::Note => DocumentKind::Note,
            KindArg::Journal => DocumentKind::Journal {
                entry_date: Utc::now().date_naive(),
            },
            KindArg::Task => DocumentKind::Task {
                done: false,
                due_at: None,
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file for this device.
    Init {
        /// Account that owns the documents.
        #[arg(long)]
        owner: String,

        /// User id stamped on writes.
        #[arg(long)]
        user: String,

        /// Name of this device.
        #[arg(long, default_value = "cli")]
        client: String,

        /// Remote base URL. Without it, a remote kept in a local JSON file is used.
        #[arg(long)]
        remote_url: Option<String>,

        /// API key for the remote.
        #[arg(long, requires = "remote_url")]
        api_key: Option<String>,

        /// Access token for the remote session.
        #[arg(long, requires = "remote_url")]
        access_token: Option<String>,

        /// Database path.
        #[arg(long)]
        database: Option<PathBuf>,

        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },

    /// Create or edit a document.
    Write {
        /// Document to edit (default: create a new one).
        #[arg(long)]
        id: Option<DocumentId>,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short = 'b', long)]
        content: Option<String>,

        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Soft-delete a document.
    Delete { id: DocumentId },

    /// List documents.
    List {
        /// Include deleted documents.
        #[arg(short, long)]
        all: bool,
    },

    /// Show one document with its body.
    Show { id: DocumentId },

    /// Show sync status and queued entries.
    Status,

    /// Run one sync cycle now.
    Sync,

    /// Keep syncing in the background until Ctrl-C.
    Run,

    /// Clear the local cache and pull everything again.
    Reset {
        /// Discard unsynchronized changes.
        #[arg(short, long)]
        force: bool,
    },

    /// Put a failed queue entry back on the retry path.
    Retry { entry: String },

    /// Drop a failed queue entry.
    Discard { entry: String },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init {
            owner,
            user,
            client,
            remote_url,
            api_key,
            access_token,
            database,
            force,
        } => {
            let remote = match remote_url {
                Some(base_url) => RemoteConfig::Http {
                    base_url,
                    api_key: api_key.unwrap_or_default(),
                    access_token,
                },
                None => RemoteConfig::File {
                    path: default_remote_path(),
                },
            };
            cmd_init(&config_path, &owner, &user, &client, remote, database, force)
        }

        Commands::Write {
            id,
            title,
            content,
            kind,
        } => cmd_write(&config_path, id, title, content, kind),

        Commands::Delete { id } => cmd_delete(&config_path, id),

        Commands::List { all } => cmd_list(&config_path, all),

        Commands::Show { id } => cmd_show(&config_path, id),

        Commands::Status => cmd_status(&config_path),

        Commands::Sync => cmd_sync(&config_path).await,

        Commands::Run => cmd_run(&config_path).await,

        Commands::Reset { force } => cmd_reset(&config_path, force),

        Commands::Retry { entry } => cmd_retry(&config_path, &entry),

        Commands::Discard { entry } => cmd_discard(&config_path, &entry),

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "notesync", &mut io::stdout());
            Ok(())
        }
    }
}

/// Write a new config file.
fn cmd_init(
    config_path: &Path,
    owner: &str,
    user: &str,
    client: &str,
    remote: RemoteConfig,
    database: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let owner = OwnerId::new(owner).context("Invalid owner id")?;
    let identity = DeviceIdentity::new(owner, user, client).context("Invalid device identity")?;
    let mut config = CliConfig::new(identity, remote);
    if let Some(database) = database {
        config.database = database;
    }

    config.open_store()?;
    config.save(config_path)?;

    println!("Device initialized!");
    println!("  Config: {}", config_path.display());
    println!("  Database: {}", config.database.display());
    match &config.remote {
        RemoteConfig::File { path } => println!("  Remote: {} (local file)", path.display()),
        RemoteConfig::Http { base_url, .. } => println!("  Remote: {}", base_url),
    }
    Ok(())
}

/// Create or edit a document.
fn cmd_write(
    config_path: &Path,
    id: Option<DocumentId>,
    title: Option<String>,
    content: Option<String>,
    kind: Option<KindArg>,
) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;

    let mut patch = DocumentPatch::new();
    if let Some(title) = title {
        patch = patch.title(title);
    }
    if let Some(content) = content {
        patch = patch.content(content);
    }
    if let Some(kind) = kind {
        patch = patch.kind(kind.into_kind());
    }

    let id = id.unwrap_or_default();
    let document = manager.write(id, patch).context("Failed to save document")?;

    println!("Saved {}", document.id);
    println!("  Status: {}", manager.status()?);
    Ok(())
}

/// Soft-delete a document.
fn cmd_delete(config_path: &Path, id: DocumentId) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    manager.delete(id).context("Failed to delete document")?;
    println!("Deleted {}", id);
    Ok(())
}

/// List documents.
fn cmd_list(config_path: &Path, all: bool) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    let documents = manager.documents(all)?;

    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in documents {
        let mut flags = Vec::new();
        if doc.is_dirty() {
            flags.push("unsynced");
        }
        if doc.is_deleted() {
            flags.push("deleted");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "{}  {:<8} {}  {}{}",
            doc.id,
            doc.kind.type_name(),
            doc.updated_at.format("%Y-%m-%d %H:%M"),
            doc.title.as_deref().unwrap_or("(untitled)"),
            flags
        );
    }
    Ok(())
}

/// Show one document.
fn cmd_show(config_path: &Path, id: DocumentId) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    let document = manager
        .document(&id)?
        .with_context(|| format!("Document {} not found", id))?;
    let body = manager.body(&id)?;

    println!("Document {}", document.id);
    println!("  Title: {}", document.title.as_deref().unwrap_or("(untitled)"));
    println!("  Type: {}", document.kind.type_name());
    println!("  Created: {}", document.created_at);
    println!("  Updated: {}", document.updated_at);
    match document.synced_at {
        Some(at) => println!("  Synced: {}", at),
        None => println!("  Synced: never"),
    }
    if let Some(at) = document.deleted_at {
        println!("  Deleted: {}", at);
    }
    if let Some(body) = body {
        println!();
        println!("{}", body.content);
    }
    Ok(())
}

/// Show sync status.
fn cmd_status(config_path: &Path) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    let meta = manager.sync_meta()?;

    println!("Status: {}", meta.status(false));
    match meta.last_successful_sync_at {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never"),
    }
    println!("  Queued: {} ({} failed)", meta.pending_count, meta.failed_count);
    if let Some(err) = &meta.last_error {
        println!("  Last error ({}): {}", err.at, err.message);
    }

    let entries = manager.queue_entries()?;
    if !entries.is_empty() {
        println!("\nQueue:");
        for entry in entries {
            println!(
                "  {}  {} {}  {} attempt(s)  {}",
                entry.id,
                entry.op,
                entry.target_id,
                entry.attempts,
                entry.state.as_str()
            );
            if let Some(err) = entry.last_error {
                println!("      {}", err);
            }
        }
    }
    Ok(())
}

/// Run one cycle.
async fn cmd_sync(config_path: &Path) -> Result<()> {
    let session = CliConfig::load(config_path)?.session()?;
    let manager = &session.manager;

    let outcome = manager.sync_now().await;
    session.persist()?;
    match outcome.context("Sync failed")? {
        CycleOutcome::Completed(report) => {
            println!("Sync finished in {:?}", report.duration);
            println!(
                "  Uploaded: {}, deleted: {}, retrying: {}, failed: {}",
                report.drain.uploaded,
                report.drain.deleted,
                report.drain.rescheduled,
                report.drain.terminal
            );
            println!(
                "  Fetched: {}, applied: {}, conflicts: {}, rejected: {}",
                report.poll.fetched, report.poll.accepted, report.poll.conflicts, report.poll.failed
            );
        }
        CycleOutcome::Coalesced => println!("A sync is already running."),
    }
    println!("Status: {}", manager.status()?);
    Ok(())
}

/// Run the scheduler until interrupted.
async fn cmd_run(config_path: &Path) -> Result<()> {
    let session = CliConfig::load(config_path)?.session()?;
    let manager = &session.manager;
    let scheduler = SyncScheduler::new(manager.clone());
    let handle = scheduler.handle();
    let task = scheduler.spawn();

    println!("Syncing every {:?}. Press Ctrl-C to stop.", manager.config().poll_interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping");
    handle.shutdown();
    task.await.context("Scheduler task failed")?;
    session.persist()?;
    println!("Status: {}", manager.status()?);
    Ok(())
}

/// Reset the local cache.
fn cmd_reset(config_path: &Path, force: bool) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    let plan = manager.plan_reset()?;

    if plan.is_lossy() && !force {
        anyhow::bail!(
            "Reset would discard {} queued entries ({} failed) and {} unsynced documents; \
             rerun with --force",
            plan.pending_entries + plan.failed_entries,
            plan.failed_entries,
            plan.dirty_documents
        );
    }

    let report = manager
        .reset_local_cache(plan.with_force(force))
        .context("Failed to reset local cache")?;
    println!("Local cache cleared: {} documents", report.documents);
    if report.discarded_entries + report.discarded_dirty > 0 {
        println!(
            "  Discarded {} queued entries and {} unsynced documents",
            report.discarded_entries, report.discarded_dirty
        );
    }
    println!("Run `notesync sync` to pull everything again.");
    Ok(())
}

/// Retry a failed entry.
fn cmd_retry(config_path: &Path, entry: &str) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    if manager.retry_failed(entry).context("Failed to retry entry")? {
        println!("Entry {} queued for retry", entry);
    } else {
        println!("Entry {} is not in a failed state", entry);
    }
    Ok(())
}

/// Discard a failed entry.
fn cmd_discard(config_path: &Path, entry: &str) -> Result<()> {
    let manager = CliConfig::load(config_path)?.session()?.manager;
    if manager.discard_failed(entry).context("Failed to discard entry")? {
        println!("Entry {} discarded", entry);
    } else {
        println!("Entry {} is not in a failed state", entry);
    }
    Ok(())
}
