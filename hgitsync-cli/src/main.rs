//! hgitsync — Bidirectional sync between a changeset repository and a
//! commit/tree/blob repository.
//!
//! # Usage
//!
//! ```bash
//! # Translate local changesets into the target store
//! hgitsync export --repo /path/to/repo
//!
//! # Translate target refs back into bookmarks and tags
//! hgitsync import --repo /path/to/repo
//!
//! # Exchange with a remote (name from config.json, or a URL)
//! hgitsync pull --repo /path/to/repo origin
//! hgitsync push --repo /path/to/repo origin
//!
//! # Preview what a pull would bring in
//! hgitsync incoming --repo /path/to/repo origin
//!
//! # Inspect state
//! hgitsync map --repo /path/to/repo <hash>
//! hgitsync verify --repo /path/to/repo <node>
//! hgitsync log --repo /path/to/repo
//! ```

mod log;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hgit_core::refs::resolve_ref;
use hgit_core::session::SyncSession;
use hgit_core::{NodeId, ObjectId, OverlayView, SyncConfig, SyncReport, TargetStore};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "hgitsync")]
#[command(author = "hgit Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bidirectional changeset/commit repository synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate source heads (or the given revisions) into the target store
    Export {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Revisions to export, with their ancestors (hex node ids)
        #[arg(short = 'r', long = "rev")]
        revs: Vec<String>,
    },

    /// Translate target refs into bookmarks and tags
    Import {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Move bookmarks and tags even when not fast-forward
        #[arg(short, long)]
        force: bool,
    },

    /// Fetch from a remote, then import
    Pull {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Remote name or URL
        remote: String,
        #[arg(short, long)]
        force: bool,
    },

    /// Export, then update the remote's refs
    Push {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Remote name or URL
        remote: String,
        #[arg(short, long)]
        force: bool,
    },

    /// Look up a hash (or ref name) in the object map
    Map {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Source node, target commit id or target ref name
        hash: String,
    },

    /// Show the commits a pull would import, without importing them
    Incoming {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Remote name or URL
        remote: String,
    },

    /// Re-export a changeset from scratch and compare with its recorded tree
    Verify {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Source node (hex)
        node: String,
    },

    /// View the sync run log
    Log {
        /// Repository path
        #[arg(short, long, default_value = ".")]
        repo: PathBuf,
        /// Only show the most recent entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hgitsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export { repo, revs } => cmd_export(&repo, &revs).await,
        Commands::Import { repo, force } => cmd_import(&repo, force).await,
        Commands::Pull { repo, remote, force } => cmd_pull(&repo, &remote, force).await,
        Commands::Push { repo, remote, force } => cmd_push(&repo, &remote, force).await,
        Commands::Map { repo, hash } => cmd_map(&repo, &hash).await,
        Commands::Incoming { repo, remote } => cmd_incoming(&repo, &remote).await,
        Commands::Verify { repo, node } => cmd_verify(&repo, &node).await,
        Commands::Log { repo, limit } => cmd_log(&repo, limit).await,
    }
}

/// Name for tracking refs: the configured remote name, or `default` for a bare URL
fn tracking_name<'a>(config: &SyncConfig, remote: &'a str) -> &'a str {
    if config.remotes.contains_key(remote) {
        remote
    } else {
        "default"
    }
}

fn parse_node(hex: &str) -> Result<NodeId> {
    NodeId::from_hex(hex).map_err(|e| anyhow!("invalid node id {:?}: {}", hex, e))
}

/// Print a run summary; ref conflicts are listed but do not fail the command
fn print_report(action: &str, report: &SyncReport) {
    println!("{} complete:", action);
    println!("  Commits:   {}", report.commits);
    println!("  Updated:   {} refs", report.refs.updated.len());
    if !report.refs.deleted.is_empty() {
        println!("  Pruned:    {} refs", report.refs.deleted.len());
    }
    if report.stats.objects > 0 {
        println!("  Objects:   {}", report.stats.objects);
        println!("  Bytes:     {}", log::format_size(report.stats.bytes));
        println!("  Time:      {}ms", report.stats.duration_ms);
        if report.stats.duration_ms > 0 {
            println!("  Speed:     {}/s", log::format_size(report.stats.throughput_bps() as u64));
        }
    }
    for conflict in &report.refs.conflicts {
        warn!(error = %conflict, "ref not updated");
        println!("  Rejected:  {}", conflict);
    }
}

async fn cmd_export(repo: &Path, revs: &[String]) -> Result<()> {
    let mut session = SyncSession::open(repo)?;
    let nodes = revs.iter().map(|r| parse_node(r)).collect::<Result<Vec<_>>>()?;
    let report = if nodes.is_empty() {
        session.export(None)?
    } else {
        session.export(Some(&nodes))?
    };
    print_report("Export", &report);
    Ok(())
}

async fn cmd_import(repo: &Path, force: bool) -> Result<()> {
    let mut session = SyncSession::open(repo)?;
    let report = session.import(force)?;
    print_report("Import", &report);
    Ok(())
}

async fn cmd_pull(repo: &Path, remote: &str, force: bool) -> Result<()> {
    let mut session = SyncSession::open(repo)?;
    let url = session.config().remote_url(remote);
    let transport = hgit_core::transport::from_url(&url, session.config())?;
    println!("Pulling from {}...", transport.describe());
    let name = tracking_name(session.config(), remote);
    let report = session.pull(name, transport.as_ref(), force).await?;
    print_report("Pull", &report);
    Ok(())
}

async fn cmd_push(repo: &Path, remote: &str, force: bool) -> Result<()> {
    let mut session = SyncSession::open(repo)?;
    let url = session.config().remote_url(remote);
    let transport = hgit_core::transport::from_url(&url, session.config())?;
    println!("Pushing to {}...", transport.describe());
    let name = tracking_name(session.config(), remote);
    let report = session.push(name, transport.as_ref(), force).await?;
    print_report("Push", &report);
    Ok(())
}

async fn cmd_map(repo: &Path, hash: &str) -> Result<()> {
    let session = SyncSession::open(repo)?;
    let mapper = session.mapper();

    if let Ok(node) = NodeId::from_hex(hash) {
        if let Some(commit) = mapper.lookup_forward(&node)? {
            println!("{} -> {}", node, commit);
            return Ok(());
        }
    }
    let commit = match ObjectId::from_hex(hash) {
        Ok(id) => id,
        Err(_) => {
            let refs = session.target().refs()?;
            let (name, id) = resolve_ref(&refs, hash)?;
            let commit = session.target().peel(&id)?;
            println!("{} is {}", name, commit);
            commit
        }
    };
    match mapper.lookup_backward(&commit)? {
        Some(node) => println!("{} -> {}", commit, node),
        None => return Err(anyhow!("{} is not in the object map", hash)),
    }
    Ok(())
}

async fn cmd_incoming(repo: &Path, remote: &str) -> Result<()> {
    let session = SyncSession::open(repo)?;
    let url = session.config().remote_url(remote);
    let transport = hgit_core::transport::from_url(&url, session.config())?;
    let (scratch, commits) = session.incoming(transport.as_ref()).await?;

    if commits.is_empty() {
        println!("No incoming changes from {}.", transport.describe());
        return Ok(());
    }
    println!("Incoming from {} ({} commits):", transport.describe(), commits.len());
    let view = OverlayView::new(&scratch, session.mapper(), session.translator().clone(), commits);
    for node in view.nodes() {
        let changeset = view.changeset(&node)?;
        let summary = String::from_utf8_lossy(&changeset.description);
        let first_line = summary.lines().next().unwrap_or_default();
        let date = chrono::DateTime::from_timestamp(changeset.date.0, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| changeset.date.0.to_string());
        println!();
        println!("commit:      {}", changeset.commit);
        println!("branch:      {}", changeset.branch);
        println!("user:        {}", String::from_utf8_lossy(&changeset.user));
        println!("date:        {}", date);
        println!("files:       {}", changeset.files.join(" "));
        println!("summary:     {}", first_line);
    }
    Ok(())
}

async fn cmd_verify(repo: &Path, node: &str) -> Result<()> {
    let session = SyncSession::open(repo)?;
    let node = parse_node(node)?;
    println!("Verifying {}...", node);
    let report = session
        .verify(&node)
        .with_context(|| format!("Failed to verify {}", node))?;
    println!("  Commit:        {}", report.commit);
    println!("  Recorded tree: {}", report.recorded_tree);
    println!("  Expected tree: {}", report.expected_tree);
    if !report.matches() {
        return Err(anyhow!("Verification failed: recorded tree differs from a fresh export"));
    }
    println!("OK");
    Ok(())
}

async fn cmd_log(repo: &Path, limit: Option<usize>) -> Result<()> {
    log::print_log(repo, limit, &mut std::io::stdout())
}
