//! Sync run log display for the hgitsync CLI.
//!
//! Human-readable formatting over the core `SyncLog`.

use anyhow::Result;
use hgit_core::{SyncLog, SyncLogEntry};
use std::io::Write;
use std::path::Path;

/// Format a run log entry for human-readable display.
pub fn format_entry(entry: &SyncLogEntry) -> String {
    let date = chrono::DateTime::from_timestamp(entry.timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| entry.timestamp.to_string());

    let status = if entry.success { "OK" } else { "FAILED" };
    let remote = entry
        .remote
        .as_ref()
        .map(|r| format!(" {}", r))
        .unwrap_or_default();

    format!(
        "[{}] {}{} | {} commits | {} objects, {} | {}ms | {}{}",
        date,
        entry.direction,
        remote,
        entry.commits_translated,
        entry.objects_transferred,
        format_size(entry.bytes_transferred),
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Print the run log of a repository, optionally only the last `limit` runs.
pub fn print_log(repo_path: &Path, limit: Option<usize>, writer: &mut dyn Write) -> Result<()> {
    let mut entries = SyncLog::new(repo_path).all()?;
    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        writeln!(writer, "No sync log entries found.")?;
        return Ok(());
    }

    writeln!(writer, "Sync Log ({} entries):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let total_commits: u64 = entries.iter().map(|e| e.commits_translated).sum();
    let total_bytes: u64 = entries.iter().map(|e| e.bytes_transferred).sum();
    let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
    let successes = entries.iter().filter(|e| e.success).count();

    writeln!(
        writer,
        "Summary: {} runs ({} successful), {} commits, {}, {}ms total",
        entries.len(),
        successes,
        total_commits,
        format_size(total_bytes),
        total_ms,
    )?;

    Ok(())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
