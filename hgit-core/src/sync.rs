//! Sync configuration and run log.
//!
//! Everything the engine persists outside the two object stores lives under
//! `<repo>/hgit/`: the configuration, the mapping and tag files, the remote
//! ref snapshots and one JSON log entry per sync run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under the repository holding all sync state.
pub const STATE_DIR: &str = "hgit";

/// State directory for a repository path.
pub fn state_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(STATE_DIR)
}

/// Sync configuration stored at `repo/hgit/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Source branch that produces no `branch` footer line.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Identity rewrite table (old identity -> canonical identity).
    #[serde(default)]
    pub authors: BTreeMap<String, String>,
    /// Optional file of `old = new` lines merged over `authors`.
    #[serde(default)]
    pub authors_file: Option<PathBuf>,
    /// Replacement glyph for forbidden identity bytes.
    #[serde(default = "default_placeholder")]
    pub placeholder: char,
    /// Remote name -> URL.
    #[serde(default)]
    pub remotes: BTreeMap<String, String>,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    #[serde(default = "default_upload_pack")]
    pub upload_pack: String,
    #[serde(default = "default_receive_pack")]
    pub receive_pack: String,
    /// Transport timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Also export named-branch heads as target refs.
    #[serde(default = "default_true")]
    pub export_named_branches: bool,
}

fn default_branch() -> String {
    crate::source::DEFAULT_BRANCH.to_string()
}

fn default_placeholder() -> char {
    '?'
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

fn default_upload_pack() -> String {
    "git-upload-pack".to_string()
}

fn default_receive_pack() -> String {
    "git-receive-pack".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            authors: BTreeMap::new(),
            authors_file: None,
            placeholder: default_placeholder(),
            remotes: BTreeMap::new(),
            ssh_command: default_ssh_command(),
            upload_pack: default_upload_pack(),
            receive_pack: default_receive_pack(),
            timeout_secs: default_timeout_secs(),
            export_named_branches: true,
        }
    }
}

impl SyncConfig {
    /// Load sync config from a repository path.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = Self::config_file_path(repo_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read sync config from {:?}", config_path))?;
        let config: SyncConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse sync config JSON")?;
        Ok(config)
    }

    /// Save sync config to a repository path.
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = Self::config_file_path(repo_path);
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// The identity rewrite table with `authors_file` entries applied on top.
    pub fn author_map(&self) -> Result<BTreeMap<String, String>> {
        let mut map = self.authors.clone();
        if let Some(path) = &self.authors_file {
            let data = fs::read_to_string(path)
                .with_context(|| format!("Failed to read authors file {:?}", path))?;
            map.extend(parse_authors(&data));
        }
        Ok(map)
    }

    /// URL configured for a remote; a value that is not a remote name is
    /// taken as a URL itself.
    pub fn remote_url(&self, remote: &str) -> String {
        self.remotes
            .get(remote)
            .cloned()
            .unwrap_or_else(|| remote.to_string())
    }

    fn config_file_path(repo_path: &Path) -> PathBuf {
        state_dir(repo_path).join("config.json")
    }
}

/// Parse `old = new` lines; `#` starts a comment.
pub fn parse_authors(data: &str) -> BTreeMap<String, String> {
    data.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter_map(|line| line.split_once('='))
        .map(|(old, new)| (old.trim().to_string(), new.trim().to_string()))
        .filter(|(old, new)| !old.is_empty() && !new.is_empty())
        .collect()
}

/// Direction of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Export,
    Import,
    Pull,
    Push,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncDirection::Export => "export",
            SyncDirection::Import => "import",
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
        };
        f.write_str(s)
    }
}

/// Sync log entry: records a completed or failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Unique id of the run.
    pub id: String,
    pub direction: SyncDirection,
    /// Remote name, when the run talked to one.
    pub remote: Option<String>,
    /// Timestamp when the run finished (Unix seconds).
    pub timestamp: i64,
    /// Number of commits translated in either direction.
    pub commits_translated: u64,
    /// Number of objects transferred over the wire.
    pub objects_transferred: u64,
    /// Total pack bytes transferred.
    pub bytes_transferred: u64,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Whether the run completed successfully.
    pub success: bool,
    /// Error message if the run failed.
    pub error: Option<String>,
}

impl SyncLogEntry {
    pub fn new(direction: SyncDirection, remote: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            remote,
            timestamp: chrono::Utc::now().timestamp(),
            commits_translated: 0,
            objects_transferred: 0,
            bytes_transferred: 0,
            duration_ms: 0,
            success: false,
            error: None,
        }
    }
}

/// Manages the sync log for a repository.
pub struct SyncLog {
    log_dir: PathBuf,
}

impl SyncLog {
    /// Create a new SyncLog for the given repository.
    pub fn new(repo_path: &Path) -> Self {
        Self {
            log_dir: state_dir(repo_path).join("sync-log"),
        }
    }

    /// Append a log entry.
    pub fn append(&self, entry: &SyncLogEntry) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create sync log dir {:?}", self.log_dir))?;
        let filename = format!("{}_{}.json", entry.timestamp, entry.id);
        let path = self.log_dir.join(&filename);
        let data = serde_json::to_string_pretty(entry)?;
        fs::write(&path, data)?;
        Ok(())
    }

    /// All log entries, oldest first.
    pub fn all(&self) -> Result<Vec<SyncLogEntry>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(data) = fs::read_to_string(&path) {
                    if let Ok(log_entry) = serde_json::from_str::<SyncLogEntry>(&data) {
                        entries.push(log_entry);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Get the latest log entry.
    pub fn latest(&self) -> Result<Option<SyncLogEntry>> {
        Ok(self.all()?.into_iter().last())
    }

    /// Remove entries older than `timestamp`.
    pub fn cleanup_before(&self, timestamp: i64) -> Result<u64> {
        if !self.log_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0u64;
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if let Ok(data) = fs::read_to_string(&path) {
                if let Ok(log_entry) = serde_json::from_str::<SyncLogEntry>(&data) {
                    if log_entry.timestamp < timestamp {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }
}
