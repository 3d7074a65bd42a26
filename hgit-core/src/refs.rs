//! Ref synchronization between bookmarks/branches/tags and target refs.
//!
//! Refs are re-derived on every sync. Ref moves are fast-forward only unless
//! forced; a refused move is reported as a `RefConflict` for that ref alone
//! and the remaining refs are still updated.

use crate::error::{Result, SyncError};
use crate::mapping::{ObjectMapper, TagMap};
use crate::object::ObjectId;
use crate::source::NodeId;
use crate::storage::{SourceStore, TargetStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
pub const REMOTES_PREFIX: &str = "refs/remotes/";
/// Head refs under this sub-namespace mirror named branches, not bookmarks
pub const BRANCHES_NAMESPACE: &str = "branches/";

/// Outcome of applying a set of ref updates
#[derive(Debug, Default)]
pub struct RefReport {
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    /// One `RefConflict` per refused update
    pub conflicts: Vec<SyncError>,
}

impl RefReport {
    fn conflict(&mut self, ref_name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(ref_name, reason = %reason, "ref update refused");
        self.conflicts.push(SyncError::RefConflict {
            ref_name: ref_name.to_string(),
            reason,
        });
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Maps source names to target refs and back
#[derive(Debug, Clone)]
pub struct RefSynchronizer {
    export_named_branches: bool,
}

impl Default for RefSynchronizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RefSynchronizer {
    pub fn new(export_named_branches: bool) -> Self {
        Self { export_named_branches }
    }

    /// Target refs for every bookmark, branch head and tag whose changeset
    /// has been translated
    pub fn export_refs<S: SourceStore>(
        &self,
        source: &S,
        mapper: &ObjectMapper,
        tags: &TagMap,
    ) -> Result<BTreeMap<String, ObjectId>> {
        let mut refs = BTreeMap::new();
        let mut add = |name: String, node: &NodeId| -> Result<()> {
            match mapper.lookup_forward(node)? {
                Some(id) => {
                    refs.insert(name, id);
                }
                None => debug!(ref_name = %name, node = %node, "skipping ref to untranslated changeset"),
            }
            Ok(())
        };

        for (name, node) in source.bookmarks()? {
            add(format!("{}{}", HEADS_PREFIX, name), &node)?;
        }
        if self.export_named_branches {
            for (branch, heads) in source.branch_heads()? {
                // the newest head represents the branch
                if let Some(node) = heads.last() {
                    add(format!("{}{}{}", HEADS_PREFIX, BRANCHES_NAMESPACE, branch), node)?;
                }
            }
        }
        for (name, node) in tags.iter() {
            add(format!("{}{}", TAGS_PREFIX, name), node)?;
        }
        Ok(refs)
    }

    /// Point target refs at `desired`, fast-forward only unless `force`
    pub fn apply_to_target<T: TargetStore>(
        &self,
        target: &mut T,
        desired: &BTreeMap<String, ObjectId>,
        force: bool,
    ) -> Result<RefReport> {
        let current = target.refs()?;
        let mut report = RefReport::default();
        for (name, new) in desired {
            match current.get(name) {
                Some(old) if old == new => {
                    report.unchanged += 1;
                    continue;
                }
                Some(old) if !force && !is_fast_forward(target, old, new)? => {
                    report.conflict(name, format!("non-fast-forward update {} -> {}", old, new));
                    continue;
                }
                _ => {}
            }
            target.set_ref(name, *new)?;
            report.updated.push(name.clone());
        }
        Ok(report)
    }

    /// Turn target heads and tags into bookmarks and tag entries.
    ///
    /// `heads_prefix` selects which head refs become bookmarks, e.g.
    /// `refs/heads/` or `refs/remotes/origin/`.
    #[allow(clippy::too_many_arguments)]
    pub fn import_refs<S: SourceStore, T: TargetStore>(
        &self,
        source: &mut S,
        target: &T,
        refs: &BTreeMap<String, ObjectId>,
        heads_prefix: &str,
        mapper: &ObjectMapper,
        tags: &mut TagMap,
        force: bool,
    ) -> Result<RefReport> {
        let bookmarks = source.bookmarks()?;
        let mut report = RefReport::default();

        for (ref_name, id) in refs {
            if let Some(name) = ref_name.strip_prefix(heads_prefix) {
                if name.starts_with(BRANCHES_NAMESPACE) || name == "HEAD" {
                    continue;
                }
                let Some(node) = mapper.lookup_backward(id)? else {
                    debug!(ref_name = %ref_name, "skipping head with no translated commit");
                    continue;
                };
                match bookmarks.get(name) {
                    Some(old) if *old == node => {
                        report.unchanged += 1;
                        continue;
                    }
                    Some(old) if !force && !source.is_ancestor(old, &node)? => {
                        report.conflict(name, format!("bookmark {} would move backwards to {}", old, node));
                        continue;
                    }
                    _ => {}
                }
                source.set_bookmark(name, node)?;
                report.updated.push(name.to_string());
            } else if let Some(name) = ref_name.strip_prefix(TAGS_PREFIX) {
                let commit = target.peel(id)?;
                let Some(node) = mapper.lookup_backward(&commit)? else {
                    debug!(ref_name = %ref_name, "skipping tag on untranslated commit");
                    continue;
                };
                match tags.get(name) {
                    Some(old) if old == node => report.unchanged += 1,
                    Some(old) if !force => {
                        report.conflict(name, format!("tag already points at {}", old));
                    }
                    _ => {
                        tags.set(name, node);
                        report.updated.push(name.to_string());
                    }
                }
            }
        }
        Ok(report)
    }

    /// Mirror a remote's advertised refs into `refs/remotes/<remote>/` (heads)
    /// and `refs/tags/`, pruning heads that disappeared since the previous
    /// snapshot in `log`.
    pub fn sync_remote_tracking<T: TargetStore>(
        &self,
        target: &mut T,
        log: &RemoteRefLog,
        remote: &str,
        advertised: &BTreeMap<String, ObjectId>,
        force: bool,
    ) -> Result<RefReport> {
        let tracking_prefix = format!("{}{}/", REMOTES_PREFIX, remote);
        let mut desired = BTreeMap::new();
        for (name, id) in advertised {
            if let Some(branch) = name.strip_prefix(HEADS_PREFIX) {
                desired.insert(format!("{}{}", tracking_prefix, branch), *id);
            } else if name.starts_with(TAGS_PREFIX) && !name.ends_with("^{}") {
                desired.insert(name.clone(), *id);
            }
        }

        // remote-tracking refs always follow the remote
        let (tracking, tags): (BTreeMap<_, _>, BTreeMap<_, _>) =
            desired.into_iter().partition(|(name, _)| name.starts_with(&tracking_prefix));
        let mut report = self.apply_to_target(target, &tracking, true)?;
        let tag_report = self.apply_to_target(target, &tags, force)?;
        report.updated.extend(tag_report.updated);
        report.unchanged += tag_report.unchanged;
        report.conflicts.extend(tag_report.conflicts);

        if let Some(previous) = log.last(remote)? {
            let current = target.refs()?;
            for name in previous.keys() {
                let Some(branch) = name.strip_prefix(HEADS_PREFIX) else { continue };
                if advertised.contains_key(name) {
                    continue;
                }
                let tracking_ref = format!("{}{}", tracking_prefix, branch);
                if current.contains_key(&tracking_ref) {
                    target.delete_ref(&tracking_ref)?;
                    info!(ref_name = %tracking_ref, "pruned deleted remote ref");
                    report.deleted.push(tracking_ref);
                }
            }
        }
        log.append(remote, advertised)?;
        Ok(report)
    }
}

fn is_fast_forward<T: TargetStore>(target: &T, old: &ObjectId, new: &ObjectId) -> Result<bool> {
    if !target.contains(old)? {
        return Ok(false);
    }
    let old = target.peel(old)?;
    let new = target.peel(new)?;
    target.is_ancestor(&old, &new)
}

/// Resolve a short ref name against `refs`.
///
/// Tries the exact name, then `refs/heads/`, `refs/tags/` and every
/// `refs/remotes/<remote>/`; more than one match is ambiguous.
pub fn resolve_ref(refs: &BTreeMap<String, ObjectId>, name: &str) -> Result<(String, ObjectId)> {
    if let Some(id) = refs.get(name) {
        return Ok((name.to_string(), *id));
    }
    let mut candidates: Vec<(String, ObjectId)> = Vec::new();
    for prefix in [HEADS_PREFIX, TAGS_PREFIX] {
        let full = format!("{}{}", prefix, name);
        if let Some(id) = refs.get(&full) {
            candidates.push((full, *id));
        }
    }
    for (full, id) in refs {
        if let Some(rest) = full.strip_prefix(REMOTES_PREFIX) {
            if rest.split_once('/').map(|(_, branch)| branch == name).unwrap_or(false) {
                candidates.push((full.clone(), *id));
            }
        }
    }
    match candidates.len() {
        0 => Err(SyncError::consistency(format!("unknown ref {}", name))),
        1 => Ok(candidates.remove(0)),
        _ => Err(SyncError::Authority {
            name: name.to_string(),
            candidates: candidates.into_iter().map(|(full, _)| full).collect(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteRefSnapshot {
    remote: String,
    timestamp: i64,
    refs: BTreeMap<String, String>,
}

/// Append-only record of each remote's advertised refs (one JSON per line)
#[derive(Debug)]
pub struct RemoteRefLog {
    path: Option<PathBuf>,
    memory: Mutex<Vec<RemoteRefSnapshot>>,
}

impl RemoteRefLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            memory: Mutex::new(Vec::new()),
        }
    }

    /// Log kept in memory for the life of the value
    pub fn in_memory() -> Self {
        Self {
            path: None,
            memory: Mutex::new(Vec::new()),
        }
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, Vec<RemoteRefSnapshot>> {
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, remote: &str, refs: &BTreeMap<String, ObjectId>) -> Result<()> {
        let snapshot = RemoteRefSnapshot {
            remote: remote.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            refs: refs.iter().map(|(k, v)| (k.clone(), v.to_hex())).collect(),
        };
        let Some(path) = &self.path else {
            self.memory().push(snapshot);
            return Ok(());
        };
        let line = serde_json::to_string(&snapshot).map_err(|e| SyncError::malformed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Most recent snapshot for `remote`
    pub fn last(&self, remote: &str) -> Result<Option<BTreeMap<String, ObjectId>>> {
        let Some(path) = &self.path else {
            return snapshot_refs(self.memory().iter().rev().find(|s| s.remote == remote).cloned());
        };
        if !path.exists() {
            return Ok(None);
        }
        let mut last = None;
        for line in fs::read_to_string(path)?.lines() {
            match serde_json::from_str::<RemoteRefSnapshot>(line) {
                Ok(snapshot) if snapshot.remote == remote => last = Some(snapshot),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unreadable remote ref snapshot"),
            }
        }
        snapshot_refs(last)
    }
}

fn snapshot_refs(snapshot: Option<RemoteRefSnapshot>) -> Result<Option<BTreeMap<String, ObjectId>>> {
    let Some(snapshot) = snapshot else { return Ok(None) };
    let mut refs = BTreeMap::new();
    for (name, hex) in snapshot.refs {
        refs.insert(name, ObjectId::from_hex(&hex)?);
    }
    Ok(Some(refs))
}
