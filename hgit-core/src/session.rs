//! Sync sessions: the top-level export, import, pull and push runs.
//!
//! A run translates commits in topological order, records every pair in the
//! `ObjectMapper`, moves refs last and only then persists the map and tag
//! files. Any fatal error or a cancellation leaves the persisted state as it
//! was before the run.

use crate::error::{Result, SyncError};
use crate::export::{export_full, IncrementalTreeExporter};
use crate::footer::OctopusMarker;
use crate::identity::IdentityRules;
use crate::mapping::{ObjectMapper, TagMap};
use crate::negotiator::{TransferStats, TransportNegotiator};
use crate::object::{Object, ObjectId};
use crate::octopus;
use crate::protocol::Service;
use crate::refs::{RefReport, RefSynchronizer, RemoteRefLog, HEADS_PREFIX, REMOTES_PREFIX, TAGS_PREFIX};
use crate::source::NodeId;
use crate::storage::{DiskSourceStore, DiskTargetStore, LayeredTargetStore, MemoryTargetStore, SourceStore, TargetStore};
use crate::sync::{state_dir, SyncConfig, SyncDirection, SyncLog, SyncLogEntry};
use crate::topo::topo_sort;
use crate::translate::CommitTranslator;
use crate::transport::Transport;
use anyhow::Context;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Directory of the source store inside a repository
pub const SOURCE_STORE_DIR: &str = "store";
/// Directory of the target store inside the state directory
pub const TARGET_STORE_DIR: &str = "git";

/// What one run did
#[derive(Debug, Default)]
pub struct SyncReport {
    pub commits: u64,
    pub refs: RefReport,
    pub stats: TransferStats,
}

/// Result of re-exporting a mapped changeset from scratch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub node: NodeId,
    pub commit: ObjectId,
    pub expected_tree: ObjectId,
    pub recorded_tree: ObjectId,
}

impl VerifyReport {
    pub fn matches(&self) -> bool {
        self.expected_tree == self.recorded_tree
    }
}

pub struct SyncSession<S: SourceStore, T: TargetStore> {
    source: S,
    target: T,
    mapper: ObjectMapper,
    tags: TagMap,
    translator: CommitTranslator,
    refs: RefSynchronizer,
    remote_log: RemoteRefLog,
    log: Option<SyncLog>,
    config: SyncConfig,
    cancel: Arc<AtomicBool>,
}

impl SyncSession<DiskSourceStore, DiskTargetStore> {
    /// Open the on-disk stores and state of the repository at `repo`
    pub fn open(repo: &Path) -> anyhow::Result<Self> {
        let config = SyncConfig::load(repo)?;
        let authors = config.author_map()?;
        let state = state_dir(repo);
        let source = DiskSourceStore::open(&repo.join(SOURCE_STORE_DIR))
            .with_context(|| format!("Failed to open source store in {:?}", repo))?;
        let target = DiskTargetStore::open(&state.join(TARGET_STORE_DIR))
            .with_context(|| format!("Failed to open target store in {:?}", state))?;
        let tags = TagMap::load(state.join("tags")).context("Failed to load tag file")?;

        let mut session = Self::new(source, target, config);
        session.translator = CommitTranslator::new(
            IdentityRules::new(authors, session.config.placeholder),
            session.config.default_branch.clone(),
        );
        session.mapper = ObjectMapper::open(state.join("map"));
        session.tags = tags;
        session.remote_log = RemoteRefLog::open(state.join("remote-refs"));
        session.log = Some(SyncLog::new(repo));
        Ok(session)
    }
}

impl<S: SourceStore, T: TargetStore> SyncSession<S, T> {
    /// Session over the given stores with in-memory map, tags and no run log
    pub fn new(source: S, target: T, config: SyncConfig) -> Self {
        let translator = CommitTranslator::new(
            IdentityRules::new(config.authors.clone(), config.placeholder),
            config.default_branch.clone(),
        );
        Self {
            source,
            target,
            mapper: ObjectMapper::in_memory(),
            tags: TagMap::in_memory(),
            translator,
            refs: RefSynchronizer::new(config.export_named_branches),
            remote_log: RemoteRefLog::in_memory(),
            log: None,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn mapper(&self) -> &ObjectMapper {
        &self.mapper
    }

    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut TagMap {
        &mut self.tags
    }

    pub fn translator(&self) -> &CommitTranslator {
        &self.translator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Flag that aborts the current run between commits when raised
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn persist(&mut self) -> Result<()> {
        self.mapper.persist()?;
        self.tags.persist()?;
        Ok(())
    }

    fn record_run(&self, direction: SyncDirection, remote: Option<&str>, started: Instant, result: &Result<SyncReport>) {
        let Some(log) = &self.log else { return };
        let mut entry = SyncLogEntry::new(direction, remote.map(str::to_string));
        entry.duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(report) => {
                entry.success = true;
                entry.commits_translated = report.commits;
                entry.objects_transferred = report.stats.objects;
                entry.bytes_transferred = report.stats.bytes;
            }
            Err(e) => entry.error = Some(e.to_string()),
        }
        if let Err(e) = log.append(&entry) {
            warn!(error = %e, "failed to write sync log entry");
        }
    }

    /// Translate source changesets (the given revisions and their
    /// ancestors, or every head) into the target store and update refs.
    pub fn export(&mut self, revs: Option<&[NodeId]>) -> Result<SyncReport> {
        let started = Instant::now();
        let result = self.export_changesets(revs).and_then(|commits| {
            let refs = self.export_refs()?;
            self.persist()?;
            Ok(SyncReport {
                commits,
                refs,
                ..Default::default()
            })
        });
        self.record_run(SyncDirection::Export, None, started, &result);
        result
    }

    fn export_refs(&mut self) -> Result<RefReport> {
        let desired = self.refs.export_refs(&self.source, &self.mapper, &self.tags)?;
        self.refs.apply_to_target(&mut self.target, &desired, false)
    }

    fn export_changesets(&mut self, revs: Option<&[NodeId]>) -> Result<u64> {
        let tips = match revs {
            Some(revs) => revs.to_vec(),
            None => self.source.heads()?,
        };

        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = tips;
        while let Some(node) = stack.pop() {
            if node.is_null() || !seen.insert(node) || self.mapper.lookup_forward(&node)?.is_some() {
                continue;
            }
            let changeset = self.source.changeset(&node)?;
            stack.extend(changeset.parents.iter().copied());
            pending.push((node, changeset.parents));
        }
        pending.reverse();
        let order = topo_sort(&pending)?;
        debug!(count = order.len(), "changesets to export");

        let mut exporter: Option<(NodeId, IncrementalTreeExporter)> = None;
        let mut exported = 0u64;
        for node in order {
            self.check_cancel()?;
            let changeset = self.source.changeset(&node)?;
            let manifest = self.source.manifest_of(&node)?;

            let mut parents = Vec::with_capacity(changeset.parents.len());
            for parent in &changeset.parents {
                let id = self.mapper.lookup_forward(parent)?.ok_or_else(|| {
                    SyncError::consistency(format!("parent {} of {} has no target commit", parent, node))
                })?;
                parents.push(id);
            }

            let reusable = matches!((&exporter, changeset.p1()), (Some((last, _)), Some(p1)) if *last == p1);
            let mut tree_exporter = match exporter.take() {
                Some((_, e)) if reusable => e,
                _ => match (changeset.p1(), parents.first()) {
                    (Some(p1), Some(p1_commit)) => {
                        let parent_tree = self.target.commit(p1_commit)?.tree;
                        let parent_manifest = self.source.manifest_of(&p1)?;
                        IncrementalTreeExporter::seeded(&self.source, &self.target, parent_tree, parent_manifest)?
                    }
                    _ => IncrementalTreeExporter::new(),
                },
            };
            tree_exporter.set_cancel_flag(self.cancel_handle());
            let tree = tree_exporter.update(&self.source, &mut self.target, &manifest)?;

            let commits = self
                .translator
                .export_commit(&self.source, &changeset, &manifest, tree, &parents)?;
            let mut head = ObjectId::NULL;
            for commit in commits {
                head = self.target.put(&Object::Commit(commit))?;
            }
            self.mapper.record(node, head)?;
            debug!(node = %node, commit = %head, "exported changeset");
            exporter = Some((node, tree_exporter));
            exported += 1;
        }
        if exported > 0 {
            info!(count = exported, "exported changesets");
        }
        Ok(exported)
    }

    /// Translate every target commit reachable from local heads and tags
    /// into the source store and update bookmarks and tags.
    pub fn import(&mut self, force: bool) -> Result<SyncReport> {
        let started = Instant::now();
        let result = self.import_from(HEADS_PREFIX, force);
        self.record_run(SyncDirection::Import, None, started, &result);
        result
    }

    fn import_from(&mut self, heads_prefix: &str, force: bool) -> Result<SyncReport> {
        let refs: BTreeMap<String, ObjectId> = self
            .target
            .refs()?
            .into_iter()
            .filter(|(name, _)| name.starts_with(heads_prefix) || name.starts_with(TAGS_PREFIX))
            .collect();

        let mut tips = Vec::new();
        for id in refs.values() {
            tips.push(self.target.peel(id)?);
        }
        let pending = unimported_commits(&self.target, &self.mapper, &tips)?;
        let order = topo_sort(&pending)?;
        let parents_of: BTreeMap<ObjectId, Vec<ObjectId>> = pending.into_iter().collect();
        debug!(count = order.len(), "commits to import");

        let mut imported = 0u64;
        for id in order {
            self.check_cancel()?;
            let commit = self.target.commit(&id)?;
            let parent_commits = parents_of.get(&id).cloned().unwrap_or_default();
            let mut parent_nodes = Vec::with_capacity(parent_commits.len());
            for parent in &parent_commits {
                let node = self.mapper.lookup_backward(parent)?.ok_or_else(|| {
                    SyncError::consistency(format!("parent {} of {} has no source changeset", parent, id))
                })?;
                parent_nodes.push(node);
            }
            let node = self
                .translator
                .import_commit(&mut self.source, &self.target, &commit, &parent_commits, &parent_nodes)?;
            self.mapper.record(node, id)?;
            debug!(commit = %id, node = %node, "imported commit");
            imported += 1;
        }
        if imported > 0 {
            info!(count = imported, "imported commits");
        }

        let report = self.refs.import_refs(
            &mut self.source,
            &self.target,
            &refs,
            heads_prefix,
            &self.mapper,
            &mut self.tags,
            force,
        )?;
        self.persist()?;
        Ok(SyncReport {
            commits: imported,
            refs: report,
            ..Default::default()
        })
    }

    /// Fetch from a remote into `refs/remotes/<remote>/`, then import
    pub async fn pull<Tr: Transport + ?Sized>(&mut self, remote: &str, transport: &Tr, force: bool) -> Result<SyncReport> {
        let started = Instant::now();
        let result = self.pull_inner(remote, transport, force).await;
        self.record_run(SyncDirection::Pull, Some(remote), started, &result);
        result
    }

    async fn pull_inner<Tr: Transport + ?Sized>(&mut self, remote: &str, transport: &Tr, force: bool) -> Result<SyncReport> {
        info!(remote, endpoint = %transport.describe(), "pulling");
        let mut conn = transport.connect(Service::UploadPack).await?;
        let mut negotiator = TransportNegotiator::new(self.timeout());
        let outcome = negotiator.fetch(conn.as_mut(), &mut self.target).await?;
        drop(conn);

        let tracking = self
            .refs
            .sync_remote_tracking(&mut self.target, &self.remote_log, remote, &outcome.refs, force)?;
        let mut report = self.import_from(&format!("{}{}/", REMOTES_PREFIX, remote), force)?;
        report.refs.deleted.extend(tracking.deleted);
        report.refs.conflicts.extend(tracking.conflicts);
        report.stats = outcome.stats;
        Ok(report)
    }

    /// Export, then update the remote's refs to the exported heads and tags
    pub async fn push<Tr: Transport + ?Sized>(&mut self, remote: &str, transport: &Tr, force: bool) -> Result<SyncReport> {
        let started = Instant::now();
        let result = self.push_inner(remote, transport, force).await;
        self.record_run(SyncDirection::Push, Some(remote), started, &result);
        result
    }

    async fn push_inner<Tr: Transport + ?Sized>(&mut self, remote: &str, transport: &Tr, force: bool) -> Result<SyncReport> {
        let commits = self.export_changesets(None)?;
        let mut report = SyncReport {
            commits,
            refs: self.export_refs()?,
            ..Default::default()
        };
        let desired = self.refs.export_refs(&self.source, &self.mapper, &self.tags)?;

        info!(remote, endpoint = %transport.describe(), refs = desired.len(), "pushing");
        let mut conn = transport.connect(Service::ReceivePack).await?;
        let mut negotiator = TransportNegotiator::new(self.timeout());
        let outcome = negotiator.push(conn.as_mut(), &self.target, &desired, force).await?;
        drop(conn);

        let mut tracking = BTreeMap::new();
        for ref_name in &outcome.accepted {
            let Some(branch) = ref_name.strip_prefix(HEADS_PREFIX) else { continue };
            if let Some(id) = desired.get(ref_name) {
                tracking.insert(format!("{}{}/{}", REMOTES_PREFIX, remote, branch), *id);
            }
        }
        self.refs.apply_to_target(&mut self.target, &tracking, true)?;

        for (ref_name, reason) in outcome.rejected {
            report.refs.conflicts.push(SyncError::RefConflict { ref_name, reason });
        }
        report.refs.updated.extend(outcome.accepted);
        report.stats = outcome.stats;
        self.persist()?;
        Ok(report)
    }

    /// Re-export a mapped changeset from scratch and compare with the tree
    /// of its recorded target commit
    pub fn verify(&self, node: &NodeId) -> Result<VerifyReport> {
        let commit = self
            .mapper
            .lookup_forward(node)?
            .ok_or_else(|| SyncError::consistency(format!("{} has no target commit", node)))?;
        let recorded_tree = self.target.commit(&commit)?.tree;
        let manifest = self.source.manifest_of(node)?;
        let mut scratch = MemoryTargetStore::new();
        let expected_tree = export_full(&self.source, &mut scratch, &manifest)?;
        if expected_tree != recorded_tree {
            warn!(node = %node, commit = %commit, "recorded tree differs from a fresh export");
        }
        Ok(VerifyReport {
            node: *node,
            commit,
            expected_tree,
            recorded_tree,
        })
    }
}

impl<S: SourceStore, T: TargetStore + Sync> SyncSession<S, T> {
    /// Fetch a remote into a scratch layer over the target store.
    ///
    /// Returns the scratch store and the fetched commits not yet imported,
    /// parents first, ready for an `OverlayView`. Nothing is persisted.
    pub async fn incoming<Tr: Transport + ?Sized>(
        &self,
        transport: &Tr,
    ) -> Result<(LayeredTargetStore<'_, T>, Vec<ObjectId>)> {
        let mut scratch = LayeredTargetStore::new(&self.target);
        let mut conn = transport.connect(Service::UploadPack).await?;
        let mut negotiator = TransportNegotiator::new(self.timeout());
        let outcome = negotiator.fetch(conn.as_mut(), &mut scratch).await?;
        drop(conn);

        let mut tips = Vec::new();
        for id in outcome.refs.values() {
            tips.push(scratch.peel(id)?);
        }
        let pending = unimported_commits(&scratch, &self.mapper, &tips)?;
        let order = topo_sort(&pending)?;
        Ok((scratch, order))
    }
}

/// Unmapped commits reachable from `tips`, each with its real parents.
///
/// Octopus chains are seen through: the chain head lists the flattened
/// parents and the synthetic intermediates are never returned.
fn unimported_commits<T: TargetStore>(
    target: &T,
    mapper: &ObjectMapper,
    tips: &[ObjectId],
) -> Result<Vec<(ObjectId, Vec<ObjectId>)>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<ObjectId> = tips.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) || mapper.lookup_backward(&id)?.is_some() {
            continue;
        }
        let commit = match target.get(&id)? {
            Some(Object::Commit(commit)) => commit,
            // tags on trees or blobs have no changeset
            _ => continue,
        };
        let parents = match octopus::marker(&commit) {
            Some(OctopusMarker::Octopus) => {
                debug!(commit = %id, "skipping octopus intermediate");
                stack.extend(commit.parents.iter().copied());
                continue;
            }
            Some(OctopusMarker::OctopusDone) => octopus::flatten(target, &commit)?,
            None => commit.parents.clone(),
        };
        stack.extend(parents.iter().copied());
        out.push((id, parents));
    }
    out.reverse();
    Ok(out)
}
