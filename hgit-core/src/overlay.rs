//! Read-only source-side view of target commits that have not been imported.
//!
//! Nothing is written to the source store. Metadata is decoded on demand and
//! manifest lookups walk the target tree directly, so previewing an incoming
//! change costs only the objects actually inspected.

use crate::error::{Result, SyncError};
use crate::footer::OctopusMarker;
use crate::mapping::ObjectMapper;
use crate::object::{FileMode, ObjectId};
use crate::octopus;
use crate::source::NodeId;
use crate::storage::TargetStore;
use crate::translate::CommitTranslator;
use crate::treediff;
use std::collections::{BTreeMap, HashSet};

/// Overlay node for a target commit: the commit id bytes reused as a node id
pub fn overlay_node(id: &ObjectId) -> NodeId {
    NodeId::new(*id.as_bytes())
}

fn commit_of(node: &NodeId) -> ObjectId {
    ObjectId::new(*node.as_bytes())
}

pub struct OverlayView<'a, T: TargetStore> {
    target: &'a T,
    mapper: &'a ObjectMapper,
    translator: CommitTranslator,
    order: Vec<ObjectId>,
    members: HashSet<ObjectId>,
}

impl<'a, T: TargetStore> OverlayView<'a, T> {
    pub fn new(
        target: &'a T,
        mapper: &'a ObjectMapper,
        translator: CommitTranslator,
        commits: impl IntoIterator<Item = ObjectId>,
    ) -> Self {
        let order: Vec<ObjectId> = commits.into_iter().collect();
        let members = order.iter().copied().collect();
        Self {
            target,
            mapper,
            translator,
            order,
            members,
        }
    }

    /// Overlay nodes in the order the commits were given
    pub fn nodes(&self) -> Vec<NodeId> {
        self.order.iter().map(overlay_node).collect()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(&commit_of(node))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn node_for(&self, id: ObjectId) -> Result<NodeId> {
        if self.members.contains(&id) {
            return Ok(overlay_node(&id));
        }
        self.mapper
            .lookup_backward(&id)?
            .ok_or_else(|| SyncError::consistency(format!("parent {} is neither mapped nor in the overlay", id)))
    }

    pub fn changeset(&self, node: &NodeId) -> Result<OverlayChangeset<'a, T>> {
        let id = commit_of(node);
        if !self.members.contains(&id) {
            return Err(SyncError::consistency(format!("{} is not an overlay node", node)));
        }
        let commit = self.target.commit(&id)?;
        let meta = self.translator.decode_metadata(&commit)?;

        let parent_commits = if meta.merge == Some(OctopusMarker::OctopusDone) {
            octopus::flatten(self.target, &commit)?
        } else {
            commit.parents.clone()
        };
        let parents = parent_commits
            .iter()
            .map(|p| self.node_for(*p))
            .collect::<Result<Vec<_>>>()?;

        let p1_tree = match parent_commits.first() {
            Some(p) => Some(self.target.commit(p)?.tree),
            None => None,
        };
        let files = treediff::diff(self.target, p1_tree, commit.tree)?
            .into_iter()
            .map(|c| c.path)
            .collect();

        Ok(OverlayChangeset {
            node: *node,
            commit: id,
            parents,
            branch: meta.branch(),
            user: meta.user,
            date: (meta.time, meta.tz_offset),
            description: meta.description,
            extras: meta.extras,
            files,
            tree: commit.tree,
            target: self.target,
        })
    }
}

/// A target commit presented as a changeset
pub struct OverlayChangeset<'a, T: TargetStore> {
    pub node: NodeId,
    /// Target commit backing this changeset
    pub commit: ObjectId,
    pub parents: Vec<NodeId>,
    pub user: Vec<u8>,
    /// Unix seconds and offset in seconds west of UTC
    pub date: (i64, i32),
    pub description: Vec<u8>,
    pub branch: String,
    pub extras: BTreeMap<String, Vec<u8>>,
    /// Paths changed against the first parent
    pub files: Vec<String>,
    tree: ObjectId,
    target: &'a T,
}

impl<'a, T: TargetStore> OverlayChangeset<'a, T> {
    pub fn manifest(&self) -> OverlayManifest<'a, T> {
        OverlayManifest {
            target: self.target,
            root: self.tree,
        }
    }
}

/// Manifest lookups answered from a target tree
pub struct OverlayManifest<'a, T: TargetStore> {
    target: &'a T,
    root: ObjectId,
}

impl<T: TargetStore> OverlayManifest<'_, T> {
    /// Blob id and flags of a file. Gitlinks are subrepository state, not files.
    pub fn get(&self, path: &str) -> Result<Option<(ObjectId, &'static str)>> {
        match treediff::lookup(self.target, self.root, path)? {
            Some((FileMode::Gitlink, _)) | None => Ok(None),
            Some((mode, id)) => Ok(Some((id, mode.to_flags()))),
        }
    }

    pub fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    pub fn flags(&self, path: &str) -> Result<Option<&'static str>> {
        Ok(self.get(path)?.map(|(_, flags)| flags))
    }

    pub fn paths(&self) -> Result<Vec<String>> {
        Ok(treediff::flatten(self.target, self.root)?
            .into_iter()
            .filter(|(_, (mode, _))| *mode != FileMode::Gitlink)
            .map(|(path, _)| path)
            .collect())
    }

    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.get(path)? {
            Some((id, _)) => Ok(self.target.get_blob(&id)?.map(|b| b.data)),
            None => Ok(None),
        }
    }
}
