//! Incremental tree export.
//!
//! `IncrementalTreeExporter` keeps the directory state of the last exported
//! snapshot in memory and, for each new snapshot, touches only the
//! directories on the path of a changed file. Directory hashes are recomputed
//! deepest first so every child is final before its parent is hashed.

use crate::error::{Result, SyncError};
use crate::object::{Blob, FileMode, Object, ObjectId, Tree, TreeEntry};
use crate::source::{Manifest, NodeId};
use crate::storage::{SourceStore, TargetStore};
use crate::subrepo;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

const BLOB_CACHE_SIZE: usize = 8192;

type DirEntries = BTreeMap<String, (FileMode, ObjectId)>;

/// Subrepo-derived tree content of one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
struct SubrepoState {
    gitlinks: BTreeMap<String, ObjectId>,
    gitmodules: Option<Vec<u8>>,
}

impl SubrepoState {
    fn from_manifest<S: SourceStore>(source: &S, manifest: &Manifest) -> Result<Self> {
        let hgsub = match manifest.get(subrepo::HGSUB) {
            Some(entry) => read_file(source, &entry.node)?,
            None => return Ok(Self::default()),
        };
        let state = match manifest.get(subrepo::HGSUBSTATE) {
            Some(entry) => subrepo::parse_hgsubstate(&read_file(source, &entry.node)?),
            None => BTreeMap::new(),
        };
        let subs = subrepo::parse_hgsub(&hgsub);
        let gitmodules = subs
            .values()
            .any(|s| s.is_git())
            .then(|| subrepo::render_gitmodules(&subs));
        Ok(Self {
            gitlinks: subrepo::export_gitlinks(&subs, &state),
            gitmodules,
        })
    }
}

fn read_file<S: SourceStore>(source: &S, node: &NodeId) -> Result<Vec<u8>> {
    source
        .get_file(node)?
        .map(|f| f.data)
        .ok_or_else(|| SyncError::consistency(format!("file revision {} missing from source store", node)))
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Converts successive source snapshots into target trees
pub struct IncrementalTreeExporter {
    manifest: Manifest,
    subrepos: SubrepoState,
    trees: HashMap<String, DirEntries>,
    dirty: HashSet<String>,
    blob_cache: LruCache<NodeId, ObjectId>,
    root: ObjectId,
    cancel: Option<Arc<AtomicBool>>,
}

impl IncrementalTreeExporter {
    /// Exporter starting from the empty snapshot
    pub fn new() -> Self {
        let mut trees = HashMap::new();
        trees.insert(String::new(), DirEntries::new());
        Self {
            manifest: Manifest::new(),
            subrepos: SubrepoState::default(),
            trees,
            dirty: HashSet::new(),
            blob_cache: LruCache::new(NonZeroUsize::new(BLOB_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN)),
            root: Tree::new().id(),
            cancel: None,
        }
    }

    /// Exporter seeded from an already exported parent.
    ///
    /// `parent_tree` is walked once to build the directory state;
    /// `parent_manifest` is the snapshot it was exported from.
    pub fn seeded<S: SourceStore, T: TargetStore>(
        source: &S,
        target: &T,
        parent_tree: ObjectId,
        parent_manifest: Manifest,
    ) -> Result<Self> {
        let mut exporter = Self::new();
        exporter.trees.clear();

        let mut stack = vec![(String::new(), parent_tree)];
        while let Some((dir, id)) = stack.pop() {
            let tree = target.tree(&id)?;
            let mut entries = DirEntries::new();
            for entry in tree.entries.values() {
                if entry.mode == FileMode::Tree {
                    stack.push((join_path(&dir, &entry.name), entry.id));
                }
                entries.insert(entry.name.clone(), (entry.mode, entry.id));
            }
            exporter.trees.insert(dir, entries);
        }

        exporter.subrepos = SubrepoState::from_manifest(source, &parent_manifest)?;
        exporter.manifest = parent_manifest;
        exporter.root = parent_tree;
        debug!(root = %parent_tree, dirs = exporter.trees.len(), "seeded tree exporter");
        Ok(exporter)
    }

    /// Abort long recomputations when the flag is raised
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Root tree of the last exported snapshot
    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// Last exported snapshot
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Export `manifest`, writing only new trees and blobs, and return the
    /// new root tree id.
    pub fn update<S: SourceStore, T: TargetStore>(
        &mut self,
        source: &S,
        target: &mut T,
        manifest: &Manifest,
    ) -> Result<ObjectId> {
        let diff = self.manifest.diff(manifest);
        trace!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            "exporting snapshot diff"
        );

        let touches_subrepos = diff
            .paths()
            .iter()
            .any(|p| p == subrepo::HGSUB || p == subrepo::HGSUBSTATE);
        let subrepos = if touches_subrepos {
            SubrepoState::from_manifest(source, manifest)?
        } else {
            self.subrepos.clone()
        };

        for path in &diff.removed {
            self.check_cancel()?;
            self.remove_path(path);
        }
        for (path, id) in &self.subrepos.gitlinks.clone() {
            if subrepos.gitlinks.get(path) != Some(id) {
                self.remove_path(path);
            }
        }
        if self.subrepos.gitmodules.is_some() && subrepos.gitmodules.is_none() {
            self.remove_path(subrepo::GITMODULES);
        }

        for path in diff.added.iter().chain(&diff.modified) {
            self.check_cancel()?;
            let entry = manifest
                .get(path)
                .ok_or_else(|| SyncError::consistency(format!("{} vanished from manifest", path)))?;
            let cached = self.blob_cache.get(&entry.node).copied();
            let id = match cached {
                Some(id) => id,
                None => {
                    let data = read_file(source, &entry.node)?;
                    let id = target.put(&Object::Blob(Blob::new(data)))?;
                    self.blob_cache.put(entry.node, id);
                    id
                }
            };
            self.set_path(path, FileMode::from_flags(&entry.flags), id);
        }
        for (path, id) in &subrepos.gitlinks {
            if self.subrepos.gitlinks.get(path) != Some(id) {
                self.set_path(path, FileMode::Gitlink, *id);
            }
        }
        if let Some(data) = &subrepos.gitmodules {
            if self.subrepos.gitmodules.as_ref() != Some(data) {
                let id = target.put(&Object::Blob(Blob::new(data.clone())))?;
                self.set_path(subrepo::GITMODULES, FileMode::Regular, id);
            }
        }

        self.flush(target)?;
        self.manifest = manifest.clone();
        self.subrepos = subrepos;
        Ok(self.root)
    }

    fn mark_dirty(&mut self, dir: &str) {
        let mut dir = dir.to_string();
        loop {
            let done = dir.is_empty();
            let parent = split_path(&dir).0.to_string();
            self.dirty.insert(dir);
            if done {
                break;
            }
            dir = parent;
        }
    }

    /// Drop a directory's state and everything below it
    fn drop_subtree(&mut self, dir: &str) {
        let prefix = format!("{}/", dir);
        self.trees.retain(|d, _| d != dir && !d.starts_with(&prefix));
        self.dirty.retain(|d| d != dir && !d.starts_with(&prefix));
    }

    fn remove_path(&mut self, path: &str) {
        let (dir, name) = split_path(path);
        let removed = self.trees.get_mut(dir).and_then(|entries| entries.remove(name));
        match removed {
            Some((FileMode::Tree, _)) => self.drop_subtree(path),
            Some(_) => {}
            None => return,
        }
        self.mark_dirty(dir);

        // Prune directories left empty, all the way up.
        let mut dir = dir.to_string();
        while !dir.is_empty() && self.trees.get(&dir).map(|e| e.is_empty()).unwrap_or(false) {
            self.trees.remove(&dir);
            self.dirty.remove(&dir);
            let (parent, name) = split_path(&dir);
            let (parent, name) = (parent.to_string(), name.to_string());
            if let Some(entries) = self.trees.get_mut(&parent) {
                entries.remove(&name);
            }
            self.dirty.insert(parent.clone());
            dir = parent;
        }
    }

    fn set_path(&mut self, path: &str, mode: FileMode, id: ObjectId) {
        let (dir, name) = split_path(path);

        // Make sure every ancestor is a directory, replacing files in the way.
        let mut current = String::new();
        for component in dir.split('/').filter(|c| !c.is_empty()) {
            let child = join_path(&current, component);
            let existing = self
                .trees
                .entry(current.clone())
                .or_default()
                .get(component)
                .map(|(m, _)| *m);
            if existing != Some(FileMode::Tree) {
                if let Some(entries) = self.trees.get_mut(&current) {
                    entries.insert(component.to_string(), (FileMode::Tree, ObjectId::NULL));
                }
                self.trees.insert(child.clone(), DirEntries::new());
            }
            current = child;
        }

        let entries = self.trees.entry(dir.to_string()).or_default();
        let was_tree = matches!(entries.get(name), Some((FileMode::Tree, _)));
        entries.insert(name.to_string(), (mode, id));
        if was_tree {
            self.drop_subtree(path);
        }
        self.mark_dirty(dir);
    }

    /// Recompute dirty directories deepest first and store their trees
    fn flush<T: TargetStore>(&mut self, target: &mut T) -> Result<()> {
        let mut dirty: Vec<String> = self.dirty.drain().collect();
        dirty.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        for dir in dirty {
            let Some(entries) = self.trees.get(&dir) else { continue };
            let mut tree = Tree::new();
            for (name, (mode, id)) in entries {
                tree.insert(TreeEntry::new(name.clone(), *mode, *id));
            }
            let id = target.put(&Object::Tree(tree))?;
            if dir.is_empty() {
                self.root = id;
            } else {
                let (parent, name) = split_path(&dir);
                if let Some(entries) = self.trees.get_mut(parent) {
                    entries.insert(name.to_string(), (FileMode::Tree, id));
                }
            }
        }
        Ok(())
    }
}

impl Default for IncrementalTreeExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Export a snapshot from scratch
pub fn export_full<S: SourceStore, T: TargetStore>(
    source: &S,
    target: &mut T,
    manifest: &Manifest,
) -> Result<ObjectId> {
    IncrementalTreeExporter::new().update(source, target, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FileRevision, ManifestEntry};
    use crate::storage::{MemorySourceStore, MemoryTargetStore};
    use proptest::prelude::*;

    fn add_file(source: &mut MemorySourceStore, manifest: &mut Manifest, path: &str, data: &[u8], flags: &str) {
        let node = source
            .put_file(&FileRevision::new(data.to_vec(), (NodeId::NULL, NodeId::NULL)))
            .unwrap();
        manifest.insert(path, ManifestEntry::new(node, flags));
    }

    fn paths_of(target: &MemoryTargetStore, root: ObjectId) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), root)];
        while let Some((dir, id)) = stack.pop() {
            let tree = target.tree(&id).unwrap();
            assert!(dir.is_empty() || !tree.is_empty(), "empty tree referenced at {}", dir);
            for entry in tree.entries.values() {
                let path = join_path(&dir, &entry.name);
                if entry.mode == FileMode::Tree {
                    stack.push((path, entry.id));
                } else {
                    out.push(path);
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_incremental_matches_full_export() {
        let mut source = MemorySourceStore::new();
        let mut target = MemoryTargetStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, "a/b/c.txt", b"c", "");
        add_file(&mut source, &mut m, "a/d.txt", b"d", "x");
        add_file(&mut source, &mut m, "top", b"t", "");

        let mut exporter = IncrementalTreeExporter::new();
        exporter.update(&source, &mut target, &m).unwrap();

        m.remove("a/d.txt");
        add_file(&mut source, &mut m, "a/b/e.txt", b"e", "");
        let incremental = exporter.update(&source, &mut target, &m).unwrap();
        let full = export_full(&source, &mut MemoryTargetStore::new(), &m).unwrap();
        assert_eq!(incremental, full);
    }

    #[test]
    fn test_removing_last_file_prunes_directories() {
        let mut source = MemorySourceStore::new();
        let mut target = MemoryTargetStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, "keep", b"k", "");
        add_file(&mut source, &mut m, "deep/er/file", b"f", "");

        let mut exporter = IncrementalTreeExporter::new();
        exporter.update(&source, &mut target, &m).unwrap();
        m.remove("deep/er/file");
        let root = exporter.update(&source, &mut target, &m).unwrap();

        assert_eq!(paths_of(&target, root), vec!["keep"]);
        assert!(target.tree(&root).unwrap().get("deep").is_none());
    }

    #[test]
    fn test_file_to_directory_switch() {
        let mut source = MemorySourceStore::new();
        let mut target = MemoryTargetStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, "a", b"file", "");
        let mut exporter = IncrementalTreeExporter::new();
        exporter.update(&source, &mut target, &m).unwrap();

        m.remove("a");
        add_file(&mut source, &mut m, "a/inner", b"now a dir", "");
        let root = exporter.update(&source, &mut target, &m).unwrap();
        assert_eq!(target.tree(&root).unwrap().get("a").unwrap().mode, FileMode::Tree);
        assert_eq!(root, export_full(&source, &mut MemoryTargetStore::new(), &m).unwrap());

        m.remove("a/inner");
        add_file(&mut source, &mut m, "a", b"file again", "l");
        let root = exporter.update(&source, &mut target, &m).unwrap();
        assert_eq!(target.tree(&root).unwrap().get("a").unwrap().mode, FileMode::Symlink);
        assert_eq!(paths_of(&target, root), vec!["a"]);
    }

    #[test]
    fn test_seeded_exporter_continues_from_parent() {
        let mut source = MemorySourceStore::new();
        let mut target = MemoryTargetStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, "src/lib.rs", b"lib", "");
        add_file(&mut source, &mut m, "src/bin/main.rs", b"main", "");
        let root = export_full(&source, &mut target, &m).unwrap();

        let mut exporter = IncrementalTreeExporter::seeded(&source, &target, root, m.clone()).unwrap();
        add_file(&mut source, &mut m, "README", b"readme", "");
        let next = exporter.update(&source, &mut target, &m).unwrap();
        assert_eq!(next, export_full(&source, &mut MemoryTargetStore::new(), &m).unwrap());
    }

    #[test]
    fn test_git_subrepo_becomes_gitlink() {
        let mut source = MemorySourceStore::new();
        let mut target = MemoryTargetStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, ".hgsub", b"lib = [git]https://example.com/lib.git\n", "");
        let pin = "ab".repeat(20);
        add_file(&mut source, &mut m, ".hgsubstate", format!("{} lib\n", pin).as_bytes(), "");

        let root = export_full(&source, &mut target, &m).unwrap();
        let tree = target.tree(&root).unwrap();
        let link = tree.get("lib").unwrap();
        assert_eq!(link.mode, FileMode::Gitlink);
        assert_eq!(link.id.to_hex(), pin);
        assert!(tree.get(".gitmodules").is_some());

        // dropping the subrepo removes the link and .gitmodules
        let mut exporter = IncrementalTreeExporter::seeded(&source, &target, root, m.clone()).unwrap();
        m.remove(".hgsub");
        m.remove(".hgsubstate");
        let root = exporter.update(&source, &mut target, &m).unwrap();
        assert_eq!(root, Tree::new().id());
    }

    #[test]
    fn test_cancel_flag_aborts_update() {
        let mut source = MemorySourceStore::new();
        let mut m = Manifest::new();
        add_file(&mut source, &mut m, "f", b"f", "");
        let flag = Arc::new(AtomicBool::new(true));
        let mut exporter = IncrementalTreeExporter::new();
        exporter.set_cancel_flag(flag);
        let err = exporter.update(&source, &mut MemoryTargetStore::new(), &m).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    fn arb_path() -> impl Strategy<Value = String> {
        proptest::collection::vec(prop_oneof!["a", "b", "c"], 1..4).prop_map(|parts| parts.join("/"))
    }

    proptest! {
        #[test]
        fn prop_incremental_equals_full(steps in proptest::collection::vec(
            proptest::collection::vec((arb_path(), proptest::option::of(0u8..4)), 1..6), 1..6)
        ) {
            let mut source = MemorySourceStore::new();
            let mut target = MemoryTargetStore::new();
            let mut exporter = IncrementalTreeExporter::new();
            let mut m = Manifest::new();
            for step in steps {
                for (path, content) in step {
                    match content {
                        Some(c) => {
                            // a path may not be both a file and a directory
                            let prefix = format!("{}/", path);
                            let conflicts: Vec<String> = m
                                .entries
                                .keys()
                                .filter(|p| p.starts_with(&prefix) || path.starts_with(&format!("{}/", p)))
                                .cloned()
                                .collect();
                            for p in conflicts {
                                m.remove(&p);
                            }
                            add_file(&mut source, &mut m, &path, &[c], if c == 3 { "x" } else { "" });
                        }
                        None => {
                            m.remove(&path);
                        }
                    }
                }
                let incremental = exporter.update(&source, &mut target, &m).unwrap();
                let full = export_full(&source, &mut MemoryTargetStore::new(), &m).unwrap();
                prop_assert_eq!(incremental, full);
            }
        }
    }
}
