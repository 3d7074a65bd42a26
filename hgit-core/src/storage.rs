//! Store backends for the two version-control systems
//!
//! The engine only talks to the `SourceStore` and `TargetStore` traits.
//! Memory backends serve tests and overlay previews; disk backends keep
//! zstd-compressed loose objects under `objects/<2 hex>/<38 hex>`.

use crate::error::{Result as SyncResult, SyncError};
use crate::object::{Blob, Commit, Object, ObjectId, ObjectKind, Tag, Tree};
use crate::source::{Changeset, FileRevision, Manifest, NodeId};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt object {0}")]
    Corrupt(String),
}

/// Source-system store (changesets, manifests, file revisions, bookmarks)
pub trait SourceStore: Send {
    fn get_changeset(&self, node: &NodeId) -> Result<Option<Changeset>>;
    fn put_changeset(&mut self, changeset: &Changeset) -> Result<NodeId>;
    fn get_manifest(&self, node: &NodeId) -> Result<Option<Manifest>>;
    fn put_manifest(&mut self, manifest: &Manifest) -> Result<NodeId>;
    fn get_file(&self, node: &NodeId) -> Result<Option<FileRevision>>;
    fn put_file(&mut self, file: &FileRevision) -> Result<NodeId>;

    /// All changeset nodes in insertion order
    fn changesets(&self) -> Result<Vec<NodeId>>;

    fn bookmarks(&self) -> Result<BTreeMap<String, NodeId>>;
    fn set_bookmark(&mut self, name: &str, node: NodeId) -> Result<()>;
    fn delete_bookmark(&mut self, name: &str) -> Result<()>;

    fn contains_changeset(&self, node: &NodeId) -> Result<bool> {
        Ok(self.get_changeset(node)?.is_some())
    }

    /// Changeset that must exist
    fn changeset(&self, node: &NodeId) -> SyncResult<Changeset> {
        self.get_changeset(node)?
            .ok_or_else(|| SyncError::consistency(format!("changeset {} missing from source store", node)))
    }

    /// Manifest of a changeset; the null node yields the empty manifest
    fn manifest_of(&self, node: &NodeId) -> SyncResult<Manifest> {
        if node.is_null() {
            return Ok(Manifest::new());
        }
        let changeset = self.changeset(node)?;
        self.get_manifest(&changeset.manifest)?.ok_or_else(|| {
            SyncError::consistency(format!("manifest {} of {} missing", changeset.manifest, node))
        })
    }

    /// Changesets that are not a parent of any other changeset
    fn heads(&self) -> Result<Vec<NodeId>> {
        let all = self.changesets()?;
        let mut parents = HashSet::new();
        for node in &all {
            if let Some(cs) = self.get_changeset(node)? {
                parents.extend(cs.parents.iter().copied());
            }
        }
        Ok(all.into_iter().filter(|n| !parents.contains(n)).collect())
    }

    /// Heads of each named branch
    fn branch_heads(&self) -> Result<BTreeMap<String, Vec<NodeId>>> {
        let all = self.changesets()?;
        let mut branch_of = HashMap::new();
        for node in &all {
            if let Some(cs) = self.get_changeset(node)? {
                branch_of.insert(*node, (cs.branch(), cs.parents));
            }
        }
        let mut has_same_branch_child = HashSet::new();
        for (branch, parents) in branch_of.values() {
            for parent in parents {
                if branch_of.get(parent).map(|(b, _)| b == branch).unwrap_or(false) {
                    has_same_branch_child.insert(*parent);
                }
            }
        }
        let mut heads: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for node in all {
            if has_same_branch_child.contains(&node) {
                continue;
            }
            if let Some((branch, _)) = branch_of.get(&node) {
                heads.entry(branch.clone()).or_default().push(node);
            }
        }
        Ok(heads)
    }

    /// Whether `ancestor` is reachable from `descendant` (inclusive)
    fn is_ancestor(&self, ancestor: &NodeId, descendant: &NodeId) -> Result<bool> {
        let mut queue = VecDeque::from([*descendant]);
        let mut seen = HashSet::new();
        while let Some(node) = queue.pop_front() {
            if node == *ancestor {
                return Ok(true);
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(cs) = self.get_changeset(&node)? {
                queue.extend(cs.parents.iter().copied());
            }
        }
        Ok(false)
    }
}

/// Target-system store (commits, trees, blobs, tags, refs)
pub trait TargetStore: Send {
    fn get_raw(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>>;
    fn put_raw(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId>;
    fn contains(&self, id: &ObjectId) -> Result<bool>;

    fn refs(&self) -> Result<BTreeMap<String, ObjectId>>;
    fn set_ref(&mut self, name: &str, id: ObjectId) -> Result<()>;
    fn delete_ref(&mut self, name: &str) -> Result<()>;

    fn get(&self, id: &ObjectId) -> SyncResult<Option<Object>> {
        match self.get_raw(id)? {
            Some((kind, body)) => Ok(Some(Object::parse(kind, &body)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, object: &Object) -> Result<ObjectId> {
        self.put_raw(object.kind(), &object.body())
    }

    fn get_commit(&self, id: &ObjectId) -> SyncResult<Option<Commit>> {
        match self.get(id)? {
            Some(Object::Commit(commit)) => Ok(Some(commit)),
            Some(_) => Err(StorageError::Corrupt(format!("{} is not a commit", id)).into()),
            None => Ok(None),
        }
    }

    fn get_tree(&self, id: &ObjectId) -> SyncResult<Option<Tree>> {
        match self.get(id)? {
            Some(Object::Tree(tree)) => Ok(Some(tree)),
            Some(_) => Err(StorageError::Corrupt(format!("{} is not a tree", id)).into()),
            None => Ok(None),
        }
    }

    fn get_blob(&self, id: &ObjectId) -> SyncResult<Option<Blob>> {
        match self.get(id)? {
            Some(Object::Blob(blob)) => Ok(Some(blob)),
            Some(_) => Err(StorageError::Corrupt(format!("{} is not a blob", id)).into()),
            None => Ok(None),
        }
    }

    fn get_tag(&self, id: &ObjectId) -> SyncResult<Option<Tag>> {
        match self.get(id)? {
            Some(Object::Tag(tag)) => Ok(Some(tag)),
            Some(_) => Err(StorageError::Corrupt(format!("{} is not a tag", id)).into()),
            None => Ok(None),
        }
    }

    /// Commit that must exist
    fn commit(&self, id: &ObjectId) -> SyncResult<Commit> {
        self.get_commit(id)?
            .ok_or_else(|| SyncError::consistency(format!("commit {} missing from target store", id)))
    }

    /// Tree that must exist
    fn tree(&self, id: &ObjectId) -> SyncResult<Tree> {
        self.get_tree(id)?
            .ok_or_else(|| SyncError::consistency(format!("tree {} missing from target store", id)))
    }

    /// Follow tag objects down to the object they point at
    fn peel(&self, id: &ObjectId) -> SyncResult<ObjectId> {
        let mut current = *id;
        for _ in 0..16 {
            match self.get_raw(&current)? {
                Some((ObjectKind::Tag, body)) => current = Tag::from_bytes(&body)?.object,
                _ => return Ok(current),
            }
        }
        Err(SyncError::consistency(format!("tag chain from {} is too deep", id)))
    }

    /// Whether `ancestor` is reachable from `descendant` (inclusive)
    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> SyncResult<bool> {
        let mut queue = VecDeque::from([*descendant]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if id == *ancestor {
                return Ok(true);
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(commit) = self.get_commit(&id)? {
                queue.extend(commit.parents);
            }
        }
        Ok(false)
    }
}

/// In-memory source store
#[derive(Debug, Default, Clone)]
pub struct MemorySourceStore {
    changesets: HashMap<NodeId, Changeset>,
    order: Vec<NodeId>,
    manifests: HashMap<NodeId, Manifest>,
    files: HashMap<NodeId, FileRevision>,
    bookmarks: BTreeMap<String, NodeId>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceStore for MemorySourceStore {
    fn get_changeset(&self, node: &NodeId) -> Result<Option<Changeset>> {
        Ok(self.changesets.get(node).cloned())
    }

    fn put_changeset(&mut self, changeset: &Changeset) -> Result<NodeId> {
        let node = changeset.node();
        if self.changesets.insert(node, changeset.clone()).is_none() {
            self.order.push(node);
        }
        Ok(node)
    }

    fn get_manifest(&self, node: &NodeId) -> Result<Option<Manifest>> {
        Ok(self.manifests.get(node).cloned())
    }

    fn put_manifest(&mut self, manifest: &Manifest) -> Result<NodeId> {
        let node = manifest.node();
        self.manifests.insert(node, manifest.clone());
        Ok(node)
    }

    fn get_file(&self, node: &NodeId) -> Result<Option<FileRevision>> {
        Ok(self.files.get(node).cloned())
    }

    fn put_file(&mut self, file: &FileRevision) -> Result<NodeId> {
        let node = file.node();
        self.files.insert(node, file.clone());
        Ok(node)
    }

    fn changesets(&self) -> Result<Vec<NodeId>> {
        Ok(self.order.clone())
    }

    fn bookmarks(&self) -> Result<BTreeMap<String, NodeId>> {
        Ok(self.bookmarks.clone())
    }

    fn set_bookmark(&mut self, name: &str, node: NodeId) -> Result<()> {
        self.bookmarks.insert(name.to_string(), node);
        Ok(())
    }

    fn delete_bookmark(&mut self, name: &str) -> Result<()> {
        self.bookmarks.remove(name);
        Ok(())
    }
}

/// In-memory target store
#[derive(Debug, Default, Clone)]
pub struct MemoryTargetStore {
    objects: HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    refs: BTreeMap<String, ObjectId>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl TargetStore for MemoryTargetStore {
    fn get_raw(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        Ok(self.objects.get(id).cloned())
    }

    fn put_raw(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_object(kind, body);
        self.objects.entry(id).or_insert_with(|| (kind, body.to_vec()));
        Ok(id)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.contains_key(id))
    }

    fn refs(&self) -> Result<BTreeMap<String, ObjectId>> {
        Ok(self.refs.clone())
    }

    fn set_ref(&mut self, name: &str, id: ObjectId) -> Result<()> {
        self.refs.insert(name.to_string(), id);
        Ok(())
    }

    fn delete_ref(&mut self, name: &str) -> Result<()> {
        self.refs.remove(name);
        Ok(())
    }
}

/// Scratch store layered over a read-only base.
///
/// Reads fall through to `base`; writes and ref changes stay in memory, so
/// fetched objects can be inspected without touching the base store.
pub struct LayeredTargetStore<'a, T: TargetStore + Sync> {
    base: &'a T,
    upper: MemoryTargetStore,
    deleted_refs: HashSet<String>,
}

impl<'a, T: TargetStore + Sync> LayeredTargetStore<'a, T> {
    pub fn new(base: &'a T) -> Self {
        Self {
            base,
            upper: MemoryTargetStore::new(),
            deleted_refs: HashSet::new(),
        }
    }

    /// Objects written to the scratch layer
    pub fn added(&self) -> usize {
        self.upper.len()
    }
}

impl<T: TargetStore + Sync> TargetStore for LayeredTargetStore<'_, T> {
    fn get_raw(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        match self.upper.get_raw(id)? {
            Some(found) => Ok(Some(found)),
            None => self.base.get_raw(id),
        }
    }

    fn put_raw(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_object(kind, body);
        if self.base.contains(&id)? {
            return Ok(id);
        }
        self.upper.put_raw(kind, body)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.upper.contains(id)? || self.base.contains(id)?)
    }

    fn refs(&self) -> Result<BTreeMap<String, ObjectId>> {
        let mut refs = self.base.refs()?;
        refs.retain(|name, _| !self.deleted_refs.contains(name));
        refs.extend(self.upper.refs()?);
        Ok(refs)
    }

    fn set_ref(&mut self, name: &str, id: ObjectId) -> Result<()> {
        self.deleted_refs.remove(name);
        self.upper.set_ref(name, id)
    }

    fn delete_ref(&mut self, name: &str) -> Result<()> {
        self.deleted_refs.insert(name.to_string());
        self.upper.delete_ref(name)
    }
}

/// Content-addressed loose object directory
#[derive(Debug, Clone)]
struct LooseObjects {
    root: PathBuf,
}

impl LooseObjects {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, hex: &str) -> PathBuf {
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn exists(&self, hex: &str) -> bool {
        self.path_for(hex).exists()
    }

    fn read(&self, hex: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(hex);
        if !path.exists() {
            return Ok(None);
        }
        let compressed = fs::read(&path)?;
        let data = zstd::decode_all(&compressed[..])
            .map_err(|e| StorageError::Corrupt(format!("{}: {}", hex, e)))?;
        Ok(Some(data))
    }

    fn write(&self, hex: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(hex);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let compressed = zstd::encode_all(data, 3)?;
        write_atomic(&path, &compressed)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_json_map(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn write_json_map(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(map).map_err(|e| StorageError::Serialization(e.to_string()))?;
    write_atomic(path, data.as_bytes())
}

/// Disk-backed source store
pub struct DiskSourceStore {
    root: PathBuf,
    changesets: LooseObjects,
    manifests: LooseObjects,
    files: LooseObjects,
}

impl DiskSourceStore {
    /// Open or create a source store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            changesets: LooseObjects::new(root.join("changesets")),
            manifests: LooseObjects::new(root.join("manifests")),
            files: LooseObjects::new(root.join("files")),
        })
    }

    fn changelog_path(&self) -> PathBuf {
        self.root.join("changelog.idx")
    }

    fn bookmarks_path(&self) -> PathBuf {
        self.root.join("bookmarks.json")
    }

    fn read_bincode<T: serde::de::DeserializeOwned>(objects: &LooseObjects, hex: &str) -> Result<Option<T>> {
        match objects.read(hex)? {
            Some(data) => bincode::deserialize(&data)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_bincode<T: serde::Serialize>(objects: &LooseObjects, hex: &str, value: &T) -> Result<()> {
        let data = bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        objects.write(hex, &data)
    }
}

impl SourceStore for DiskSourceStore {
    fn get_changeset(&self, node: &NodeId) -> Result<Option<Changeset>> {
        Self::read_bincode(&self.changesets, &node.to_hex())
    }

    fn put_changeset(&mut self, changeset: &Changeset) -> Result<NodeId> {
        let node = changeset.node();
        let hex = node.to_hex();
        if !self.changesets.exists(&hex) {
            Self::write_bincode(&self.changesets, &hex, changeset)?;
            let mut index = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.changelog_path())?;
            writeln!(index, "{}", hex)?;
        }
        Ok(node)
    }

    fn get_manifest(&self, node: &NodeId) -> Result<Option<Manifest>> {
        Self::read_bincode(&self.manifests, &node.to_hex())
    }

    fn put_manifest(&mut self, manifest: &Manifest) -> Result<NodeId> {
        let node = manifest.node();
        Self::write_bincode(&self.manifests, &node.to_hex(), manifest)?;
        Ok(node)
    }

    fn get_file(&self, node: &NodeId) -> Result<Option<FileRevision>> {
        Self::read_bincode(&self.files, &node.to_hex())
    }

    fn put_file(&mut self, file: &FileRevision) -> Result<NodeId> {
        let node = file.node();
        Self::write_bincode(&self.files, &node.to_hex(), file)?;
        Ok(node)
    }

    fn changesets(&self) -> Result<Vec<NodeId>> {
        let path = self.changelog_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        fs::read_to_string(path)?
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| NodeId::from_hex(l).map_err(|e| StorageError::Corrupt(format!("changelog index: {}", e))))
            .collect()
    }

    fn bookmarks(&self) -> Result<BTreeMap<String, NodeId>> {
        read_json_map(&self.bookmarks_path())?
            .into_iter()
            .map(|(name, hex)| {
                NodeId::from_hex(&hex)
                    .map(|node| (name, node))
                    .map_err(|e| StorageError::Corrupt(format!("bookmark: {}", e)))
            })
            .collect()
    }

    fn set_bookmark(&mut self, name: &str, node: NodeId) -> Result<()> {
        let mut map = read_json_map(&self.bookmarks_path())?;
        map.insert(name.to_string(), node.to_hex());
        write_json_map(&self.bookmarks_path(), &map)
    }

    fn delete_bookmark(&mut self, name: &str) -> Result<()> {
        let mut map = read_json_map(&self.bookmarks_path())?;
        map.remove(name);
        write_json_map(&self.bookmarks_path(), &map)
    }
}

/// Disk-backed target store
pub struct DiskTargetStore {
    root: PathBuf,
    objects: LooseObjects,
}

impl DiskTargetStore {
    /// Open or create a target store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            objects: LooseObjects::new(root.join("objects")),
        })
    }

    fn refs_path(&self) -> PathBuf {
        self.root.join("refs.json")
    }
}

impl TargetStore for DiskTargetStore {
    fn get_raw(&self, id: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>> {
        let hex = id.to_hex();
        let data = match self.objects.read(&hex)? {
            Some(data) => data,
            None => return Ok(None),
        };
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StorageError::Corrupt(hex.clone()))?;
        let header = std::str::from_utf8(&data[..nul]).map_err(|_| StorageError::Corrupt(hex.clone()))?;
        let kind = header
            .split(' ')
            .next()
            .and_then(ObjectKind::parse)
            .ok_or_else(|| StorageError::Corrupt(hex.clone()))?;
        Ok(Some((kind, data[nul + 1..].to_vec())))
    }

    fn put_raw(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::for_object(kind, body);
        let mut data = format!("{} {}\0", kind.as_str(), body.len()).into_bytes();
        data.extend_from_slice(body);
        self.objects.write(&id.to_hex(), &data)?;
        Ok(id)
    }

    fn contains(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.exists(&id.to_hex()))
    }

    fn refs(&self) -> Result<BTreeMap<String, ObjectId>> {
        read_json_map(&self.refs_path())?
            .into_iter()
            .map(|(name, hex)| {
                ObjectId::from_hex(&hex)
                    .map(|id| (name, id))
                    .map_err(|e| StorageError::Corrupt(format!("ref: {}", e)))
            })
            .collect()
    }

    fn set_ref(&mut self, name: &str, id: ObjectId) -> Result<()> {
        let mut map = read_json_map(&self.refs_path())?;
        map.insert(name.to_string(), id.to_hex());
        write_json_map(&self.refs_path(), &map)
    }

    fn delete_ref(&mut self, name: &str) -> Result<()> {
        let mut map = read_json_map(&self.refs_path())?;
        map.remove(name);
        write_json_map(&self.refs_path(), &map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Blob;
    use crate::source::ManifestEntry;

    fn changeset(parents: Vec<NodeId>, desc: &str) -> Changeset {
        Changeset {
            manifest: Manifest::new().node(),
            parents,
            user: b"test <t@example.com>".to_vec(),
            time: 1000,
            tz_offset: 0,
            files: vec![],
            description: desc.as_bytes().to_vec(),
            extras: BTreeMap::new(),
        }
    }

    #[test]
    fn test_memory_source_heads_and_ancestry() {
        let mut store = MemorySourceStore::new();
        let a = store.put_changeset(&changeset(vec![], "a")).unwrap();
        let b = store.put_changeset(&changeset(vec![a], "b")).unwrap();
        let c = store.put_changeset(&changeset(vec![a], "c")).unwrap();

        let mut heads = store.heads().unwrap();
        heads.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(heads, expected);
        assert!(store.is_ancestor(&a, &c).unwrap());
        assert!(!store.is_ancestor(&b, &c).unwrap());
    }

    #[test]
    fn test_branch_heads_split_by_branch() {
        let mut store = MemorySourceStore::new();
        let a = store.put_changeset(&changeset(vec![], "a")).unwrap();
        let mut feature = changeset(vec![a], "f");
        feature.extras.insert("branch".to_string(), b"feature".to_vec());
        let f = store.put_changeset(&feature).unwrap();

        let heads = store.branch_heads().unwrap();
        assert_eq!(heads["default"], vec![a]);
        assert_eq!(heads["feature"], vec![f]);
    }

    #[test]
    fn test_memory_target_typed_get_rejects_wrong_kind() {
        let mut store = MemoryTargetStore::new();
        let id = store.put(&Object::Blob(Blob::new(b"x".to_vec()))).unwrap();
        assert!(store.get_blob(&id).unwrap().is_some());
        assert!(store.get_tree(&id).is_err());
        assert!(store.get_commit(&ObjectId::NULL).unwrap().is_none());
    }

    #[test]
    fn test_layered_store_leaves_base_untouched() {
        let mut base = MemoryTargetStore::new();
        let shared = base.put(&Object::Blob(Blob::new(b"base".to_vec()))).unwrap();
        base.set_ref("refs/heads/old", shared).unwrap();

        let mut layered = LayeredTargetStore::new(&base);
        let fresh = layered.put(&Object::Blob(Blob::new(b"fresh".to_vec()))).unwrap();
        layered.put(&Object::Blob(Blob::new(b"base".to_vec()))).unwrap();
        layered.set_ref("refs/heads/new", fresh).unwrap();
        layered.delete_ref("refs/heads/old").unwrap();

        assert_eq!(layered.added(), 1);
        assert!(layered.contains(&shared).unwrap());
        assert_eq!(layered.refs().unwrap().keys().collect::<Vec<_>>(), vec!["refs/heads/new"]);
        drop(layered);
        assert!(!base.contains(&fresh).unwrap());
        assert!(base.refs().unwrap().contains_key("refs/heads/old"));
    }

    #[test]
    fn test_disk_target_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskTargetStore::open(dir.path()).unwrap();
        let id = store.put(&Object::Blob(Blob::new(b"persisted".to_vec()))).unwrap();
        store.set_ref("refs/heads/main", id).unwrap();
        drop(store);

        let store = DiskTargetStore::open(dir.path()).unwrap();
        assert_eq!(store.get_blob(&id).unwrap().unwrap().data, b"persisted");
        assert_eq!(store.refs().unwrap()["refs/heads/main"], id);
    }

    #[test]
    fn test_disk_source_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DiskSourceStore::open(dir.path()).unwrap();
        let file = store
            .put_file(&FileRevision::new(b"data".to_vec(), (NodeId::NULL, NodeId::NULL)))
            .unwrap();
        let mut manifest = Manifest::new();
        manifest.insert("f", ManifestEntry::new(file, ""));
        let mnode = store.put_manifest(&manifest).unwrap();
        let mut cs = changeset(vec![], "root");
        cs.manifest = mnode;
        let node = store.put_changeset(&cs).unwrap();
        store.set_bookmark("main", node).unwrap();
        drop(store);

        let store = DiskSourceStore::open(dir.path()).unwrap();
        assert_eq!(store.changesets().unwrap(), vec![node]);
        assert_eq!(store.manifest_of(&node).unwrap(), manifest);
        assert_eq!(store.bookmarks().unwrap()["main"], node);
    }
}
