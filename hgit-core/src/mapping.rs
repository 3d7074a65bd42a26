//! Persistent bijection between source nodes and target commit ids.
//!
//! The map file is loaded on first lookup and written back only by an
//! explicit `persist()`, which a sync session calls once at the end of a
//! successful run. Lines are `<target hex> <source hex>`, sorted by source.

use crate::error::{Result, SyncError};
use crate::object::ObjectId;
use crate::source::NodeId;
use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default)]
struct MapState {
    forward: HashMap<NodeId, ObjectId>,
    backward: HashMap<ObjectId, NodeId>,
    dirty: bool,
}

impl MapState {
    fn insert(&mut self, source: NodeId, target: ObjectId) -> Result<bool> {
        match (self.forward.get(&source), self.backward.get(&target)) {
            (Some(t), _) if *t == target => return Ok(false),
            (Some(t), _) => {
                return Err(SyncError::consistency(format!(
                    "{} is already mapped to {}, refusing {}",
                    source, t, target
                )));
            }
            (None, Some(s)) => {
                return Err(SyncError::consistency(format!(
                    "{} is already mapped to {}, refusing {}",
                    target, s, source
                )));
            }
            (None, None) => {}
        }
        self.forward.insert(source, target);
        self.backward.insert(target, source);
        Ok(true)
    }
}

/// Bijective source <-> target commit map
#[derive(Debug)]
pub struct ObjectMapper {
    path: Option<PathBuf>,
    state: OnceCell<MapState>,
}

impl ObjectMapper {
    /// Mapper backed by the file at `path` (which need not exist yet)
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: OnceCell::new(),
        }
    }

    /// Mapper that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: OnceCell::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the backing file has been read yet
    pub fn is_loaded(&self) -> bool {
        self.state.get().is_some()
    }

    fn state(&self) -> Result<&MapState> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }
        let loaded = self.load()?;
        Ok(self.state.get_or_init(|| loaded))
    }

    fn state_mut(&mut self) -> Result<&mut MapState> {
        self.state()?;
        self.state
            .get_mut()
            .ok_or_else(|| SyncError::consistency("object map failed to load"))
    }

    fn load(&self) -> Result<MapState> {
        let mut state = MapState::default();
        let path = match &self.path {
            Some(path) if path.exists() => path,
            _ => return Ok(state),
        };
        let data = fs::read_to_string(path)?;
        for (lineno, line) in data.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (target, source) = line
                .split_once(' ')
                .ok_or_else(|| SyncError::malformed(format!("map line {}: {:?}", lineno + 1, line)))?;
            state.insert(NodeId::from_hex(source)?, ObjectId::from_hex(target)?)?;
        }
        debug!(entries = state.forward.len(), path = ?path, "loaded object map");
        Ok(state)
    }

    /// Record a translated pair.
    ///
    /// Recording an existing pair again is a no-op; mapping either side to a
    /// different counterpart is a consistency error.
    pub fn record(&mut self, source: NodeId, target: ObjectId) -> Result<()> {
        let state = self.state_mut()?;
        if state.insert(source, target)? {
            state.dirty = true;
        }
        Ok(())
    }

    pub fn lookup_forward(&self, source: &NodeId) -> Result<Option<ObjectId>> {
        Ok(self.state()?.forward.get(source).copied())
    }

    pub fn lookup_backward(&self, target: &ObjectId) -> Result<Option<NodeId>> {
        Ok(self.state()?.backward.get(target).copied())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state()?.forward.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All pairs sorted by source node
    pub fn pairs(&self) -> Result<Vec<(NodeId, ObjectId)>> {
        let mut pairs: Vec<(NodeId, ObjectId)> =
            self.state()?.forward.iter().map(|(s, t)| (*s, *t)).collect();
        pairs.sort();
        Ok(pairs)
    }

    /// Write the full map if anything changed since the last load or persist
    pub fn persist(&mut self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        if !self.state.get().map(|s| s.dirty).unwrap_or(false) {
            return Ok(());
        }
        let mut out = String::new();
        for (source, target) in self.pairs()? {
            out.push_str(&format!("{} {}\n", target, source));
        }
        write_atomic(&path, out.as_bytes())?;
        if let Some(state) = self.state.get_mut() {
            state.dirty = false;
        }
        debug!(path = ?path, "persisted object map");
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Tag name -> source node, stored as `<source hex> <name>` lines
#[derive(Debug, Default)]
pub struct TagMap {
    path: Option<PathBuf>,
    tags: BTreeMap<String, NodeId>,
    dirty: bool,
}

impl TagMap {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut tags = BTreeMap::new();
        if path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                if line.is_empty() {
                    continue;
                }
                let (node, name) = line
                    .split_once(' ')
                    .ok_or_else(|| SyncError::malformed(format!("tag line {:?}", line)))?;
                tags.insert(name.to_string(), NodeId::from_hex(node)?);
            }
        }
        Ok(Self {
            path: Some(path),
            tags,
            dirty: false,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.tags.get(name).copied()
    }

    pub fn set(&mut self, name: &str, node: NodeId) {
        if self.tags.get(name) != Some(&node) {
            self.tags.insert(name.to_string(), node);
            self.dirty = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeId)> {
        self.tags.iter()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn persist(&mut self) -> Result<()> {
        let path = match &self.path {
            Some(path) if self.dirty => path.clone(),
            _ => return Ok(()),
        };
        let mut out = String::new();
        for (name, node) in &self.tags {
            out.push_str(&format!("{} {}\n", node, name));
        }
        write_atomic(&path, out.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 20])
    }

    fn oid(b: u8) -> ObjectId {
        ObjectId::new([b; 20])
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut map = ObjectMapper::in_memory();
        map.record(node(1), oid(2)).unwrap();
        map.record(node(1), oid(2)).unwrap();
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn test_contradictory_record_fails() {
        let mut map = ObjectMapper::in_memory();
        map.record(node(1), oid(2)).unwrap();
        assert!(matches!(map.record(node(1), oid(3)), Err(SyncError::Consistency(_))));
        assert!(matches!(map.record(node(4), oid(2)), Err(SyncError::Consistency(_))));
        assert_eq!(map.lookup_forward(&node(4)).unwrap(), None);
    }

    #[test]
    fn test_lazy_load_and_sorted_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        let mut map = ObjectMapper::open(&path);
        map.record(node(9), oid(1)).unwrap();
        map.record(node(3), oid(7)).unwrap();
        map.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("{} {}", oid(7), node(3)));
        assert_eq!(lines[1], format!("{} {}", oid(1), node(9)));

        let reopened = ObjectMapper::open(&path);
        assert!(!reopened.is_loaded());
        assert_eq!(reopened.lookup_backward(&oid(1)).unwrap(), Some(node(9)));
        assert!(reopened.is_loaded());
    }

    #[test]
    fn test_unpersisted_records_leave_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        {
            let mut map = ObjectMapper::open(&path);
            map.record(node(1), oid(1)).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_tag_map_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags");
        let mut tags = TagMap::load(&path).unwrap();
        tags.set("v1.0", node(5));
        tags.persist().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{} v1.0\n", node(5)));
        assert_eq!(TagMap::load(&path).unwrap().get("v1.0"), Some(node(5)));
    }

    proptest! {
        #[test]
        fn prop_bijection_holds(pairs in proptest::collection::vec((any::<[u8; 20]>(), any::<[u8; 20]>()), 0..40)) {
            let mut map = ObjectMapper::in_memory();
            let mut recorded = Vec::new();
            for (s, t) in pairs {
                let (s, t) = (NodeId::new(s), ObjectId::new(t));
                if map.record(s, t).is_ok() {
                    recorded.push(s);
                }
            }
            for s in recorded {
                let t = map.lookup_forward(&s).unwrap().unwrap();
                prop_assert_eq!(map.lookup_backward(&t).unwrap(), Some(s));
            }
        }
    }
}
