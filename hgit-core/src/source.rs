//! Source-system object model
//!
//! Changesets point at a manifest, manifests map paths to file revisions,
//! and file revisions carry content plus optional copy metadata. Node ids
//! follow the revlog convention: `sha1(min(p1, p2) || max(p1, p2) || text)`.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Name of the branch that carries no explicit branch metadata
pub const DEFAULT_BRANCH: &str = "default";

/// Source-system node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub const NULL: NodeId = NodeId([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Hash `text` under the given parents.
    ///
    /// The first two parents are sorted and hashed ahead of the text; any
    /// further parents are appended after it in their original order.
    pub fn hash(parents: &[NodeId], text: &[u8]) -> Self {
        let p1 = parents.first().copied().unwrap_or(NodeId::NULL);
        let p2 = parents.get(1).copied().unwrap_or(NodeId::NULL);
        let (lo, hi) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };

        let mut hasher = Sha1::new();
        hasher.update(lo.0);
        hasher.update(hi.0);
        hasher.update(text);
        for extra in parents.iter().skip(2) {
            hasher.update(extra.0);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One manifest entry: file revision plus flags (`""`, `"x"` or `"l"`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub node: NodeId,
    pub flags: String,
}

impl ManifestEntry {
    pub fn new(node: NodeId, flags: impl Into<String>) -> Self {
        Self {
            node,
            flags: flags.into(),
        }
    }
}

/// Snapshot of a changeset's files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn text(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, entry) in &self.entries {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.node.to_hex().as_bytes());
            out.extend_from_slice(entry.flags.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Manifests are identified by content alone.
    pub fn node(&self) -> NodeId {
        NodeId::hash(&[], &self.text())
    }

    /// Paths whose entry differs between `self` (old) and `other` (new).
    pub fn diff(&self, other: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, old) in &self.entries {
            match other.entries.get(path) {
                None => diff.removed.push(path.clone()),
                Some(new) if new != old => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in other.entries.keys() {
            if !self.entries.contains_key(path) {
                diff.added.push(path.clone());
            }
        }
        diff
    }
}

/// Result of comparing two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// All touched paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .cloned()
            .collect();
        all.sort();
        all
    }
}

/// A revision of a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    /// File content, without copy metadata
    pub data: Vec<u8>,
    /// Copy source path and file node
    pub copy: Option<(String, NodeId)>,
    pub parents: (NodeId, NodeId),
}

impl FileRevision {
    pub fn new(data: Vec<u8>, parents: (NodeId, NodeId)) -> Self {
        Self {
            data,
            copy: None,
            parents,
        }
    }

    /// Revision text: a `\x01\n` delimited metadata header when copied
    /// (or when the content itself starts with `\x01\n`), then the data.
    pub fn text(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.copy.is_some() || self.data.starts_with(b"\x01\n") {
            out.extend_from_slice(b"\x01\n");
            if let Some((path, node)) = &self.copy {
                out.extend_from_slice(format!("copy: {}\ncopyrev: {}\n", path, node).as_bytes());
            }
            out.extend_from_slice(b"\x01\n");
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a revision text, splitting off the metadata header
    pub fn from_text(text: &[u8], parents: (NodeId, NodeId)) -> Result<Self> {
        if !text.starts_with(b"\x01\n") {
            return Ok(Self::new(text.to_vec(), parents));
        }
        let end = crate::object::find_subslice(&text[2..], b"\x01\n")
            .ok_or_else(|| SyncError::malformed("unterminated file metadata header"))?
            + 2;
        let meta = std::str::from_utf8(&text[2..end])
            .map_err(|_| SyncError::malformed("file metadata is not UTF-8"))?;
        let mut copy_path = None;
        let mut copy_rev = None;
        for line in meta.lines() {
            match line.split_once(": ") {
                Some(("copy", v)) => copy_path = Some(v.to_string()),
                Some(("copyrev", v)) => copy_rev = Some(NodeId::from_hex(v)?),
                _ => {}
            }
        }
        Ok(Self {
            data: text[end + 2..].to_vec(),
            copy: copy_path.zip(copy_rev),
            parents,
        })
    }

    pub fn node(&self) -> NodeId {
        NodeId::hash(&[self.parents.0, self.parents.1], &self.text())
    }
}

/// A source-system commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub manifest: NodeId,
    pub parents: Vec<NodeId>,
    pub user: Vec<u8>,
    /// Unix seconds
    pub time: i64,
    /// Seconds west of UTC
    pub tz_offset: i32,
    /// Touched paths (including removals), sorted
    pub files: Vec<String>,
    pub description: Vec<u8>,
    pub extras: BTreeMap<String, Vec<u8>>,
}

impl Changeset {
    /// Branch name, `default` when none is recorded
    pub fn branch(&self) -> String {
        self.extras
            .get("branch")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    pub fn text(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.manifest.to_hex().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.user);
        out.push(b'\n');
        out.extend_from_slice(format!("{} {}", self.time, self.tz_offset).as_bytes());
        if !self.extras.is_empty() {
            out.push(b' ');
            let encoded: Vec<Vec<u8>> = self
                .extras
                .iter()
                .map(|(k, v)| {
                    let mut kv = k.as_bytes().to_vec();
                    kv.push(b':');
                    kv.extend_from_slice(v);
                    escape_extra(&kv)
                })
                .collect();
            out.extend_from_slice(&encoded.join(&b'\0'));
        }
        out.push(b'\n');
        for file in &self.files {
            out.extend_from_slice(file.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.description);
        out
    }

    pub fn node(&self) -> NodeId {
        NodeId::hash(&self.parents, &self.text())
    }

    pub fn p1(&self) -> Option<NodeId> {
        self.parents.first().copied()
    }
}

fn escape_extra(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0 => out.extend_from_slice(b"\\0"),
            _ => out.push(b),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 20])
    }

    #[test]
    fn test_node_hash_is_parent_order_independent() {
        let a = NodeId::hash(&[node(1), node(2)], b"text");
        let b = NodeId::hash(&[node(2), node(1)], b"text");
        assert_eq!(a, b);
        assert_ne!(a, NodeId::hash(&[node(1)], b"text"));
    }

    #[test]
    fn test_extra_parents_change_identity() {
        let two = NodeId::hash(&[node(1), node(2)], b"x");
        let three = NodeId::hash(&[node(1), node(2), node(3)], b"x");
        assert_ne!(two, three);
    }

    #[test]
    fn test_file_revision_copy_metadata_roundtrip() {
        let mut rev = FileRevision::new(b"content".to_vec(), (NodeId::NULL, NodeId::NULL));
        rev.copy = Some(("old/name.txt".to_string(), node(9)));
        let parsed = FileRevision::from_text(&rev.text(), rev.parents).unwrap();
        assert_eq!(parsed, rev);
        assert_eq!(parsed.data, b"content");
    }

    #[test]
    fn test_file_revision_escapes_leading_marker() {
        let rev = FileRevision::new(b"\x01\nlooks like meta".to_vec(), (NodeId::NULL, NodeId::NULL));
        let parsed = FileRevision::from_text(&rev.text(), rev.parents).unwrap();
        assert_eq!(parsed.data, rev.data);
        assert!(parsed.copy.is_none());
    }

    #[test]
    fn test_manifest_diff() {
        let mut old = Manifest::new();
        old.insert("a", ManifestEntry::new(node(1), ""));
        old.insert("b", ManifestEntry::new(node(2), ""));
        let mut new = old.clone();
        new.remove("a");
        new.insert("b", ManifestEntry::new(node(2), "x"));
        new.insert("c", ManifestEntry::new(node(3), ""));

        let diff = old.diff(&new);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.modified, vec!["b"]);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.paths(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_changeset_branch_defaults() {
        let mut cs = Changeset {
            manifest: NodeId::NULL,
            parents: vec![],
            user: b"u".to_vec(),
            time: 0,
            tz_offset: 0,
            files: vec![],
            description: b"d".to_vec(),
            extras: BTreeMap::new(),
        };
        assert_eq!(cs.branch(), "default");
        let before = cs.node();
        cs.extras.insert("branch".to_string(), b"feature".to_vec());
        assert_eq!(cs.branch(), "feature");
        assert_ne!(cs.node(), before);
    }
}
