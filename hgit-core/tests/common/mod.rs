//! Shared fixtures for integration tests.

#![allow(dead_code)]

use hgit_core::{Changeset, FileRevision, Manifest, ManifestEntry, NodeId, SourceStore};
use std::collections::BTreeMap;

pub const USER: &str = "Test User <test@example.com>";

/// Describes one changeset by its full snapshot
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    parents: Vec<NodeId>,
    files: Vec<(String, Vec<u8>, String)>,
    copies: Vec<(String, String)>,
    description: String,
    user: Vec<u8>,
    time: i64,
    tz_offset: i32,
    extras: BTreeMap<String, Vec<u8>>,
}

impl CommitBuilder {
    pub fn new(description: &str) -> Self {
        Self {
            parents: Vec::new(),
            files: Vec::new(),
            copies: Vec::new(),
            description: description.to_string(),
            user: USER.as_bytes().to_vec(),
            time: 1_700_000_000,
            tz_offset: 0,
            extras: BTreeMap::new(),
        }
    }

    pub fn parents(mut self, parents: &[NodeId]) -> Self {
        self.parents = parents.to_vec();
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.to_string(), data.to_vec(), String::new()));
        self
    }

    pub fn exec_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.push((path.to_string(), data.to_vec(), "x".to_string()));
        self
    }

    /// Record `new` as copied from `old` in the first parent
    pub fn copy(mut self, old: &str, new: &str) -> Self {
        self.copies.push((old.to_string(), new.to_string()));
        self
    }

    pub fn branch(self, name: &str) -> Self {
        self.extra("branch", name.as_bytes())
    }

    pub fn extra(mut self, key: &str, value: &[u8]) -> Self {
        self.extras.insert(key.to_string(), value.to_vec());
        self
    }

    pub fn user(mut self, user: &[u8]) -> Self {
        self.user = user.to_vec();
        self
    }

    pub fn time(mut self, time: i64, tz_offset: i32) -> Self {
        self.time = time;
        self.tz_offset = tz_offset;
        self
    }

    /// Write file revisions, manifest and changeset; returns the node
    pub fn write<S: SourceStore>(&self, store: &mut S) -> NodeId {
        let p1 = self.parents.first().copied().unwrap_or(NodeId::NULL);
        let p1_manifest = store.manifest_of(&p1).unwrap();

        let mut manifest = Manifest::new();
        for (path, data, flags) in &self.files {
            let copy = self.copies.iter().find(|(_, new)| new == path);
            let p1_entry = p1_manifest.get(path);
            let unchanged = match (copy, p1_entry) {
                (None, Some(entry)) => store.get_file(&entry.node).unwrap().map(|f| f.data) == Some(data.clone()),
                _ => false,
            };
            let node = match p1_entry {
                Some(entry) if unchanged => entry.node,
                _ => {
                    let fp1 = p1_entry.map(|e| e.node).unwrap_or(NodeId::NULL);
                    let revision = match copy {
                        Some((old, _)) => {
                            let old_node = p1_manifest.get(old).expect("copy source in parent").node;
                            let mut revision = FileRevision::new(data.clone(), (NodeId::NULL, fp1));
                            revision.copy = Some((old.clone(), old_node));
                            revision
                        }
                        None => FileRevision::new(data.clone(), (fp1, NodeId::NULL)),
                    };
                    store.put_file(&revision).unwrap()
                }
            };
            manifest.insert(path.clone(), ManifestEntry::new(node, flags.clone()));
        }

        let mut files = p1_manifest.diff(&manifest).paths();
        files.sort();
        files.dedup();
        let changeset = Changeset {
            manifest: store.put_manifest(&manifest).unwrap(),
            parents: self.parents.clone(),
            user: self.user.clone(),
            time: self.time,
            tz_offset: self.tz_offset,
            files,
            description: self.description.as_bytes().to_vec(),
            extras: self.extras.clone(),
        };
        store.put_changeset(&changeset).unwrap()
    }
}
