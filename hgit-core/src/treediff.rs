//! Walking and diffing target trees.

use crate::error::Result;
use crate::object::{FileMode, ObjectId, Tree};
use crate::storage::TargetStore;
use std::collections::BTreeMap;

/// A non-directory tree entry: mode plus blob or gitlink id
pub type Leaf = (FileMode, ObjectId);

/// One file-level difference between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub old: Option<Leaf>,
    pub new: Option<Leaf>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Every leaf under `root`, keyed by full path
pub fn flatten<T: TargetStore>(target: &T, root: ObjectId) -> Result<BTreeMap<String, Leaf>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![(String::new(), root)];
    while let Some((prefix, id)) = stack.pop() {
        for entry in target.tree(&id)?.entries.values() {
            let path = join(&prefix, &entry.name);
            if entry.mode == FileMode::Tree {
                stack.push((path, entry.id));
            } else {
                out.insert(path, (entry.mode, entry.id));
            }
        }
    }
    Ok(out)
}

/// Resolve a path inside a tree
pub fn lookup<T: TargetStore>(target: &T, root: ObjectId, path: &str) -> Result<Option<Leaf>> {
    let mut tree_id = root;
    let mut parts = path.split('/').peekable();
    while let Some(part) = parts.next() {
        let tree = target.tree(&tree_id)?;
        let Some(entry) = tree.get(part) else {
            return Ok(None);
        };
        match (parts.peek().is_some(), entry.mode) {
            (true, FileMode::Tree) => tree_id = entry.id,
            (true, _) => return Ok(None),
            (false, FileMode::Tree) => return Ok(None),
            (false, mode) => return Ok(Some((mode, entry.id))),
        }
    }
    Ok(None)
}

/// File-level changes from `old` (None = empty tree) to `new`.
///
/// Subtrees with equal ids are skipped without being read.
pub fn diff<T: TargetStore>(target: &T, old: Option<ObjectId>, new: ObjectId) -> Result<Vec<TreeChange>> {
    let mut changes = Vec::new();
    let mut stack = vec![(String::new(), old, Some(new))];
    while let Some((prefix, old, new)) = stack.pop() {
        if old == new {
            continue;
        }
        let old_tree = match old {
            Some(id) => target.tree(&id)?,
            None => Tree::new(),
        };
        let new_tree = match new {
            Some(id) => target.tree(&id)?,
            None => Tree::new(),
        };

        let mut names: Vec<&String> = old_tree.entries.keys().chain(new_tree.entries.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            let path = join(&prefix, name);
            let o = old_tree.get(name);
            let n = new_tree.get(name);
            let o_dir = o.filter(|e| e.mode == FileMode::Tree).map(|e| e.id);
            let n_dir = n.filter(|e| e.mode == FileMode::Tree).map(|e| e.id);
            let o_leaf = o.filter(|e| e.mode != FileMode::Tree).map(|e| (e.mode, e.id));
            let n_leaf = n.filter(|e| e.mode != FileMode::Tree).map(|e| (e.mode, e.id));

            if o_dir.is_some() || n_dir.is_some() {
                stack.push((path.clone(), o_dir, n_dir));
            }
            if o_leaf != n_leaf {
                changes.push(TreeChange {
                    path,
                    old: o_leaf,
                    new: n_leaf,
                });
            }
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}
