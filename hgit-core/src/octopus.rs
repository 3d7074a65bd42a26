//! Octopus merge chains.
//!
//! The exporter writes at most two parents per target commit. A source
//! merge with N > 2 parents becomes N - 1 two-parent commits that all carry
//! the merge result tree:
//!
//! ```text
//! m1 = (P1, P2)  merge : octopus
//! m2 = (m1, P3)  merge : octopus
//! mF = (m2, P4)  merge : octopus-done   <- mapped to the source changeset
//! ```

use crate::error::{Result, SyncError};
use crate::footer::{self, Footer, OctopusMarker};
use crate::object::{Commit, ObjectId};
use crate::storage::TargetStore;
use std::collections::HashSet;

/// Marker carried in a commit's footer, if any
pub fn marker(commit: &Commit) -> Option<OctopusMarker> {
    let text = String::from_utf8_lossy(&commit.message);
    footer::split(&text).1.and_then(|f| f.merge)
}

/// Build the chain for `template` (whose parents are the full parent list
/// and whose message already carries the `octopus-done` footer).
///
/// Returns the commits in write order; the last one is the chain head.
pub fn build_chain(template: &Commit, body: &str) -> Result<Vec<Commit>> {
    let parents = &template.parents;
    if parents.len() <= 2 {
        return Ok(vec![template.clone()]);
    }

    let intermediate_footer = Footer {
        merge: Some(OctopusMarker::Octopus),
        ..Default::default()
    };
    let intermediate_message = footer::append(body, &intermediate_footer).into_bytes();

    let mut chain = Vec::with_capacity(parents.len() - 1);
    let mut previous = parents[0];
    for parent in &parents[1..parents.len() - 1] {
        let commit = Commit {
            parents: vec![previous, *parent],
            message: intermediate_message.clone(),
            ..template.clone()
        };
        previous = commit.id();
        chain.push(commit);
    }
    chain.push(Commit {
        parents: vec![previous, parents[parents.len() - 1]],
        ..template.clone()
    });
    Ok(chain)
}

/// Recover the original parent list of a chain head.
pub fn flatten<T: TargetStore>(target: &T, head: &Commit) -> Result<Vec<ObjectId>> {
    if head.parents.len() != 2 {
        return Err(SyncError::malformed(format!(
            "octopus chain head has {} parents",
            head.parents.len()
        )));
    }
    let mut reversed = vec![head.parents[1]];
    let mut node = head.parents[0];
    let mut visited = HashSet::new();
    loop {
        let commit = target.commit(&node)?;
        if marker(&commit) != Some(OctopusMarker::Octopus) {
            break;
        }
        if !visited.insert(node) {
            return Err(SyncError::consistency(format!("octopus chain loops at {}", node)));
        }
        if commit.parents.len() != 2 {
            return Err(SyncError::malformed(format!("octopus link {} has {} parents", node, commit.parents.len())));
        }
        reversed.push(commit.parents[1]);
        node = commit.parents[0];
    }
    reversed.push(node);
    reversed.reverse();
    Ok(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Object, Signature, Tree};
    use crate::storage::MemoryTargetStore;

    fn root_commit(target: &mut MemoryTargetStore, msg: &str) -> ObjectId {
        let sig = Signature::new("t", "t@x", 0, 0);
        let commit = Commit {
            tree: Tree::new().id(),
            parents: vec![],
            author: sig.clone(),
            committer: sig,
            encoding: None,
            message: msg.as_bytes().to_vec(),
        };
        target.put(&Object::Commit(commit)).unwrap()
    }

    #[test]
    fn test_chain_roundtrip_preserves_parent_order() {
        let mut target = MemoryTargetStore::new();
        let parents: Vec<ObjectId> = (0..4).map(|i| root_commit(&mut target, &format!("p{}", i))).collect();
        let done = Footer {
            merge: Some(OctopusMarker::OctopusDone),
            ..Default::default()
        };
        let sig = Signature::new("m", "m@x", 1, 0);
        let template = Commit {
            tree: Tree::new().id(),
            parents: parents.clone(),
            author: sig.clone(),
            committer: sig,
            encoding: None,
            message: footer::append("merge four", &done).into_bytes(),
        };

        let chain = build_chain(&template, "merge four").unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain.iter().all(|c| c.parents.len() == 2 && c.tree == template.tree));
        assert_eq!(marker(&chain[0]), Some(OctopusMarker::Octopus));
        assert_eq!(marker(&chain[2]), Some(OctopusMarker::OctopusDone));
        for commit in &chain {
            target.put(&Object::Commit(commit.clone())).unwrap();
        }

        assert_eq!(flatten(&target, &chain[2]).unwrap(), parents);
    }

    #[test]
    fn test_two_parent_merge_is_not_chained() {
        let sig = Signature::new("m", "m@x", 1, 0);
        let template = Commit {
            tree: Tree::new().id(),
            parents: vec![ObjectId::new([1; 20]), ObjectId::new([2; 20])],
            author: sig.clone(),
            committer: sig,
            encoding: None,
            message: b"merge".to_vec(),
        };
        assert_eq!(build_chain(&template, "merge").unwrap(), vec![template]);
    }
}
