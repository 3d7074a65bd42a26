//! Parents-before-children ordering of commit DAGs (Kahn's algorithm).

use crate::error::{Result, SyncError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

/// Sort `nodes` (each with its parents) so that every node comes after all
/// of its parents that are also in the set. Parents outside the set count
/// as already processed. Ties keep the input order.
pub fn topo_sort<K>(nodes: &[(K, Vec<K>)]) -> Result<Vec<K>>
where
    K: Copy + Eq + Hash + Display,
{
    let members: HashSet<K> = nodes.iter().map(|(k, _)| *k).collect();
    let mut in_degree: HashMap<K, usize> = HashMap::with_capacity(nodes.len());
    let mut children: HashMap<K, Vec<K>> = HashMap::new();

    for (node, parents) in nodes {
        let entry = in_degree.entry(*node).or_insert(0);
        let mut seen = HashSet::new();
        for parent in parents.iter().filter(|p| members.contains(*p) && seen.insert(**p)) {
            *entry += 1;
            children.entry(*parent).or_default().push(*node);
        }
    }

    let mut queue: VecDeque<K> = nodes
        .iter()
        .map(|(k, _)| *k)
        .filter(|k| in_degree.get(k) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut done = HashSet::with_capacity(nodes.len());

    while let Some(node) = queue.pop_front() {
        if !done.insert(node) {
            continue;
        }
        order.push(node);
        for child in children.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if order.len() != members.len() {
        let stuck = nodes
            .iter()
            .find(|(k, _)| !done.contains(k))
            .map(|(k, _)| k.to_string())
            .unwrap_or_default();
        return Err(SyncError::consistency(format!("cycle detected in commit graph at {}", stuck)));
    }
    Ok(order)
}
