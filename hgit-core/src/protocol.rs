//! Pack protocol building blocks shared by the client negotiator and the peer:
//! ref advertisements, push commands, the have-walker and pack generation.

use crate::delta;
use crate::error::{Result, SyncError};
use crate::object::{FileMode, Object, ObjectId, ObjectKind};
use crate::packfile::PackWriter;
use crate::pktline::PacketIo;
use crate::storage::TargetStore;
use crate::treediff;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Remote program names used to select a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }
}

/// Send a ref advertisement: `<hex> <ref>` lines then flush
pub async fn write_advertisement<P: PacketIo + ?Sized>(io: &mut P, refs: &BTreeMap<String, ObjectId>) -> Result<()> {
    let lines: Vec<String> = refs.iter().map(|(name, id)| format!("{} {}", id, name)).collect();
    io.write_lines(&lines).await?;
    io.flush().await
}

pub async fn read_advertisement<P: PacketIo + ?Sized>(io: &mut P) -> Result<BTreeMap<String, ObjectId>> {
    let mut refs = BTreeMap::new();
    for data in io.read_until_flush().await? {
        let line = String::from_utf8_lossy(&data);
        let line = line.trim_end_matches('\n');
        let (hex, name) = line
            .split_once(' ')
            .ok_or_else(|| SyncError::protocol(format!("bad advertisement line {:?}", line)))?;
        let id = ObjectId::from_hex(hex).map_err(|_| SyncError::protocol(format!("bad advertised id {:?}", hex)))?;
        refs.insert(name.to_string(), id);
    }
    Ok(refs)
}

/// Parse `<verb> <hex>` lines such as `want`, `have` and `ACK`
pub fn parse_id_line(line: &str, verb: &str) -> Result<Option<ObjectId>> {
    match line.strip_prefix(verb).and_then(|rest| rest.strip_prefix(' ')) {
        Some(hex) => ObjectId::from_hex(hex.trim())
            .map(Some)
            .map_err(|_| SyncError::protocol(format!("bad object id in {:?}", line))),
        None => Ok(None),
    }
}

/// One requested ref update in a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub ref_name: String,
    pub old: ObjectId,
    /// Null id deletes the ref
    pub new: ObjectId,
    pub force: bool,
}

impl RefUpdate {
    pub fn to_line(&self) -> String {
        format!("{}{} {} {}", if self.force { "+" } else { "" }, self.old, self.new, self.ref_name)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let (force, rest) = match line.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let mut parts = rest.splitn(3, ' ');
        let (Some(old), Some(new), Some(ref_name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SyncError::protocol(format!("bad push command {:?}", line)));
        };
        let id = |hex: &str| ObjectId::from_hex(hex).map_err(|_| SyncError::protocol(format!("bad id in push command {:?}", line)));
        Ok(Self {
            ref_name: ref_name.to_string(),
            old: id(old)?,
            new: id(new)?,
            force,
        })
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_null()
    }
}

/// Objects the remote advertises that the local store lacks
pub fn determine_wants<T: TargetStore>(store: &T, advertised: &BTreeMap<String, ObjectId>) -> Result<BTreeSet<ObjectId>> {
    let mut wants = BTreeSet::new();
    for id in advertised.values() {
        if !id.is_null() && !store.contains(id)? {
            wants.insert(*id);
        }
    }
    Ok(wants)
}

/// Supplies `have` candidates during negotiation
pub trait GraphWalker {
    /// Next commit to offer, newest first
    fn next(&mut self) -> Result<Option<ObjectId>>;
    /// The peer has `id`; its ancestry need not be offered
    fn ack(&mut self, id: ObjectId) -> Result<()>;
}

/// Walks commits of a target store breadth-first from a set of heads
pub struct StoreGraphWalker<'a, T: TargetStore> {
    store: &'a T,
    queue: VecDeque<ObjectId>,
    seen: HashSet<ObjectId>,
    common: HashSet<ObjectId>,
}

impl<'a, T: TargetStore> StoreGraphWalker<'a, T> {
    pub fn new(store: &'a T, heads: impl IntoIterator<Item = ObjectId>) -> Self {
        let mut walker = Self {
            store,
            queue: VecDeque::new(),
            seen: HashSet::new(),
            common: HashSet::new(),
        };
        for head in heads {
            if walker.seen.insert(head) {
                walker.queue.push_back(head);
            }
        }
        walker
    }

    /// Commits the peer acknowledged
    pub fn common(&self) -> &HashSet<ObjectId> {
        &self.common
    }
}

impl<T: TargetStore> GraphWalker for StoreGraphWalker<'_, T> {
    fn next(&mut self) -> Result<Option<ObjectId>> {
        while let Some(id) = self.queue.pop_front() {
            if self.common.contains(&id) {
                continue;
            }
            let commit = match self.store.get(&self.store.peel(&id)?)? {
                Some(Object::Commit(commit)) => commit,
                _ => continue,
            };
            for parent in commit.parents {
                if self.seen.insert(parent) {
                    self.queue.push_back(parent);
                }
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    fn ack(&mut self, id: ObjectId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !self.common.insert(id) {
                continue;
            }
            if let Some(commit) = self.store.get_commit(&id)? {
                stack.extend(commit.parents);
            }
        }
        Ok(())
    }
}

/// Commits reachable from `from`, not descending into `stop`
fn reachable_commits<T: TargetStore>(store: &T, from: &[ObjectId], stop: &HashSet<ObjectId>) -> Result<Vec<ObjectId>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<ObjectId> = from.to_vec();
    while let Some(id) = stack.pop() {
        if stop.contains(&id) || !seen.insert(id) {
            continue;
        }
        let commit = store.commit(&id)?;
        stack.extend(commit.parents.iter().copied());
        out.push(id);
    }
    Ok(out)
}

/// Build a pack holding everything reachable from `wants` that is not
/// reachable from `haves`.
///
/// Blobs whose same-path predecessor sits in a `have` tree are sent as
/// ref-deltas against that predecessor, which makes the pack thin.
pub fn generate_pack<T: TargetStore>(
    store: &T,
    haves: &BTreeSet<ObjectId>,
    wants: &BTreeSet<ObjectId>,
) -> Result<PackWriter> {
    let mut writer = PackWriter::new();
    let mut sent: HashSet<ObjectId> = HashSet::new();

    // Peel tags, sending the tag objects themselves.
    let mut want_commits = Vec::new();
    for want in wants {
        let mut id = *want;
        loop {
            match store.get(&id)? {
                Some(Object::Tag(tag)) => {
                    if sent.insert(id) {
                        writer.add_object(ObjectKind::Tag, tag.to_bytes());
                    }
                    id = tag.object;
                }
                Some(Object::Commit(_)) => {
                    want_commits.push(id);
                    break;
                }
                Some(other) => {
                    return Err(SyncError::protocol(format!("cannot send {} {} as a ref tip", other.kind().as_str(), id)));
                }
                None => return Err(SyncError::consistency(format!("wanted object {} is not in the store", id))),
            }
        }
    }

    let mut have_commits = Vec::new();
    for id in haves {
        let peeled = store.peel(id)?;
        if let Some((ObjectKind::Commit, _)) = store.get_raw(&peeled)? {
            have_commits.push(peeled);
        }
    }
    let mut excluded = HashSet::new();
    for id in reachable_commits(store, &have_commits, &HashSet::new())? {
        excluded.insert(id);
    }

    // Objects the peer already holds, plus per-path blob bases for deltas.
    let mut known: HashSet<ObjectId> = HashSet::new();
    let mut bases: HashMap<String, ObjectId> = HashMap::new();
    for id in &have_commits {
        let tree = store.commit(id)?.tree;
        mark_tree(store, tree, &mut known)?;
        for (path, (mode, blob)) in treediff::flatten(store, tree)? {
            if mode != FileMode::Gitlink {
                bases.entry(path).or_insert(blob);
            }
        }
    }

    for id in reachable_commits(store, &want_commits, &excluded)? {
        if !sent.insert(id) {
            continue;
        }
        let commit = store.commit(&id)?;
        writer.add_object(ObjectKind::Commit, commit.to_bytes());
        add_tree(store, &mut writer, String::new(), commit.tree, &known, &bases, &mut sent)?;
    }
    Ok(writer)
}

fn mark_tree<T: TargetStore>(store: &T, root: ObjectId, known: &mut HashSet<ObjectId>) -> Result<()> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !known.insert(id) {
            continue;
        }
        for entry in store.tree(&id)?.iter() {
            match entry.mode {
                FileMode::Tree => stack.push(entry.id),
                FileMode::Gitlink => {}
                _ => {
                    known.insert(entry.id);
                }
            }
        }
    }
    Ok(())
}

fn add_tree<T: TargetStore>(
    store: &T,
    writer: &mut PackWriter,
    prefix: String,
    root: ObjectId,
    known: &HashSet<ObjectId>,
    bases: &HashMap<String, ObjectId>,
    sent: &mut HashSet<ObjectId>,
) -> Result<()> {
    let mut stack = vec![(prefix, root)];
    while let Some((prefix, id)) = stack.pop() {
        if known.contains(&id) || !sent.insert(id) {
            continue;
        }
        let tree = store.tree(&id)?;
        writer.add_object(ObjectKind::Tree, tree.to_bytes());
        for entry in tree.iter() {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            match entry.mode {
                FileMode::Tree => stack.push((path, entry.id)),
                // Gitlinks point into another repository.
                FileMode::Gitlink => {}
                _ => {
                    if known.contains(&entry.id) || !sent.insert(entry.id) {
                        continue;
                    }
                    let data = store
                        .get_blob(&entry.id)?
                        .ok_or_else(|| SyncError::consistency(format!("blob {} missing from target store", entry.id)))?
                        .data;
                    let base = bases.get(&path).copied().filter(|b| *b != entry.id);
                    match base.map(|b| store.get_blob(&b)).transpose()?.flatten() {
                        Some(base_blob) => {
                            let patch = delta::diff(&base_blob.data, &data);
                            if patch.len() < data.len() {
                                writer.add_delta(base_blob.id(), patch);
                            } else {
                                writer.add_object(ObjectKind::Blob, data);
                            }
                        }
                        None => writer.add_object(ObjectKind::Blob, data),
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Commit, Signature, Tree, TreeEntry};
    use crate::packfile::read_pack;
    use crate::storage::MemoryTargetStore;

    fn commit(store: &mut MemoryTargetStore, files: &[(&str, &[u8])], parents: Vec<ObjectId>) -> ObjectId {
        let mut tree = Tree::new();
        for (name, data) in files {
            let id = store.put(&Object::Blob(Blob::new(data.to_vec()))).unwrap();
            tree.insert(TreeEntry::new(*name, FileMode::Regular, id));
        }
        let tree_id = store.put(&Object::Tree(tree)).unwrap();
        let sig = Signature::new("a", "a@x", 0, 0);
        store
            .put(&Object::Commit(Commit {
                tree: tree_id,
                parents,
                author: sig.clone(),
                committer: sig,
                encoding: None,
                message: b"m".to_vec(),
            }))
            .unwrap()
    }

    #[test]
    fn test_push_command_line() {
        let update = RefUpdate {
            ref_name: "refs/heads/main".to_string(),
            old: ObjectId::NULL,
            new: ObjectId::new([7; 20]),
            force: true,
        };
        let line = update.to_line();
        assert!(line.starts_with('+'));
        assert_eq!(RefUpdate::parse(&line).unwrap(), update);
        assert!(RefUpdate::parse("garbage").is_err());
    }

    #[test]
    fn test_walker_skips_acked_ancestry() {
        let mut store = MemoryTargetStore::new();
        let c1 = commit(&mut store, &[("f", b"1")], vec![]);
        let c2 = commit(&mut store, &[("f", b"2")], vec![c1]);
        let c3 = commit(&mut store, &[("f", b"3")], vec![c2]);

        let mut walker = StoreGraphWalker::new(&store, [c3]);
        assert_eq!(walker.next().unwrap(), Some(c3));
        walker.ack(c2).unwrap();
        assert!(walker.common().contains(&c1));
        assert_eq!(walker.next().unwrap(), None);
    }

    #[test]
    fn test_thin_pack_against_have() {
        let big = vec![b'x'; 4096];
        let mut changed = big.clone();
        changed.extend_from_slice(b"tail");

        let mut store = MemoryTargetStore::new();
        let c1 = commit(&mut store, &[("big", &big)], vec![]);
        let c2 = commit(&mut store, &[("big", &changed)], vec![c1]);

        let pack = generate_pack(&store, &BTreeSet::from([c1]), &BTreeSet::from([c2])).unwrap();
        // commit, tree and a blob delta
        assert_eq!(pack.len(), 3);
        let bytes = pack.finish().unwrap();

        let mut receiver = MemoryTargetStore::new();
        assert!(read_pack(&bytes, &receiver).is_err());
        receiver.put(&Object::Blob(Blob::new(big))).unwrap();
        let objects = read_pack(&bytes, &receiver).unwrap();
        assert!(objects.iter().any(|o| o.id == c2));
        assert!(objects.iter().any(|o| o.data == changed));
    }

    #[test]
    fn test_determine_wants_skips_known() {
        let mut store = MemoryTargetStore::new();
        let c1 = commit(&mut store, &[("f", b"1")], vec![]);
        let unknown = ObjectId::new([9; 20]);
        let advertised = BTreeMap::from([
            ("refs/heads/a".to_string(), c1),
            ("refs/heads/b".to_string(), unknown),
        ]);
        assert_eq!(determine_wants(&store, &advertised).unwrap(), BTreeSet::from([unknown]));
    }
}
