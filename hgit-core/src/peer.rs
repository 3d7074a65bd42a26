//! Server side of the pack protocol.
//!
//! `serve_upload_pack` answers fetches and `serve_receive_pack` accepts
//! pushes. Both run over any `PacketIo` against a `TargetStore`.

use crate::error::{Result, SyncError};
use crate::object::{FileMode, ObjectId, ObjectKind};
use crate::packfile::read_pack;
use crate::pktline::{self, Packet, PacketIo};
use crate::protocol::{self, RefUpdate, Service};
use crate::storage::TargetStore;
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Result of one received ref update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStatus {
    pub ref_name: String,
    /// `None` when applied, otherwise the rejection reason
    pub error: Option<String>,
}

/// Read the `<service> <path>` request line a raw socket client sends first
pub async fn read_request<P: PacketIo + ?Sized>(io: &mut P) -> Result<(Service, String)> {
    let line = io
        .read_packet()
        .await?
        .text()
        .ok_or_else(|| SyncError::protocol("expected a service request line"))?;
    let (service, path) = line
        .split_once(' ')
        .ok_or_else(|| SyncError::protocol(format!("bad service request {:?}", line)))?;
    let service = Service::parse(service).ok_or_else(|| SyncError::protocol(format!("unknown service {:?}", service)))?;
    io.read_until_flush().await?;
    Ok((service, path.to_string()))
}

/// Answer one fetch
pub async fn serve_upload_pack<P, T>(io: &mut P, store: &T) -> Result<u64>
where
    P: PacketIo + ?Sized,
    T: TargetStore,
{
    protocol::write_advertisement(io, &store.refs()?).await?;

    let mut wants = BTreeSet::new();
    for data in io.read_until_flush().await? {
        let line = Packet::Data(data).text().unwrap_or_default();
        let id = protocol::parse_id_line(&line, "want")?
            .ok_or_else(|| SyncError::protocol(format!("expected want line, got {:?}", line)))?;
        if !store.contains(&id)? {
            return Err(SyncError::protocol(format!("client wants unknown object {}", id)));
        }
        wants.insert(id);
    }
    if wants.is_empty() {
        debug!("client is up to date");
        return Ok(0);
    }

    let mut common: BTreeSet<ObjectId> = BTreeSet::new();
    let mut acks = Vec::new();
    loop {
        match io.read_packet().await? {
            Packet::Flush => {
                for ack in acks.drain(..) {
                    io.write_packet(&Packet::line(ack)).await?;
                }
                io.write_packet(&Packet::line("NAK")).await?;
                io.flush().await?;
            }
            packet => {
                let line = packet.text().unwrap_or_default();
                if line == "done" {
                    break;
                }
                let id = protocol::parse_id_line(&line, "have")?
                    .ok_or_else(|| SyncError::protocol(format!("expected have line, got {:?}", line)))?;
                if store.contains(&id)? {
                    common.insert(id);
                    acks.push(format!("ACK {}", id));
                }
            }
        }
    }

    let writer = protocol::generate_pack(store, &common, &wants)?;
    let count = writer.len() as u64;
    let pack = writer.finish()?;
    for packet in pktline::chunk(&pack) {
        io.write_packet(&packet).await?;
    }
    io.write_packet(&Packet::Flush).await?;
    io.flush().await?;
    info!(objects = count, bytes = pack.len(), common = common.len(), "sent pack");
    Ok(count)
}

/// Accept one push
pub async fn serve_receive_pack<P, T>(io: &mut P, store: &mut T) -> Result<Vec<RefStatus>>
where
    P: PacketIo + ?Sized,
    T: TargetStore,
{
    protocol::write_advertisement(io, &store.refs()?).await?;

    let mut commands = Vec::new();
    for data in io.read_until_flush().await? {
        let line = Packet::Data(data).text().unwrap_or_default();
        commands.push(RefUpdate::parse(&line)?);
    }
    if commands.is_empty() {
        return Ok(Vec::new());
    }

    let pack = io.read_until_flush().await?.concat();
    if !pack.is_empty() {
        for object in read_pack(&pack, &*store)? {
            store.put_raw(object.kind, &object.data)?;
        }
    }

    let mut statuses = Vec::with_capacity(commands.len());
    let mut report = Vec::with_capacity(commands.len());
    for command in &commands {
        let error = apply_update(store, command)?;
        match &error {
            None => report.push(format!("ok {}", command.ref_name)),
            Some(reason) => {
                warn!(ref_name = %command.ref_name, reason = %reason, "refusing ref update");
                report.push(format!("ng {} {}", command.ref_name, reason));
            }
        }
        statuses.push(RefStatus {
            ref_name: command.ref_name.clone(),
            error,
        });
    }
    io.write_lines(&report).await?;
    io.flush().await?;
    Ok(statuses)
}

fn apply_update<T: TargetStore>(store: &mut T, command: &RefUpdate) -> Result<Option<String>> {
    let current = store.refs()?.get(&command.ref_name).copied();
    if current.unwrap_or(ObjectId::NULL) != command.old {
        return Ok(Some("stale old value".to_string()));
    }
    if command.is_delete() {
        store.delete_ref(&command.ref_name)?;
        return Ok(None);
    }
    if let Some(missing) = first_missing(store, &command.new)? {
        debug!(ref_name = %command.ref_name, missing = %missing, "pushed history is incomplete");
        return Ok(Some("missing object".to_string()));
    }
    if let Some(current) = current {
        let current = store.peel(&current)?;
        let new = store.peel(&command.new)?;
        if !command.force && !store.is_ancestor(&current, &new)? {
            return Ok(Some("non-fast-forward".to_string()));
        }
    }
    store.set_ref(&command.ref_name, command.new)?;
    Ok(None)
}

/// First object absent from `store` in the history of `tip`.
///
/// The walk stops at commits the current refs point to; their history was
/// checked when they were accepted.
fn first_missing<T: TargetStore>(store: &T, tip: &ObjectId) -> Result<Option<ObjectId>> {
    if !store.contains(tip)? {
        return Ok(Some(*tip));
    }
    let mut known = HashSet::new();
    for id in store.refs()?.values() {
        known.insert(store.peel(id)?);
    }

    let mut trees = Vec::new();
    let mut queue = VecDeque::new();
    let start = store.peel(tip)?;
    match store.get_raw(&start)? {
        None => return Ok(Some(start)),
        Some((ObjectKind::Commit, _)) => queue.push_back(start),
        Some((ObjectKind::Tree, _)) => trees.push(start),
        Some(_) => {}
    }

    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if known.contains(&id) || !seen.insert(id) {
            continue;
        }
        let Some(commit) = store.get_commit(&id)? else {
            return Ok(Some(id));
        };
        trees.push(commit.tree);
        queue.extend(commit.parents);
    }

    let mut seen = HashSet::new();
    while let Some(id) = trees.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(tree) = store.get_tree(&id)? else {
            return Ok(Some(id));
        };
        for entry in tree.iter() {
            match entry.mode {
                FileMode::Tree => trees.push(entry.id),
                FileMode::Gitlink => {}
                _ => {
                    if !store.contains(&entry.id)? {
                        return Ok(Some(entry.id));
                    }
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Commit, Object, Signature, Tree, TreeEntry};
    use crate::packfile::PackWriter;
    use crate::pktline::PacketStream;
    use crate::storage::MemoryTargetStore;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Stream = PacketStream<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Stream, Stream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (PacketStream::new(ar, aw), PacketStream::new(br, bw))
    }

    fn commit(store: &mut MemoryTargetStore, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
        let tree = store.put(&Object::Tree(Tree::new())).unwrap();
        let sig = Signature::new("Ann", "ann@example.com", 1_700_000_000, 0);
        store
            .put(&Object::Commit(Commit {
                tree,
                parents,
                author: sig.clone(),
                committer: sig,
                encoding: None,
                message: msg.as_bytes().to_vec(),
            }))
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_request_line() {
        let (mut client, mut server) = pair();
        client
            .write_lines(&["git-receive-pack /srv/repo".to_string()])
            .await
            .unwrap();
        client.flush().await.unwrap();
        let (service, path) = read_request(&mut server).await.unwrap();
        assert_eq!(service, Service::ReceivePack);
        assert_eq!(path, "/srv/repo");
    }

    #[tokio::test]
    async fn test_receive_pack_checks_each_command() {
        let mut store = MemoryTargetStore::new();
        let base = commit(&mut store, vec![], "base");
        let side = commit(&mut store, vec![], "side");
        store.set_ref("refs/heads/main", base).unwrap();
        store.set_ref("refs/heads/old", base).unwrap();
        store.set_ref("refs/heads/side", side).unwrap();

        let mut client_store = store.clone();
        let next = commit(&mut client_store, vec![base], "next");
        let mut writer = PackWriter::new();
        let (kind, body) = client_store.get_raw(&next).unwrap().unwrap();
        assert_eq!(kind, ObjectKind::Commit);
        writer.add_object(kind, body);
        let pack = writer.finish().unwrap();

        let commands = vec![
            RefUpdate { ref_name: "refs/heads/main".into(), old: base, new: next, force: false },
            RefUpdate { ref_name: "refs/heads/old".into(), old: base, new: ObjectId::NULL, force: false },
            RefUpdate { ref_name: "refs/heads/stale".into(), old: base, new: next, force: false },
            RefUpdate { ref_name: "refs/heads/ghost".into(), old: ObjectId::NULL, new: ObjectId::new([9; 20]), force: false },
            RefUpdate { ref_name: "refs/heads/side".into(), old: side, new: next, force: false },
        ];

        let (mut client, mut server) = pair();
        let client_side = async {
            let advertised = protocol::read_advertisement(&mut client).await.unwrap();
            assert_eq!(advertised.len(), 3);
            let lines: Vec<String> = commands.iter().map(RefUpdate::to_line).collect();
            client.write_lines(&lines).await.unwrap();
            for packet in pktline::chunk(&pack) {
                client.write_packet(&packet).await.unwrap();
            }
            client.write_packet(&Packet::Flush).await.unwrap();
            client.flush().await.unwrap();
            client.read_until_flush().await.unwrap()
        };
        let (report, statuses) = tokio::join!(client_side, serve_receive_pack(&mut server, &mut store));
        let statuses = statuses.unwrap();

        let report: Vec<String> = report.into_iter().map(|d| Packet::Data(d).text().unwrap()).collect();
        assert_eq!(
            report,
            vec![
                "ok refs/heads/main",
                "ok refs/heads/old",
                "ng refs/heads/stale stale old value",
                "ng refs/heads/ghost missing object",
                "ng refs/heads/side non-fast-forward",
            ]
        );
        assert_eq!(statuses.len(), 5);
        assert!(statuses[0].error.is_none());

        let refs = store.refs().unwrap();
        assert_eq!(refs["refs/heads/main"], next);
        assert!(!refs.contains_key("refs/heads/old"));
        assert_eq!(refs["refs/heads/side"], side);
    }

    #[tokio::test]
    async fn test_upload_pack_with_no_wants_sends_nothing() {
        let mut store = MemoryTargetStore::new();
        let base = commit(&mut store, vec![], "base");
        store.set_ref("refs/heads/main", base).unwrap();

        let (mut client, mut server) = pair();
        let client_side = async {
            let advertised = protocol::read_advertisement(&mut client).await.unwrap();
            client.write_packet(&Packet::Flush).await.unwrap();
            client.flush().await.unwrap();
            advertised
        };
        let (advertised, sent) = tokio::join!(client_side, serve_upload_pack(&mut server, &store));
        assert_eq!(advertised["refs/heads/main"], base);
        assert_eq!(sent.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upload_pack_rejects_unknown_want() {
        let store = MemoryTargetStore::new();
        let (mut client, mut server) = pair();
        let client_side = async {
            protocol::read_advertisement(&mut client).await.unwrap();
            client
                .write_lines(&[format!("want {}", ObjectId::new([3; 20]))])
                .await
                .unwrap();
        };
        let (_, served) = tokio::join!(client_side, serve_upload_pack(&mut server, &store));
        assert!(matches!(served, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_receive_pack_refuses_incomplete_history() {
        let mut store = MemoryTargetStore::new();
        let base = commit(&mut store, vec![], "base");
        store.set_ref("refs/heads/main", base).unwrap();

        // The client has a parent and a file the pack leaves out
        let mut client_store = store.clone();
        let parent = commit(&mut client_store, vec![base], "parent");
        let child = commit(&mut client_store, vec![parent], "child");
        let blob = client_store.put(&Object::Blob(Blob::new(b"data".to_vec()))).unwrap();
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("f", FileMode::Regular, blob));
        let tree = client_store.put(&Object::Tree(tree)).unwrap();
        let sig = Signature::new("Ann", "ann@example.com", 1_700_000_000, 0);
        let with_file = client_store
            .put(&Object::Commit(Commit {
                tree,
                parents: vec![base],
                author: sig.clone(),
                committer: sig,
                encoding: None,
                message: b"file".to_vec(),
            }))
            .unwrap();

        let mut writer = PackWriter::new();
        for id in [child, with_file, tree] {
            let (kind, body) = client_store.get_raw(&id).unwrap().unwrap();
            writer.add_object(kind, body);
        }
        let pack = writer.finish().unwrap();

        let commands = vec![
            RefUpdate { ref_name: "refs/heads/main".into(), old: base, new: child, force: false },
            RefUpdate { ref_name: "refs/heads/file".into(), old: ObjectId::NULL, new: with_file, force: false },
        ];
        let (mut client, mut server) = pair();
        let client_side = async {
            protocol::read_advertisement(&mut client).await.unwrap();
            let lines: Vec<String> = commands.iter().map(RefUpdate::to_line).collect();
            client.write_lines(&lines).await.unwrap();
            for packet in pktline::chunk(&pack) {
                client.write_packet(&packet).await.unwrap();
            }
            client.write_packet(&Packet::Flush).await.unwrap();
            client.flush().await.unwrap();
            client.read_until_flush().await.unwrap()
        };
        let (report, statuses) = tokio::join!(client_side, serve_receive_pack(&mut server, &mut store));
        statuses.unwrap();

        let report: Vec<String> = report.into_iter().map(|d| Packet::Data(d).text().unwrap()).collect();
        assert_eq!(
            report,
            vec!["ng refs/heads/main missing object", "ng refs/heads/file missing object"]
        );
        let refs = store.refs().unwrap();
        assert_eq!(refs["refs/heads/main"], base);
        assert!(!refs.contains_key("refs/heads/file"));
    }

    #[test]
    fn test_history_check_stops_at_known_refs() {
        let mut store = MemoryTargetStore::new();
        let base = commit(&mut store, vec![], "base");
        let next = commit(&mut store, vec![base], "next");
        store.set_ref("refs/heads/main", base).unwrap();
        assert_eq!(first_missing(&store, &next).unwrap(), None);
        let ghost = ObjectId::new([5; 20]);
        assert_eq!(first_missing(&store, &ghost).unwrap(), Some(ghost));
    }
}
