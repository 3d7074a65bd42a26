//! Fetch and push against an in-process peer.

mod common;

use common::CommitBuilder;
use hgit_core::overlay::overlay_node;
use hgit_core::peer;
use hgit_core::pktline::PacketStream;
use hgit_core::protocol::Service;
use hgit_core::{
    DuplexTransport, MemorySourceStore, MemoryTargetStore, NegotiationState, NodeId, OverlayView, SourceStore,
    SyncConfig, SyncError, SyncSession, TargetStore, TcpTransport, Transport, TransportNegotiator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type MemSession = SyncSession<MemorySourceStore, MemoryTargetStore>;

fn session(source: MemorySourceStore) -> MemSession {
    SyncSession::new(source, MemoryTargetStore::new(), SyncConfig::default())
}

fn empty_session() -> MemSession {
    session(MemorySourceStore::new())
}

fn remote() -> (Arc<Mutex<MemoryTargetStore>>, DuplexTransport<MemoryTargetStore>) {
    let store = Arc::new(Mutex::new(MemoryTargetStore::new()));
    let transport = DuplexTransport::new(Arc::clone(&store));
    (store, transport)
}

/// Two changesets on bookmark `main`
fn two_commits() -> (MemorySourceStore, NodeId, NodeId) {
    let mut source = MemorySourceStore::new();
    let a = CommitBuilder::new("first").file("README", b"hello\n").write(&mut source);
    let b = CommitBuilder::new("second")
        .parents(&[a])
        .file("README", b"hello\n")
        .file("src/lib.rs", b"pub fn answer() -> u32 { 42 }\n")
        .write(&mut source);
    source.set_bookmark("main", b).unwrap();
    (source, a, b)
}

#[tokio::test]
async fn test_push_then_pull_reproduces_history() {
    let (remote_store, transport) = remote();
    let (source, a, b) = two_commits();

    let mut alice = session(source);
    let pushed = alice.push("origin", &transport, false).await.unwrap();
    assert_eq!(pushed.commits, 2);
    assert!(pushed.refs.conflicts.is_empty());
    assert!(pushed.refs.updated.contains(&"refs/heads/main".to_string()));
    assert!(pushed.stats.objects > 0);

    let b_commit = alice.mapper().lookup_forward(&b).unwrap().unwrap();
    assert_eq!(remote_store.lock().await.refs().unwrap()["refs/heads/main"], b_commit);
    assert_eq!(alice.target().refs().unwrap()["refs/remotes/origin/main"], b_commit);

    let mut bob = empty_session();
    let pulled = bob.pull("origin", &transport, false).await.unwrap();
    assert_eq!(pulled.commits, 2);
    assert!(pulled.stats.objects > 0);
    assert_eq!(bob.source().bookmarks().unwrap()["main"], b);
    assert_eq!(bob.mapper().lookup_backward(&b_commit).unwrap(), Some(b));
    assert!(bob.source().contains_changeset(&a).unwrap());

    let again = bob.pull("origin", &transport, false).await.unwrap();
    assert_eq!(again.commits, 0);
    assert_eq!(again.stats.objects, 0);
}

#[tokio::test]
async fn test_incremental_push_sends_only_new_objects() {
    let (remote_store, transport) = remote();
    let (source, _, b) = two_commits();
    let mut alice = session(source);
    alice.push("origin", &transport, false).await.unwrap();

    let large: Vec<u8> = (0..4096u32).flat_map(|i| format!("line {}\n", i).into_bytes()).collect();
    let mut edited = large.clone();
    edited.extend_from_slice(b"one more line\n");
    let c = CommitBuilder::new("big file")
        .parents(&[b])
        .file("README", b"hello\n")
        .file("data.txt", &large)
        .file("src/lib.rs", b"pub fn answer() -> u32 { 42 }\n")
        .write(alice.source_mut());
    alice.source_mut().set_bookmark("main", c).unwrap();
    let middle = alice.push("origin", &transport, false).await.unwrap();
    assert_eq!(middle.commits, 1);

    let d = CommitBuilder::new("grow big file")
        .parents(&[c])
        .file("README", b"hello\n")
        .file("data.txt", &edited)
        .file("src/lib.rs", b"pub fn answer() -> u32 { 42 }\n")
        .write(alice.source_mut());
    alice.source_mut().set_bookmark("main", d).unwrap();
    let last = alice.push("origin", &transport, false).await.unwrap();
    assert!(last.refs.conflicts.is_empty());
    // commit, root tree and the edited blob, the blob as a delta
    assert_eq!(last.stats.objects, 3);
    assert!(last.stats.bytes < middle.stats.bytes);

    let d_commit = alice.mapper().lookup_forward(&d).unwrap().unwrap();
    let remote_store = remote_store.lock().await;
    assert_eq!(remote_store.refs().unwrap()["refs/heads/main"], d_commit);
    let tree = remote_store.commit(&d_commit).unwrap().tree;
    let (_, blob) = hgit_core::treediff::lookup(&*remote_store, tree, "data.txt").unwrap().unwrap();
    assert_eq!(remote_store.get_blob(&blob).unwrap().unwrap().data, edited);
}

#[tokio::test]
async fn test_non_fast_forward_push_is_rejected_per_ref() {
    let (remote_store, transport) = remote();
    let (source, _, b) = two_commits();
    let mut alice = session(source);
    alice.push("origin", &transport, false).await.unwrap();
    let b_commit = alice.mapper().lookup_forward(&b).unwrap().unwrap();

    let mut other = MemorySourceStore::new();
    let root = CommitBuilder::new("unrelated").file("x", b"x").write(&mut other);
    other.set_bookmark("main", root).unwrap();
    other.set_bookmark("topic", root).unwrap();
    let mut carol = session(other);

    let report = carol.push("origin", &transport, false).await.unwrap();
    assert!(report.refs.has_conflicts());
    assert!(report.refs.conflicts.iter().all(|e| !e.is_fatal()));
    assert!(report.refs.conflicts.iter().any(
        |e| matches!(e, SyncError::RefConflict { ref_name, .. } if ref_name == "refs/heads/main")
    ));
    // a brand-new ref is unaffected by the rejected one
    assert!(report.refs.updated.contains(&"refs/heads/topic".to_string()));
    assert_eq!(remote_store.lock().await.refs().unwrap()["refs/heads/main"], b_commit);

    let forced = carol.push("origin", &transport, true).await.unwrap();
    assert!(forced.refs.conflicts.is_empty());
    let root_commit = carol.mapper().lookup_forward(&root).unwrap().unwrap();
    assert_eq!(remote_store.lock().await.refs().unwrap()["refs/heads/main"], root_commit);
}

#[tokio::test]
async fn test_pull_prunes_deleted_remote_heads() {
    let (remote_store, transport) = remote();
    let (mut source, a, _) = two_commits();
    source.set_bookmark("feature", a).unwrap();
    let mut alice = session(source);
    alice.push("origin", &transport, false).await.unwrap();

    let mut bob = empty_session();
    bob.pull("origin", &transport, false).await.unwrap();
    assert!(bob.target().refs().unwrap().contains_key("refs/remotes/origin/feature"));
    assert_eq!(bob.source().bookmarks().unwrap()["feature"], a);

    remote_store.lock().await.delete_ref("refs/heads/feature").unwrap();
    let report = bob.pull("origin", &transport, false).await.unwrap();
    assert_eq!(report.refs.deleted, vec!["refs/remotes/origin/feature".to_string()]);
    assert!(!bob.target().refs().unwrap().contains_key("refs/remotes/origin/feature"));
    assert!(bob.target().refs().unwrap().contains_key("refs/remotes/origin/main"));
}

#[tokio::test]
async fn test_incoming_previews_without_importing() {
    let (_, transport) = remote();
    let (source, _, b) = two_commits();
    let mut alice = session(source);
    alice.push("origin", &transport, false).await.unwrap();
    let b_commit = alice.mapper().lookup_forward(&b).unwrap().unwrap();

    let bob = empty_session();
    let (scratch, commits) = bob.incoming(&transport).await.unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits.last(), Some(&b_commit));

    let view = OverlayView::new(&scratch, bob.mapper(), bob.translator().clone(), commits);
    let changeset = view.changeset(&overlay_node(&b_commit)).unwrap();
    assert_eq!(changeset.description, b"second");
    assert_eq!(changeset.files, vec!["src/lib.rs".to_string()]);
    assert_eq!(changeset.parents.len(), 1);
    assert!(view.contains(&changeset.parents[0]));
    assert_eq!(
        changeset.manifest().read("src/lib.rs").unwrap(),
        Some(b"pub fn answer() -> u32 { 42 }\n".to_vec())
    );

    drop(view);
    drop(scratch);
    assert!(bob.target().is_empty());
    assert!(bob.mapper().is_empty().unwrap());
    assert!(bob.source().changesets().unwrap().is_empty());
}

/// Exports a linear chain of `len` changesets and returns the target store
/// with `refs/heads/main` at the tip, plus every commit id in order
fn chain(len: usize) -> (MemoryTargetStore, Vec<hgit_core::ObjectId>) {
    let mut source = MemorySourceStore::new();
    let mut nodes = Vec::new();
    for i in 0..len {
        let content = format!("revision {}\n", i);
        let spec = CommitBuilder::new(&format!("commit {}", i)).file("f", content.as_bytes());
        let spec = match nodes.last() {
            Some(parent) => spec.parents(&[*parent]),
            None => spec,
        };
        nodes.push(spec.write(&mut source));
    }
    let mut session = session(source);
    session.export(None).unwrap();
    let ids: Vec<_> = nodes
        .iter()
        .map(|n| session.mapper().lookup_forward(n).unwrap().unwrap())
        .collect();
    let mut target = session.target().clone();
    for name in target.refs().unwrap().into_keys() {
        target.delete_ref(&name).unwrap();
    }
    target.set_ref("refs/heads/main", *ids.last().unwrap()).unwrap();
    (target, ids)
}

#[tokio::test]
async fn test_fetch_negotiates_common_history() {
    let (remote_store, ids) = chain(41);
    let mut local = MemoryTargetStore::new();
    let (older, _) = chain(40);
    for id in &ids[..40] {
        let (kind, body) = older.get_raw(id).unwrap().unwrap();
        local.put_raw(kind, &body).unwrap();
        let tree = older.commit(id).unwrap().tree;
        let (kind, body) = older.get_raw(&tree).unwrap().unwrap();
        local.put_raw(kind, &body).unwrap();
        let (_, blob) = hgit_core::treediff::lookup(&older, tree, "f").unwrap().unwrap();
        let (kind, body) = older.get_raw(&blob).unwrap().unwrap();
        local.put_raw(kind, &body).unwrap();
    }
    local.set_ref("refs/heads/main", ids[39]).unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(client);
    let mut client_io = PacketStream::new(reader, writer);
    let (reader, writer) = tokio::io::split(server);
    let mut server_io = PacketStream::new(reader, writer);

    let mut negotiator = TransportNegotiator::default();
    let (fetched, served) = tokio::join!(
        negotiator.fetch(&mut client_io, &mut local),
        peer::serve_upload_pack(&mut server_io, &remote_store)
    );
    let outcome = fetched.unwrap();
    assert_eq!(served.unwrap(), 3);
    assert_eq!(outcome.stats.objects, 3);
    assert!(outcome.stats.haves_sent >= 1);
    assert_eq!(outcome.wants.len(), 1);
    assert!(local.contains(&ids[40]).unwrap());
    assert_eq!(negotiator.state(), NegotiationState::Done);
}

#[tokio::test]
async fn test_fetch_fails_when_peer_hangs_up() {
    let (client, server) = tokio::io::duplex(1024);
    drop(server);
    let (reader, writer) = tokio::io::split(client);
    let mut io = PacketStream::new(reader, writer);
    let mut store = MemoryTargetStore::new();

    let mut negotiator = TransportNegotiator::new(Duration::from_secs(5));
    let result = negotiator.fetch(&mut io, &mut store).await;
    assert!(matches!(result, Err(SyncError::Transport(_))));
    assert_eq!(negotiator.state(), NegotiationState::Failed);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_fetch_over_tcp() {
    let (remote_store, ids) = chain(3);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, writer) = socket.into_split();
        let mut io = PacketStream::new(reader, writer);
        let (service, path) = peer::read_request(&mut io).await.unwrap();
        assert_eq!(service, Service::UploadPack);
        assert_eq!(path, "/repo");
        peer::serve_upload_pack(&mut io, &remote_store).await.unwrap()
    });

    let transport = TcpTransport::new(addr.to_string(), "/repo");
    assert_eq!(transport.describe(), format!("tcp://{}/repo", addr));
    let mut conn = transport.connect(Service::UploadPack).await.unwrap();
    let mut store = MemoryTargetStore::new();
    let mut negotiator = TransportNegotiator::default();
    let outcome = negotiator.fetch(conn.as_mut(), &mut store).await.unwrap();

    assert_eq!(server.await.unwrap(), 9);
    assert_eq!(outcome.refs["refs/heads/main"], ids[2]);
    for id in &ids {
        assert!(store.contains(id).unwrap());
    }
}
