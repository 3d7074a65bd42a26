//! Sessions backed by on-disk stores and state files.

mod common;

use common::CommitBuilder;
use hgit_core::sync::state_dir;
use hgit_core::{SourceStore, SyncConfig, SyncError, SyncLog, SyncSession, TargetStore};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

#[test]
fn test_cancelled_run_leaves_map_file_untouched() {
    let dir = TempDir::new().unwrap();
    let map_path = state_dir(dir.path()).join("map");

    let mut session = SyncSession::open(dir.path()).unwrap();
    let a = CommitBuilder::new("A").file("f", b"1").write(session.source_mut());
    let b = CommitBuilder::new("B").parents(&[a]).file("f", b"2").write(session.source_mut());
    session.source_mut().set_bookmark("main", b).unwrap();

    session.cancel();
    assert!(matches!(session.export(None), Err(SyncError::Cancelled)));
    assert!(!map_path.exists());
    assert!(session.target().refs().unwrap().is_empty());

    session.cancel_handle().store(false, Ordering::Relaxed);
    assert_eq!(session.export(None).unwrap().commits, 2);
    let map = std::fs::read_to_string(&map_path).unwrap();
    assert_eq!(map.lines().count(), 2);
    drop(session);

    let entries = SyncLog::new(dir.path()).all().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().filter(|e| e.success).count(), 1);
    let failed = entries.iter().find(|e| !e.success).unwrap();
    assert_eq!(failed.error.as_deref(), Some("Sync cancelled"));

    // State survives reopening
    let mut reopened = SyncSession::open(dir.path()).unwrap();
    assert_eq!(reopened.mapper().len().unwrap(), 2);
    assert_eq!(reopened.export(None).unwrap().commits, 0);
    assert!(reopened.target().refs().unwrap().contains_key("refs/heads/main"));
}

#[test]
fn test_author_map_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config
        .authors
        .insert("bob".to_string(), "Bob Builder <bob@example.com>".to_string());
    config.save(dir.path()).unwrap();

    let mut session = SyncSession::open(dir.path()).unwrap();
    let node = CommitBuilder::new("fix")
        .file("f", b"1")
        .user(b"bob")
        .write(session.source_mut());
    session.export(None).unwrap();

    let id = session.mapper().lookup_forward(&node).unwrap().unwrap();
    let commit = session.target().commit(&id).unwrap();
    assert_eq!(commit.author.name, "Bob Builder");
    assert_eq!(commit.author.email, "bob@example.com");

    // Import recovers the original user through the footer
    let meta = session.translator().decode_metadata(&commit).unwrap();
    assert_eq!(meta.user, b"bob");
}

#[test]
fn test_tags_persist_across_sessions() {
    let dir = TempDir::new().unwrap();
    let mut session = SyncSession::open(dir.path()).unwrap();
    let node = CommitBuilder::new("release").file("f", b"1").write(session.source_mut());
    session.tags_mut().set("v1", node);
    session.export(None).unwrap();
    drop(session);

    let reopened = SyncSession::open(dir.path()).unwrap();
    assert_eq!(reopened.tags().get("v1"), Some(node));
    assert!(reopened.target().refs().unwrap().contains_key("refs/tags/v1"));
    assert!(reopened.source().contains_changeset(&node).unwrap());
}
