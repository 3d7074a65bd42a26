//! hgit Core Library
//!
//! Bidirectional synchronization between a changeset/manifest/filelog
//! repository (the source) and a commit/tree/blob repository (the target):
//! - Object models for both systems and their store backends
//! - ObjectMapper: persistent bijection between source and target ids
//! - IncrementalTreeExporter: snapshot export reusing unchanged subtrees
//! - CommitTranslator: metadata translation with a lossless message footer
//! - RefSynchronizer: bookmarks, named branches and tags as target refs
//! - TransportNegotiator: pack protocol client, plus the serving peer
//! - OverlayView: read-only preview of not-yet-imported commits
//! - SyncSession, configuration and run log

pub mod charset;
pub mod delta;
pub mod error;
pub mod export;
pub mod footer;
pub mod identity;
pub mod mapping;
pub mod negotiator;
pub mod object;
pub mod octopus;
pub mod overlay;
pub mod packfile;
pub mod peer;
pub mod pktline;
pub mod protocol;
pub mod refs;
pub mod session;
pub mod source;
pub mod storage;
pub mod subrepo;
pub mod sync;
pub mod topo;
pub mod translate;
pub mod transport;
pub mod treediff;

pub use error::{Result, SyncError};
pub use export::IncrementalTreeExporter;
pub use mapping::{ObjectMapper, TagMap};
pub use negotiator::{NegotiationState, TransferStats, TransportNegotiator};
pub use object::{Blob, Commit, FileMode, Object, ObjectId, ObjectKind, Signature, Tag, Tree, TreeEntry};
pub use overlay::{OverlayChangeset, OverlayManifest, OverlayView};
pub use refs::{RefReport, RefSynchronizer, RemoteRefLog};
pub use session::{SyncReport, SyncSession, VerifyReport};
pub use source::{Changeset, FileRevision, Manifest, ManifestEntry, NodeId};
pub use storage::{
    DiskSourceStore, DiskTargetStore, LayeredTargetStore, MemorySourceStore, MemoryTargetStore, SourceStore,
    StorageError, TargetStore,
};
pub use sync::{SyncConfig, SyncDirection, SyncLog, SyncLogEntry};
pub use translate::CommitTranslator;
pub use transport::{DuplexTransport, HttpTransport, SshTransport, TcpTransport, Transport};
