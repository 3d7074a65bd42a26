//! Pack stream format
//!
//! ```text
//! "PACK" | version u32 BE | count u32 BE
//! entry*: kind u8 | size u32 BE | [base id, 20 bytes, ref-delta only]
//!         | zstd length u32 BE | zstd bytes
//! trailer: SHA-1 over everything above
//! ```
//!
//! Ref-delta entries (kind 7) carry a hunk delta against a base object that
//! is either earlier in the pack or, for thin packs, already in the
//! receiver's store.

use crate::delta;
use crate::error::{Result, SyncError};
use crate::object::{ObjectId, ObjectKind};
use crate::storage::TargetStore;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use zstd::stream::{decode_all as zstd_decode, encode_all as zstd_encode};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
const REF_DELTA: u8 = 7;
const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 20;
/// kind, size and compressed length
const MIN_ENTRY_LEN: usize = 9;

/// One entry queued for writing
#[derive(Debug, Clone)]
pub enum PackEntry {
    Full { kind: ObjectKind, data: Vec<u8> },
    RefDelta { base: ObjectId, delta: Vec<u8> },
}

/// A fully resolved object read from a pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

/// Packfile writer
#[derive(Debug, Default)]
pub struct PackWriter {
    entries: Vec<PackEntry>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a complete object
    pub fn add_object(&mut self, kind: ObjectKind, data: Vec<u8>) {
        self.entries.push(PackEntry::Full { kind, data });
    }

    /// Add an object as a delta against `base`
    pub fn add_delta(&mut self, base: ObjectId, delta: Vec<u8>) {
        self.entries.push(PackEntry::RefDelta { base, delta });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the pack, trailer included
    pub fn finish(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(PACK_SIGNATURE);
        out.extend_from_slice(&PACK_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for entry in &self.entries {
            let (code, data) = match entry {
                PackEntry::Full { kind, data } => (kind.pack_code(), data),
                PackEntry::RefDelta { delta, .. } => (REF_DELTA, delta),
            };
            out.push(code);
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            if let PackEntry::RefDelta { base, .. } = entry {
                out.extend_from_slice(base.as_bytes());
            }
            let compressed = zstd_encode(&data[..], 0)?;
            out.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
            out.extend_from_slice(&compressed);
        }

        let trailer = Sha1::digest(&out);
        out.extend_from_slice(&trailer);
        Ok(out)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| SyncError::protocol("truncated pack"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse and fully resolve a pack.
///
/// Delta bases missing from the pack are looked up in `store`; a base found
/// in neither is a fatal protocol error, so a thin pack never half-applies.
pub fn read_pack<T: TargetStore>(data: &[u8], store: &T) -> Result<Vec<PackedObject>> {
    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(SyncError::protocol("pack too short"));
    }
    let (body, trailer) = data.split_at(data.len() - TRAILER_LEN);
    if Sha1::digest(body).as_slice() != trailer {
        return Err(SyncError::protocol("pack trailer checksum mismatch"));
    }

    let mut cursor = Cursor { data: body, pos: 0 };
    if cursor.take(4)? != PACK_SIGNATURE {
        return Err(SyncError::protocol("missing PACK signature"));
    }
    let version = cursor.u32()?;
    if version != PACK_VERSION {
        return Err(SyncError::protocol(format!("unsupported pack version {}", version)));
    }
    let count = cursor.u32()? as usize;
    if count > (body.len() - HEADER_LEN) / MIN_ENTRY_LEN {
        return Err(SyncError::protocol(format!("pack claims {} entries in {} bytes", count, body.len())));
    }

    let mut resolved: Vec<PackedObject> = Vec::with_capacity(count);
    let mut by_id: HashMap<ObjectId, usize> = HashMap::new();
    let mut pending: Vec<(ObjectId, Vec<u8>)> = Vec::new();

    for _ in 0..count {
        let code = cursor.take(1)?[0];
        let size = cursor.u32()? as usize;
        let base = if code == REF_DELTA {
            Some(ObjectId::from_slice(cursor.take(20)?).ok_or_else(|| SyncError::protocol("bad delta base"))?)
        } else {
            None
        };
        let compressed_len = cursor.u32()? as usize;
        let payload = zstd_decode(cursor.take(compressed_len)?)
            .map_err(|e| SyncError::protocol(format!("pack entry failed to decompress: {}", e)))?;
        if payload.len() != size {
            return Err(SyncError::protocol(format!(
                "pack entry size mismatch: header {}, actual {}",
                size,
                payload.len()
            )));
        }

        match base {
            Some(base) => pending.push((base, payload)),
            None => {
                let kind = ObjectKind::from_pack_code(code)
                    .ok_or_else(|| SyncError::protocol(format!("unknown pack entry kind {}", code)))?;
                let id = ObjectId::for_object(kind, &payload);
                by_id.insert(id, resolved.len());
                resolved.push(PackedObject { id, kind, data: payload });
            }
        }
    }
    if cursor.pos != body.len() {
        return Err(SyncError::protocol("trailing bytes after pack entries"));
    }

    // Deltas may chain on each other in any order; resolve until stuck.
    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();
        for (base, delta_bytes) in pending {
            let base_object = match by_id.get(&base) {
                Some(&idx) => Some((resolved[idx].kind, resolved[idx].data.clone())),
                None => store.get_raw(&base)?,
            };
            match base_object {
                Some((kind, base_data)) => {
                    let data = delta::apply(&base_data, &delta_bytes)
                        .map_err(|e| SyncError::protocol(format!("bad delta against {}: {}", base, e)))?;
                    let id = ObjectId::for_object(kind, &data);
                    by_id.insert(id, resolved.len());
                    resolved.push(PackedObject { id, kind, data });
                }
                None => still_pending.push((base, delta_bytes)),
            }
        }
        if still_pending.len() == before {
            return Err(SyncError::protocol(format!(
                "thin pack left {} deltas unresolved (missing base {})",
                still_pending.len(),
                still_pending[0].0
            )));
        }
        pending = still_pending;
    }
    Ok(resolved)
}
