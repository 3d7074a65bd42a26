//! Binary hunk deltas.
//!
//! A delta is a sequence of hunks `start, end, len` (u32 big-endian) plus
//! `len` bytes of replacement data: bytes `base[start..end]` are replaced by
//! the data. Hunks are sorted and never overlap. The same format carries the
//! footer's message/author fallback and pack ref-deltas.

use crate::error::{Result, SyncError};

/// Compute a delta that turns `base` into `target`.
pub fn diff(base: &[u8], target: &[u8]) -> Vec<u8> {
    if base == target {
        return Vec::new();
    }
    let prefix = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let start = prefix;
    let end = base.len() - suffix;
    let data = &target[prefix..target.len() - suffix];

    let mut out = Vec::with_capacity(12 + data.len());
    out.extend_from_slice(&(start as u32).to_be_bytes());
    out.extend_from_slice(&(end as u32).to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Apply a delta produced by [`diff`] (or any well-formed hunk list).
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(base.len());
    let mut last = 0usize;
    let mut pos = 0usize;
    while pos < delta.len() {
        let header = delta
            .get(pos..pos + 12)
            .ok_or_else(|| SyncError::malformed("truncated delta hunk header"))?;
        let start = read_u32(&header[0..4]);
        let end = read_u32(&header[4..8]);
        let len = read_u32(&header[8..12]);
        pos += 12;

        if start < last || end < start || end > base.len() {
            return Err(SyncError::malformed(format!(
                "delta hunk {}..{} out of range for base of {} bytes",
                start,
                end,
                base.len()
            )));
        }
        let data = delta
            .get(pos..pos + len)
            .ok_or_else(|| SyncError::malformed("truncated delta hunk data"))?;
        pos += len;

        out.extend_from_slice(&base[last..start]);
        out.extend_from_slice(data);
        last = end;
    }
    out.extend_from_slice(&base[last..]);
    Ok(out)
}

fn read_u32(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs_give_empty_delta() {
        assert!(diff(b"same", b"same").is_empty());
        assert_eq!(apply(b"same", &[]).unwrap(), b"same");
    }

    #[test]
    fn test_single_byte_change_is_compact() {
        let base = b"Caf? au lait, 200 words of message body follow";
        let target = b"Caf\xe9 au lait, 200 words of message body follow";
        let delta = diff(base, target);
        assert_eq!(delta.len(), 12 + 1);
        assert_eq!(apply(base, &delta).unwrap(), target.to_vec());
    }

    #[test]
    fn test_insert_and_truncate() {
        let delta = diff(b"abc", b"abXYc");
        assert_eq!(apply(b"abc", &delta).unwrap(), b"abXYc");
        let delta = diff(b"abcdef", b"ab");
        assert_eq!(apply(b"abcdef", &delta).unwrap(), b"ab");
        let delta = diff(b"", b"new");
        assert_eq!(apply(b"", &delta).unwrap(), b"new");
    }

    #[test]
    fn test_repeated_bytes_do_not_double_count() {
        let delta = diff(b"aaaa", b"aa");
        assert_eq!(apply(b"aaaa", &delta).unwrap(), b"aa");
    }

    #[test]
    fn test_multi_hunk_apply() {
        let mut delta = Vec::new();
        for (start, end, data) in [(0u32, 1u32, &b"X"[..]), (3, 4, &b"YZ"[..])] {
            delta.extend_from_slice(&start.to_be_bytes());
            delta.extend_from_slice(&end.to_be_bytes());
            delta.extend_from_slice(&(data.len() as u32).to_be_bytes());
            delta.extend_from_slice(data);
        }
        assert_eq!(apply(b"abcd", &delta).unwrap(), b"XbcYZ");
    }

    #[test]
    fn test_out_of_range_hunk_is_rejected() {
        let mut delta = Vec::new();
        delta.extend_from_slice(&0u32.to_be_bytes());
        delta.extend_from_slice(&10u32.to_be_bytes());
        delta.extend_from_slice(&0u32.to_be_bytes());
        assert!(apply(b"short", &delta).is_err());
        assert!(apply(b"short", &delta[..5]).is_err());
    }
}
