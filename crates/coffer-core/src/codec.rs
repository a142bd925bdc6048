//! Record codec — serialization and framing for data-file and WAL records
//!
//! Every on-disk record is a 4-byte little-endian length header followed by
//! that many bytes of JSON payload. The same framing carries data-file
//! entries and WAL operations; only the payload type differs. The codec is
//! read-only framing: it owns no file handles and no mutable state.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CofferError, CofferResult};

/// Size of the length header preceding every record
pub const FRAME_HEADER_SIZE: usize = 4;

/// A key-value entry with its write time and optional relative expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

impl Entry {
    /// Entry written now, never expiring.
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value, timestamp: Utc::now(), ttl: None }
    }

    /// Entry written now, expiring `ttl` after its write time.
    pub fn with_ttl(key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> Self {
        Self { key, value, timestamp: Utc::now(), ttl: Some(ttl) }
    }

    /// Expired iff a ttl is set and more than ttl has elapsed since the
    /// write time. Evaluated against the wall clock at call time; a
    /// timestamp in the future counts as not expired.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => match Utc::now().signed_duration_since(self.timestamp).to_std() {
                Ok(age) => age > ttl,
                Err(_) => false,
            },
        }
    }
}

/// Opcode of a WAL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Set,
    Delete,
}

/// A single framed operation in the write-ahead log.
///
/// `value` is absent for deletes. `timestamp`/`ttl` carry the entry
/// metadata so replay reconstructs expiring writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

/// Serialize a record and prepend its 4-byte little-endian length header.
pub fn encode_frame<T: Serialize>(record: &T, path: &Path) -> CofferResult<Vec<u8>> {
    let payload = serde_json::to_vec(record).map_err(|e| CofferError::Malformed {
        path: path.to_path_buf(),
        offset: 0,
        reason: format!("failed to serialize record: {}", e),
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Deserialize one payload, reporting Malformed with file context on failure.
pub fn decode_payload<T: DeserializeOwned>(
    payload: &[u8],
    path: &Path,
    offset: u64,
) -> CofferResult<T> {
    serde_json::from_slice(payload).map_err(|e| CofferError::Malformed {
        path: path.to_path_buf(),
        offset,
        reason: format!("payload does not deserialize: {}", e),
    })
}

/// Decode a buffer of consecutive frames into records, in append order.
///
/// Fails with Malformed if a length header is truncated or claims more
/// bytes than remain in the buffer.
pub fn decode_frames<T: DeserializeOwned>(bytes: &[u8], path: &Path) -> CofferResult<Vec<T>> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let (payload, next) = next_frame(bytes, offset, path)?;
        records.push(decode_payload(payload, path, offset as u64)?);
        offset = next;
    }

    Ok(records)
}

/// Walk the frames of a buffer without deserializing payloads.
/// Returns the frame count; fails on the same conditions as decode_frames.
pub fn walk_frames(bytes: &[u8], path: &Path) -> CofferResult<usize> {
    let mut count = 0usize;
    let mut offset = 0usize;

    while offset < bytes.len() {
        let (_, next) = next_frame(bytes, offset, path)?;
        count += 1;
        offset = next;
    }

    Ok(count)
}

/// Slice the frame starting at `offset`, returning (payload, next offset).
fn next_frame<'a>(bytes: &'a [u8], offset: usize, path: &Path) -> CofferResult<(&'a [u8], usize)> {
    if offset + FRAME_HEADER_SIZE > bytes.len() {
        return Err(CofferError::Malformed {
            path: path.to_path_buf(),
            offset: offset as u64,
            reason: format!(
                "truncated length header: {} bytes remain, need {}",
                bytes.len() - offset,
                FRAME_HEADER_SIZE
            ),
        });
    }

    let len = u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]) as usize;

    let payload_start = offset + FRAME_HEADER_SIZE;
    let payload_end = payload_start + len;
    if payload_end > bytes.len() {
        return Err(CofferError::Malformed {
            path: path.to_path_buf(),
            offset: offset as u64,
            reason: format!(
                "frame length {} exceeds remaining file ({} bytes)",
                len,
                bytes.len() - payload_start
            ),
        });
    }

    Ok((&bytes[payload_start..payload_end], payload_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> PathBuf {
        PathBuf::from("<test>")
    }

    #[test]
    fn test_entry_frame_roundtrip() {
        let entry = Entry::new(b"user:1".to_vec(), b"Alice".to_vec());
        let frame = encode_frame(&entry, &ctx()).unwrap();

        let decoded: Vec<Entry> = decode_frames(&frame, &ctx()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], entry);
    }

    #[test]
    fn test_wal_record_roundtrip() {
        let set = WalRecord {
            op: WalOp::Set,
            key: b"k".to_vec(),
            value: Some(b"v".to_vec()),
            timestamp: Utc::now(),
            ttl: Some(Duration::from_secs(30)),
        };
        let del = WalRecord {
            op: WalOp::Delete,
            key: b"k".to_vec(),
            value: None,
            timestamp: Utc::now(),
            ttl: None,
        };

        let mut buf = encode_frame(&set, &ctx()).unwrap();
        buf.extend_from_slice(&encode_frame(&del, &ctx()).unwrap());

        let decoded: Vec<WalRecord> = decode_frames(&buf, &ctx()).unwrap();
        assert_eq!(decoded, vec![set, del]);
    }

    #[test]
    fn test_expiry_semantics() {
        let mut entry = Entry::with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(60));
        assert!(!entry.is_expired());

        entry.timestamp = Utc::now() - chrono::Duration::seconds(120);
        assert!(entry.is_expired());

        entry.ttl = None;
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_future_timestamp_not_expired() {
        let mut entry = Entry::with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(1));
        entry.timestamp = Utc::now() + chrono::Duration::seconds(3600);
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_overlong_frame_rejected() {
        let mut frame = encode_frame(&Entry::new(b"k".to_vec(), b"v".to_vec()), &ctx()).unwrap();
        // Claim 4 GiB-ish payload in the header
        frame[0..4].copy_from_slice(&u32::MAX.to_le_bytes());

        let result: CofferResult<Vec<Entry>> = decode_frames(&frame, &ctx());
        assert!(matches!(result, Err(CofferError::Malformed { .. })));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let frame = encode_frame(&Entry::new(b"k".to_vec(), b"v".to_vec()), &ctx()).unwrap();
        let truncated = &frame[..frame.len() - 1];

        let result: CofferResult<Vec<Entry>> = decode_frames(truncated, &ctx());
        assert!(matches!(result, Err(CofferError::Malformed { .. })));

        // 2 stray bytes cannot even hold a header
        assert!(matches!(walk_frames(&frame[..2], &ctx()), Err(CofferError::Malformed { .. })));
    }

    #[test]
    fn test_walk_counts_frames() {
        let mut buf = Vec::new();
        for i in 0..5 {
            let entry = Entry::new(format!("k{}", i).into_bytes(), b"v".to_vec());
            buf.extend_from_slice(&encode_frame(&entry, &ctx()).unwrap());
        }
        assert_eq!(walk_frames(&buf, &ctx()).unwrap(), 5);
        assert_eq!(walk_frames(&[], &ctx()).unwrap(), 0);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&5u32.to_le_bytes());
        frame.extend_from_slice(b"{oops");

        let result: CofferResult<Vec<Entry>> = decode_frames(&frame, &ctx());
        assert!(matches!(result, Err(CofferError::Malformed { .. })));
    }
}
