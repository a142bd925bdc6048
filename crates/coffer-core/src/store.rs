//! Disk storage backend — append-only data file plus offset index
//!
//! The data file is a sequence of length-prefixed records; the index maps
//! each key to the offset of its latest record's length header and is
//! rewritten to `index.db` after every mutation. Overwrites and deletes
//! leave dead records behind; `compact()` rewrites the data file to just
//! the live set.
//!
//! WRITE ORDERING (the durability contract): data-file append is synced
//! before the index rewrite, which is synced before the call returns. A
//! crash after the append but before the index persist leaves a dead
//! record that compaction reclaims.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, info, warn};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::backend::StorageBackend;
use crate::codec::{self, Entry, FRAME_HEADER_SIZE};
use crate::config::Config;
use crate::error::{CofferError, CofferResult};
use crate::platform::{durable_sync, read_exact_at};

/// Append-only record log
pub(crate) const DATA_FILE_NAME: &str = "data.db";
/// Persisted key -> offset map
pub(crate) const INDEX_FILE_NAME: &str = "index.db";
/// Write-ahead log, when the host wires one up
pub(crate) const WAL_FILE_NAME: &str = "wal.log";

/// Open file handles for the store. `None` in `StoreInner` means closed.
struct StoreFiles {
    data: File,
    index: File,
}

struct StoreInner {
    files: Option<StoreFiles>,
    index: HashMap<Vec<u8>, u64>,
    /// Always equals the data file length while the lock is held
    next_offset: u64,
}

/// Durable storage backend over a data directory.
///
/// One reader-writer lock serializes all state. The expiry-pruning read
/// path takes an upgradable read so it can promote to a writer without
/// releasing the lock.
pub struct DiskStore {
    dir: PathBuf,
    data_path: PathBuf,
    index_path: PathBuf,
    config: Config,
    inner: RwLock<StoreInner>,
}

impl DiskStore {
    /// Open or create a store in `dir`, loading the persisted index and
    /// computing the append offset from the data file length.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> CofferResult<Self> {
        config
            .validate()
            .map_err(|message| CofferError::InvalidArgument { message })?;

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| CofferError::Io {
            path: Some(dir.clone()),
            kind: e.kind(),
            message: format!("failed to create data directory: {}", e),
        })?;

        let data_path = dir.join(DATA_FILE_NAME);
        let index_path = dir.join(INDEX_FILE_NAME);

        let files = Self::open_files(&data_path, &index_path)?;
        let next_offset = files
            .data
            .metadata()
            .map_err(|e| CofferError::Io {
                path: Some(data_path.clone()),
                kind: e.kind(),
                message: format!("failed to stat data file: {}", e),
            })?
            .len();

        let index = Self::load_index(&files, &index_path, next_offset)?;
        debug!(
            "opened store at {} ({} indexed keys, {} data bytes)",
            dir.display(),
            index.len(),
            next_offset
        );

        Ok(Self {
            dir,
            data_path,
            index_path,
            config,
            inner: RwLock::new(StoreInner { files: Some(files), index, next_offset }),
        })
    }

    /// Data directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open_files(data_path: &Path, index_path: &Path) -> CofferResult<StoreFiles> {
        let data = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(data_path)
            .map_err(|e| CofferError::Io {
                path: Some(data_path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to open data file: {}", e),
            })?;

        let index = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(index_path)
            .map_err(|e| CofferError::Io {
                path: Some(index_path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to open index file: {}", e),
            })?;

        Ok(StoreFiles { data, index })
    }

    /// Parse the persisted index. An index that points past the end of the
    /// data file is stale (e.g. a crash between the compaction renames) and
    /// is rejected as Malformed so recovery can take over.
    fn load_index(
        files: &StoreFiles,
        index_path: &Path,
        data_len: u64,
    ) -> CofferResult<HashMap<Vec<u8>, u64>> {
        let mut bytes = Vec::new();
        let mut handle = &files.index;
        handle.read_to_end(&mut bytes).map_err(|e| CofferError::Io {
            path: Some(index_path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read index file: {}", e),
        })?;

        if bytes.is_empty() {
            return Ok(HashMap::new());
        }

        let pairs: Vec<(Vec<u8>, u64)> =
            serde_json::from_slice(&bytes).map_err(|e| CofferError::Malformed {
                path: index_path.to_path_buf(),
                offset: 0,
                reason: format!("index file does not parse: {}", e),
            })?;

        let mut index = HashMap::with_capacity(pairs.len());
        for (key, offset) in pairs {
            if offset + FRAME_HEADER_SIZE as u64 > data_len {
                return Err(CofferError::Malformed {
                    path: index_path.to_path_buf(),
                    offset,
                    reason: format!(
                        "index references offset {} past the end of the data file ({} bytes)",
                        offset, data_len
                    ),
                });
            }
            index.insert(key, offset);
        }
        Ok(index)
    }

    fn validate_key(&self, key: &[u8]) -> CofferResult<()> {
        if key.is_empty() || key.len() > self.config.max_key_size {
            return Err(CofferError::InvalidKey {
                length: key.len(),
                max: self.config.max_key_size,
            });
        }
        Ok(())
    }

    fn validate_value(&self, value: &[u8]) -> CofferResult<()> {
        if value.len() > self.config.max_value_size {
            return Err(CofferError::InvalidValue {
                length: value.len(),
                max: self.config.max_value_size,
            });
        }
        Ok(())
    }

    /// Read and decode the record whose length header starts at `offset`.
    fn read_entry(&self, files: &StoreFiles, offset: u64, file_len: u64) -> CofferResult<Entry> {
        if offset + FRAME_HEADER_SIZE as u64 > file_len {
            return Err(CofferError::Malformed {
                path: self.data_path.clone(),
                offset,
                reason: "length header past end of data file".to_string(),
            });
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        read_exact_at(&files.data, &mut header, offset).map_err(|e| CofferError::Io {
            path: Some(self.data_path.clone()),
            kind: e.kind(),
            message: format!("failed to read record header at offset {}: {}", offset, e),
        })?;

        let len = u32::from_le_bytes(header) as u64;
        if offset + FRAME_HEADER_SIZE as u64 + len > file_len {
            return Err(CofferError::Malformed {
                path: self.data_path.clone(),
                offset,
                reason: format!("frame length {} exceeds remaining data file", len),
            });
        }

        let mut payload = vec![0u8; len as usize];
        read_exact_at(&files.data, &mut payload, offset + FRAME_HEADER_SIZE as u64).map_err(
            |e| CofferError::Io {
                path: Some(self.data_path.clone()),
                kind: e.kind(),
                message: format!("failed to read record payload at offset {}: {}", offset, e),
            },
        )?;

        codec::decode_payload(&payload, &self.data_path, offset)
    }

    /// Append one record and sync it. The offset of the new record is
    /// captured from `next_offset` before the write; the append-mode handle
    /// guarantees the bytes land at the end of the file.
    fn append_entry(&self, inner: &mut StoreInner, entry: &Entry) -> CofferResult<u64> {
        let frame = codec::encode_frame(entry, &self.data_path)?;
        let offset = inner.next_offset;

        {
            let files = inner.files.as_ref().ok_or(CofferError::Closed)?;
            let mut handle = &files.data;
            handle.write_all(&frame).map_err(|e| CofferError::Io {
                path: Some(self.data_path.clone()),
                kind: e.kind(),
                message: format!("data file append failed: {}", e),
            })?;
            durable_sync(&files.data).map_err(|e| CofferError::Io {
                path: Some(self.data_path.clone()),
                kind: e.kind(),
                message: format!("data file sync failed: {}", e),
            })?;
        }

        inner.next_offset += frame.len() as u64;
        Ok(offset)
    }

    /// Rewrite the index file from scratch and sync it.
    fn persist_index(&self, inner: &StoreInner) -> CofferResult<()> {
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let pairs: Vec<(&Vec<u8>, &u64)> = inner.index.iter().collect();
        let bytes = serde_json::to_vec(&pairs).map_err(|e| CofferError::Malformed {
            path: self.index_path.clone(),
            offset: 0,
            reason: format!("failed to serialize index: {}", e),
        })?;

        let mut handle = &files.index;
        handle.seek(SeekFrom::Start(0)).map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("failed to seek index file: {}", e),
        })?;
        files.index.set_len(0).map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("failed to truncate index file: {}", e),
        })?;
        handle.write_all(&bytes).map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("failed to write index file: {}", e),
        })?;
        durable_sync(&files.index).map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("index file sync failed: {}", e),
        })?;

        Ok(())
    }

    fn set_entry(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> CofferResult<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;

        let mut inner = self.inner.write();
        if inner.files.is_none() {
            return Err(CofferError::Closed);
        }

        let entry = Entry {
            key: key.to_vec(),
            value: value.to_vec(),
            timestamp: chrono::Utc::now(),
            ttl,
        };
        let offset = self.append_entry(&mut inner, &entry)?;
        inner.index.insert(key.to_vec(), offset);
        self.persist_index(&inner)
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> CofferResult<()> {
        let dir = File::open(&self.dir).map_err(|e| CofferError::Io {
            path: Some(self.dir.clone()),
            kind: e.kind(),
            message: format!("failed to open directory for sync: {}", e),
        })?;
        durable_sync(&dir).map_err(|e| CofferError::Io {
            path: Some(self.dir.clone()),
            kind: e.kind(),
            message: format!("directory sync failed: {}", e),
        })
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> CofferResult<()> {
        Ok(())
    }
}

impl StorageBackend for DiskStore {
    /// Index lookup, then a positioned read of the record. An expired hit
    /// upgrades the lock, prunes the index entry, persists, and reports
    /// Expired.
    fn get(&self, key: &[u8]) -> CofferResult<Vec<u8>> {
        self.validate_key(key)?;

        let inner = self.inner.upgradable_read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let offset = *inner.index.get(key).ok_or(CofferError::NotFound)?;
        let entry = self.read_entry(files, offset, inner.next_offset)?;

        if entry.is_expired() {
            let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
            inner.index.remove(key);
            self.persist_index(&inner)?;
            return Err(CofferError::Expired);
        }

        Ok(entry.value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> CofferResult<()> {
        self.set_entry(key, value, None)
    }

    fn set_with_expiry(&self, key: &[u8], value: &[u8], ttl: Duration) -> CofferResult<()> {
        self.set_entry(key, value, Some(ttl))
    }

    /// Remove the index entry and persist. Succeeds when the key is absent.
    fn delete(&self, key: &[u8]) -> CofferResult<()> {
        self.validate_key(key)?;

        let mut inner = self.inner.write();
        if inner.files.is_none() {
            return Err(CofferError::Closed);
        }
        inner.index.remove(key);
        self.persist_index(&inner)
    }

    fn exists(&self, key: &[u8]) -> CofferResult<bool> {
        self.validate_key(key)?;

        let inner = self.inner.read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let offset = match inner.index.get(key) {
            Some(&offset) => offset,
            None => return Ok(false),
        };
        let entry = self.read_entry(files, offset, inner.next_offset)?;
        Ok(!entry.is_expired())
    }

    /// Per-key misses (absent, expired, unreadable) are omitted from the
    /// result, never surfaced.
    fn batch_get(&self, keys: &[Vec<u8>]) -> CofferResult<HashMap<Vec<u8>, Vec<u8>>> {
        for key in keys {
            self.validate_key(key)?;
        }

        let inner = self.inner.read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let mut result = HashMap::new();
        for key in keys {
            if let Some(&offset) = inner.index.get(key.as_slice()) {
                if let Ok(entry) = self.read_entry(files, offset, inner.next_offset) {
                    if !entry.is_expired() {
                        result.insert(key.clone(), entry.value);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Append every record in order, then commit the index once. Index
    /// updates are staged: a failed append surfaces the error and leaves
    /// both the in-memory and on-disk index untouched (the records already
    /// appended become dead bytes for compaction to reclaim).
    fn batch_set(&self, entries: Vec<Entry>) -> CofferResult<()> {
        for entry in &entries {
            self.validate_key(&entry.key)?;
            self.validate_value(&entry.value)?;
        }

        let mut inner = self.inner.write();
        if inner.files.is_none() {
            return Err(CofferError::Closed);
        }

        let mut staged = Vec::with_capacity(entries.len());
        for entry in &entries {
            let offset = self.append_entry(&mut inner, entry)?;
            staged.push((entry.key.clone(), offset));
        }

        for (key, offset) in staged {
            inner.index.insert(key, offset);
        }
        self.persist_index(&inner)
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> CofferResult<()> {
        for key in keys {
            self.validate_key(key)?;
        }

        let mut inner = self.inner.write();
        if inner.files.is_none() {
            return Err(CofferError::Closed);
        }
        for key in keys {
            inner.index.remove(key.as_slice());
        }
        self.persist_index(&inner)
    }

    fn clear(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        {
            let files = inner.files.as_ref().ok_or(CofferError::Closed)?;
            files.data.set_len(0).map_err(|e| CofferError::Io {
                path: Some(self.data_path.clone()),
                kind: e.kind(),
                message: format!("failed to truncate data file: {}", e),
            })?;
            durable_sync(&files.data).map_err(|e| CofferError::Io {
                path: Some(self.data_path.clone()),
                kind: e.kind(),
                message: format!("data file sync failed: {}", e),
            })?;
        }
        inner.index.clear();
        inner.next_offset = 0;
        self.persist_index(&inner)
    }

    /// Count of live, non-expired entries. Scans every indexed record;
    /// unreadable records are not counted.
    fn size(&self) -> CofferResult<u64> {
        let inner = self.inner.read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let mut count = 0u64;
        for &offset in inner.index.values() {
            if let Ok(entry) = self.read_entry(files, offset, inner.next_offset) {
                if !entry.is_expired() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn keys(&self) -> CofferResult<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let mut keys = Vec::new();
        for (key, &offset) in &inner.index {
            if let Ok(entry) = self.read_entry(files, offset, inner.next_offset) {
                if !entry.is_expired() {
                    keys.push(key.clone());
                }
            }
        }
        Ok(keys)
    }

    fn cleanup_expired(&self) -> CofferResult<usize> {
        let mut inner = self.inner.write();

        let mut expired: Vec<Vec<u8>> = Vec::new();
        {
            let files = inner.files.as_ref().ok_or(CofferError::Closed)?;
            for (key, &offset) in &inner.index {
                if let Ok(entry) = self.read_entry(files, offset, inner.next_offset) {
                    if entry.is_expired() {
                        expired.push(key.clone());
                    }
                }
            }
        }

        for key in &expired {
            inner.index.remove(key.as_slice());
        }
        if !expired.is_empty() {
            self.persist_index(&inner)?;
        }
        Ok(expired.len())
    }

    fn disk_usage(&self) -> CofferResult<u64> {
        let inner = self.inner.read();
        let files = inner.files.as_ref().ok_or(CofferError::Closed)?;

        let data_len = files.data.metadata().map_err(|e| CofferError::Io {
            path: Some(self.data_path.clone()),
            kind: e.kind(),
            message: format!("failed to stat data file: {}", e),
        })?;
        let index_len = files.index.metadata().map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("failed to stat index file: {}", e),
        })?;
        Ok(data_len.len() + index_len.len())
    }

    /// Rewrite the data file to just the live, non-expired records.
    ///
    /// Survivors are copied to `data.db.tmp` / `index.db.tmp`, both synced,
    /// then renamed over the live files — data first, index last, so a
    /// crash between the renames is caught by the stale-index check on the
    /// next open. Unreadable records are dropped with a warning.
    ///
    /// The live handles must be closed before the renames (Windows refuses
    /// to rename over an open file); a failure after that point leaves the
    /// store closed, with the data directory still consistent.
    fn compact(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();

        let tmp_data_path = self.dir.join(format!("{}.tmp", DATA_FILE_NAME));
        let tmp_index_path = self.dir.join(format!("{}.tmp", INDEX_FILE_NAME));
        let old_len = inner.next_offset;

        let mut new_index: HashMap<Vec<u8>, u64> = HashMap::with_capacity(inner.index.len());
        let mut new_offset = 0u64;

        {
            let files = inner.files.as_ref().ok_or(CofferError::Closed)?;
            let mut tmp_data = File::create(&tmp_data_path).map_err(|e| CofferError::Io {
                path: Some(tmp_data_path.clone()),
                kind: e.kind(),
                message: format!("failed to create compaction data file: {}", e),
            })?;

            for (key, &offset) in &inner.index {
                let entry = match self.read_entry(files, offset, inner.next_offset) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("compaction: dropping unreadable record at offset {}: {}", offset, e);
                        continue;
                    }
                };
                if entry.is_expired() {
                    continue;
                }

                let frame = codec::encode_frame(&entry, &tmp_data_path)?;
                tmp_data.write_all(&frame).map_err(|e| CofferError::Io {
                    path: Some(tmp_data_path.clone()),
                    kind: e.kind(),
                    message: format!("failed to write compacted record: {}", e),
                })?;
                new_index.insert(key.clone(), new_offset);
                new_offset += frame.len() as u64;
            }

            durable_sync(&tmp_data).map_err(|e| CofferError::Io {
                path: Some(tmp_data_path.clone()),
                kind: e.kind(),
                message: format!("failed to sync compacted data file: {}", e),
            })?;

            let pairs: Vec<(&Vec<u8>, &u64)> = new_index.iter().collect();
            let bytes = serde_json::to_vec(&pairs).map_err(|e| CofferError::Malformed {
                path: tmp_index_path.clone(),
                offset: 0,
                reason: format!("failed to serialize compacted index: {}", e),
            })?;
            let mut tmp_index = File::create(&tmp_index_path).map_err(|e| CofferError::Io {
                path: Some(tmp_index_path.clone()),
                kind: e.kind(),
                message: format!("failed to create compaction index file: {}", e),
            })?;
            tmp_index.write_all(&bytes).map_err(|e| CofferError::Io {
                path: Some(tmp_index_path.clone()),
                kind: e.kind(),
                message: format!("failed to write compacted index: {}", e),
            })?;
            durable_sync(&tmp_index).map_err(|e| CofferError::Io {
                path: Some(tmp_index_path.clone()),
                kind: e.kind(),
                message: format!("failed to sync compacted index: {}", e),
            })?;
        }

        inner.files = None;
        fs::rename(&tmp_data_path, &self.data_path).map_err(|e| CofferError::Io {
            path: Some(self.data_path.clone()),
            kind: e.kind(),
            message: format!("failed to rename compacted data file: {}", e),
        })?;
        fs::rename(&tmp_index_path, &self.index_path).map_err(|e| CofferError::Io {
            path: Some(self.index_path.clone()),
            kind: e.kind(),
            message: format!("failed to rename compacted index file: {}", e),
        })?;
        self.sync_dir()?;

        inner.files = Some(Self::open_files(&self.data_path, &self.index_path)?);
        let live = new_index.len();
        inner.index = new_index;
        inner.next_offset = new_offset;

        info!(
            "compacted {}: {} -> {} bytes, {} live entries",
            self.data_path.display(),
            old_len,
            new_offset,
            live
        );
        Ok(())
    }

    fn close(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        inner.files = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.read().files.is_none()
    }
}
