//! Write-ahead log
//!
//! Append-only sequence of framed Set/Delete operations, fsynced on every
//! append: after log_set/log_delete return, the operation survives a crash.
//! Replay feeds the ops in append order into any storage backend. The file
//! rotates to a timestamped archive once it reaches the configured size.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::info;
use parking_lot::RwLock;

use crate::backend::StorageBackend;
use crate::codec::{self, WalOp, WalRecord};
use crate::error::{CofferError, CofferResult};

struct WalInner {
    /// `None` after close()
    file: Option<File>,
    /// Running size in bytes, tracked to avoid stat calls
    size: u64,
}

/// Append-only operation log with size-triggered rotation.
pub struct Wal {
    path: PathBuf,
    max_size: u64,
    inner: RwLock<WalInner>,
}

impl Wal {
    /// Open or create the WAL at `path`. `max_size` is the size at which
    /// `should_rotate()` starts reporting true.
    pub fn open<P: AsRef<Path>>(path: P, max_size: u64) -> CofferResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CofferError::Io {
                path: Some(parent.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to create WAL directory: {}", e),
            })?;
        }

        let file = Self::open_file(&path)?;
        let size = file
            .metadata()
            .map_err(|e| CofferError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to stat WAL file: {}", e),
            })?
            .len();

        Ok(Self {
            path,
            max_size,
            inner: RwLock::new(WalInner { file: Some(file), size }),
        })
    }

    fn open_file(path: &Path) -> CofferResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CofferError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("failed to open WAL file: {}", e),
            })
    }

    /// Append one framed op and sync it before returning.
    fn append(&self, record: &WalRecord) -> CofferResult<()> {
        let frame = codec::encode_frame(record, &self.path)?;

        let mut inner = self.inner.write();
        let file = inner.file.as_ref().ok_or(CofferError::Closed)?;

        let mut handle = file;
        handle.write_all(&frame).map_err(|e| CofferError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL append failed: {}", e),
        })?;
        crate::platform::durable_sync(file).map_err(|e| CofferError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("WAL sync failed: {}", e),
        })?;

        inner.size += frame.len() as u64;
        Ok(())
    }

    /// Log a Set operation, durable before return.
    pub fn log_set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> CofferResult<()> {
        self.append(&WalRecord {
            op: WalOp::Set,
            key: key.to_vec(),
            value: Some(value.to_vec()),
            timestamp: Utc::now(),
            ttl,
        })
    }

    /// Log a Delete operation, durable before return.
    pub fn log_delete(&self, key: &[u8]) -> CofferResult<()> {
        self.append(&WalRecord {
            op: WalOp::Delete,
            key: key.to_vec(),
            value: None,
            timestamp: Utc::now(),
            ttl: None,
        })
    }

    /// Read every op from the head of the current WAL file, in append order.
    pub fn read_entries(&self) -> CofferResult<Vec<WalRecord>> {
        let inner = self.inner.read();
        if inner.file.is_none() {
            return Err(CofferError::Closed);
        }

        let bytes = fs::read(&self.path).map_err(|e| CofferError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to read WAL file: {}", e),
        })?;

        codec::decode_frames(&bytes, &self.path)
    }

    /// Replay every op into `backend`: Set becomes `set`/`set_with_expiry`,
    /// Delete becomes `delete`. The first failed op aborts replay and
    /// surfaces its error. Returns the number of ops applied.
    ///
    /// Replay is idempotent against the same backend: `set` is
    /// last-writer-wins and `delete` succeeds on absent keys.
    pub fn replay_entries(&self, backend: &dyn StorageBackend) -> CofferResult<usize> {
        let records = self.read_entries()?;
        let count = records.len();

        for record in records {
            match record.op {
                WalOp::Set => {
                    let value = record.value.unwrap_or_default();
                    match record.ttl {
                        Some(ttl) => backend.set_with_expiry(&record.key, &value, ttl)?,
                        None => backend.set(&record.key, &value)?,
                    }
                }
                WalOp::Delete => backend.delete(&record.key)?,
            }
        }

        if count > 0 {
            info!("replayed {} WAL operations from {}", count, self.path.display());
        }
        Ok(count)
    }

    /// True when the current file has reached the configured maximum.
    pub fn should_rotate(&self) -> bool {
        self.inner.read().size >= self.max_size
    }

    /// Archive the current file as `<path>.YYYYMMDD_HHMMSS` and start a
    /// fresh empty one. A counter suffix resolves same-second collisions.
    pub fn rotate(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.file.is_none() {
            return Err(CofferError::Closed);
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut archive = PathBuf::from(format!("{}.{}", self.path.display(), stamp));
        let mut n = 1;
        while archive.exists() {
            archive = PathBuf::from(format!("{}.{}_{}", self.path.display(), stamp, n));
            n += 1;
        }

        // Drop the live handle before the rename (Windows requirement)
        inner.file = None;
        fs::rename(&self.path, &archive).map_err(|e| CofferError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to archive WAL file: {}", e),
        })?;

        inner.file = Some(Self::open_file(&self.path)?);
        inner.size = 0;
        info!("rotated WAL to {}", archive.display());
        Ok(())
    }

    /// Unlink the current file and start over empty.
    pub fn clear(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.file.is_none() {
            return Err(CofferError::Closed);
        }

        inner.file = None;
        fs::remove_file(&self.path).map_err(|e| CofferError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to remove WAL file: {}", e),
        })?;

        inner.file = Some(Self::open_file(&self.path)?);
        inner.size = 0;
        Ok(())
    }

    /// Running size of the current file in bytes.
    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    /// Size at which rotation is due.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Path of the live WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        inner.file = None;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().file.is_none()
    }
}
