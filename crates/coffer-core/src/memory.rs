//! In-memory storage backend
//!
//! Keeps whole entries in a hash map under a reader-writer lock. Same
//! lazy-expiry semantics as the disk store, no durability. Used as the
//! replay target in WAL tests and as a backend for ephemeral workloads.

use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::backend::StorageBackend;
use crate::codec::Entry;
use crate::error::{CofferError, CofferResult};

struct MemoryInner {
    data: HashMap<Vec<u8>, Entry>,
    closed: bool,
}

/// Non-durable backend storing entries in a hash map.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner { data: HashMap::new(), closed: false }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStore {
    fn get(&self, key: &[u8]) -> CofferResult<Vec<u8>> {
        let inner = self.inner.upgradable_read();
        if inner.closed {
            return Err(CofferError::Closed);
        }

        {
            let entry = inner.data.get(key).ok_or(CofferError::NotFound)?;
            if !entry.is_expired() {
                return Ok(entry.value.clone());
            }
        }

        // Expired: promote to writer and prune
        let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
        inner.data.remove(key);
        Err(CofferError::Expired)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        inner.data.insert(key.to_vec(), Entry::new(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn set_with_expiry(&self, key: &[u8], value: &[u8], ttl: Duration) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        inner
            .data
            .insert(key.to_vec(), Entry::with_ttl(key.to_vec(), value.to_vec(), ttl));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        inner.data.remove(key);
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> CofferResult<bool> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        Ok(inner.data.get(key).map_or(false, |e| !e.is_expired()))
    }

    fn batch_get(&self, keys: &[Vec<u8>]) -> CofferResult<HashMap<Vec<u8>, Vec<u8>>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(CofferError::Closed);
        }

        let mut result = HashMap::new();
        for key in keys {
            if let Some(entry) = inner.data.get(key.as_slice()) {
                if !entry.is_expired() {
                    result.insert(key.clone(), entry.value.clone());
                }
            }
        }
        Ok(result)
    }

    fn batch_set(&self, entries: Vec<Entry>) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        for entry in entries {
            inner.data.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    fn batch_delete(&self, keys: &[Vec<u8>]) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        for key in keys {
            inner.data.remove(key.as_slice());
        }
        Ok(())
    }

    fn clear(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        inner.data.clear();
        Ok(())
    }

    fn size(&self) -> CofferResult<u64> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        Ok(inner.data.values().filter(|e| !e.is_expired()).count() as u64)
    }

    fn keys(&self) -> CofferResult<Vec<Vec<u8>>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        Ok(inner
            .data
            .values()
            .filter(|e| !e.is_expired())
            .map(|e| e.key.clone())
            .collect())
    }

    fn cleanup_expired(&self) -> CofferResult<usize> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CofferError::Closed);
        }
        let before = inner.data.len();
        inner.data.retain(|_, entry| !entry.is_expired());
        Ok(before - inner.data.len())
    }

    fn disk_usage(&self) -> CofferResult<u64> {
        Err(CofferError::Unsupported { operation: "disk_usage" })
    }

    fn compact(&self) -> CofferResult<()> {
        Err(CofferError::Unsupported { operation: "compact" })
    }

    fn close(&self) -> CofferResult<()> {
        let mut inner = self.inner.write();
        inner.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}
