//! Storage backend abstraction
//!
//! The WAL replays into anything implementing this trait, and hosts choose
//! between the durable disk store and the in-memory store behind it.
//! Two implementations exist: `DiskStore` (the real engine) and
//! `MemoryStore` (tests and ephemeral workloads).

use std::time::Duration;

use hashbrown::HashMap;

use crate::codec::Entry;
use crate::error::CofferResult;

/// Operations every storage backend provides.
///
/// Semantics shared by all implementations:
/// - `get` distinguishes NotFound from Expired; an expired hit is pruned
///   before the error is returned.
/// - `exists` and `batch_get` treat NotFound/Expired as plain misses.
/// - `delete` is idempotent: deleting an absent key succeeds.
/// - `batch_set` applies entries in order; `size`/`keys` count only live,
///   non-expired entries.
/// - After `close()` every operation fails with `Closed`.
///
/// Maintenance operations (`compact`, `disk_usage`) may be unsupported by
/// a backend, in which case they fail with `Unsupported`.
pub trait StorageBackend {
    fn get(&self, key: &[u8]) -> CofferResult<Vec<u8>>;
    fn set(&self, key: &[u8], value: &[u8]) -> CofferResult<()>;
    fn set_with_expiry(&self, key: &[u8], value: &[u8], ttl: Duration) -> CofferResult<()>;
    fn delete(&self, key: &[u8]) -> CofferResult<()>;
    fn exists(&self, key: &[u8]) -> CofferResult<bool>;

    fn batch_get(&self, keys: &[Vec<u8>]) -> CofferResult<HashMap<Vec<u8>, Vec<u8>>>;
    fn batch_set(&self, entries: Vec<Entry>) -> CofferResult<()>;
    fn batch_delete(&self, keys: &[Vec<u8>]) -> CofferResult<()>;

    fn clear(&self) -> CofferResult<()>;
    fn size(&self) -> CofferResult<u64>;
    fn keys(&self) -> CofferResult<Vec<Vec<u8>>>;
    fn cleanup_expired(&self) -> CofferResult<usize>;

    fn disk_usage(&self) -> CofferResult<u64>;
    fn compact(&self) -> CofferResult<()>;

    fn close(&self) -> CofferResult<()>;
    fn is_closed(&self) -> bool;
}
