//! Coffer Core — Durable Embedded Key-Value Store
//!
//! A single-node storage engine built around an append-only data file and
//! an in-memory offset index that is persisted after every mutation.
//!
//! # Architecture
//!
//! - **Write path**: WAL append (fsynced) → data-file append → index update
//!   → index persist
//! - **Read path**: index lookup + positioned read; expiry is evaluated
//!   lazily and expired entries are pruned on contact
//! - **Compaction**: rewrite the data file to just the live records, swap
//!   in via atomic renames
//! - **Backup/recovery**: checksummed snapshots of the data/index/WAL
//!   triad, with an orchestrator that probes, replays, and falls back
//!
//! # No Network, No Runtime
//!
//! This crate is embeddable: plain threads and blocking file I/O, one
//! reader-writer lock per component, no background workers. Hosts wire the
//! pieces together and own the scheduling.

pub mod backend;
pub mod backup;
pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod platform;
pub mod recovery;
pub mod store;
pub mod wal;

// Re-export key types for convenience
pub use backend::StorageBackend;
pub use backup::{BackupManager, BackupMetadata};
pub use codec::{Entry, WalOp, WalRecord};
pub use config::Config;
pub use error::{CofferError, CofferResult};
pub use memory::MemoryStore;
pub use recovery::{RecoveryManager, RecoveryMode, RecoveryState};
pub use store::DiskStore;
pub use wal::Wal;
