//! Recovery manager — startup orchestration for a data directory
//!
//! Auto-recovery probes the persisted index first. A healthy index means
//! the store is trusted as-is and any WAL on top is folded forward by
//! replay. A missing or unparseable index falls back to WAL replay, then
//! to restoring the most recent backup. Sub-paths swallow their own errors
//! and report through booleans in the persisted recovery state; callers
//! inspect that state rather than catching errors.
//!
//! The manager never holds a store open: WAL replay opens a DiskStore for
//! the duration of the replay and closes it again, so backup restore never
//! runs underneath live file handles.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::StorageBackend;
use crate::backup::{BackupManager, BackupMetadata};
use crate::codec;
use crate::config::Config;
use crate::error::{CofferError, CofferResult};
use crate::store::{DiskStore, DATA_FILE_NAME, INDEX_FILE_NAME, WAL_FILE_NAME};
use crate::wal::Wal;

const STATE_FILE_NAME: &str = "recovery_state.json";

/// How recovery decisions are made for this data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    Auto,
    Manual,
    Backup,
}

impl RecoveryMode {
    fn parse(mode: &str) -> Option<Self> {
        match mode {
            "auto" => Some(RecoveryMode::Auto),
            "manual" => Some(RecoveryMode::Manual),
            "backup" => Some(RecoveryMode::Backup),
            _ => None,
        }
    }
}

/// Persisted outcome of the last recovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryState {
    pub last_recovery: Option<DateTime<Utc>>,
    pub recovery_count: u32,
    /// Name of the last backup used for recovery; empty if never
    pub last_backup: String,
    pub recovery_mode: RecoveryMode,
    /// Primary integrity probe passed (or the directory is a new store)
    pub data_integrity: bool,
    /// WAL replay applied at least one operation
    pub wal_recovery: bool,
    /// A backup was restored
    pub backup_recovery: bool,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            last_recovery: None,
            recovery_count: 0,
            last_backup: String::new(),
            recovery_mode: RecoveryMode::Auto,
            data_integrity: false,
            wal_recovery: false,
            backup_recovery: false,
        }
    }
}

/// Orchestrates integrity probing, WAL replay, and backup fallback.
pub struct RecoveryManager {
    data_dir: PathBuf,
    state_path: PathBuf,
    config: Config,
    backup: BackupManager,
    state: RwLock<RecoveryState>,
}

impl RecoveryManager {
    /// Create a manager for `data_dir`, loading any persisted recovery
    /// state. A missing or unreadable state file starts fresh.
    pub fn new<P: AsRef<Path>>(data_dir: P, config: Config) -> CofferResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).map_err(|e| CofferError::Io {
            path: Some(data_dir.clone()),
            kind: e.kind(),
            message: format!("failed to create data directory: {}", e),
        })?;

        let state_path = data_dir.join(STATE_FILE_NAME);
        let state = fs::read(&state_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();

        let backup = BackupManager::new(&data_dir)?;

        Ok(Self { data_dir, state_path, config, backup, state: RwLock::new(state) })
    }

    /// Auto-recovery: probe the index, fold the WAL forward, fall back to
    /// the latest backup, record what happened.
    ///
    /// A directory where every path fails is treated as a legitimate new
    /// store rather than an error.
    pub fn perform_recovery(&self) -> CofferResult<()> {
        let mut state = self.state.write();
        state.recovery_count += 1;
        state.last_recovery = Some(Utc::now());
        state.data_integrity = false;
        state.wal_recovery = false;
        state.backup_recovery = false;

        if self.probe_primary_integrity() {
            state.data_integrity = true;
            // Fold any unapplied WAL entries forward; replay is idempotent
            state.wal_recovery = self.try_wal_recovery();
        } else {
            self.quarantine_corrupt_index();
            state.wal_recovery = self.try_wal_recovery();
            if !state.wal_recovery {
                if let Some(name) = self.try_backup_recovery() {
                    state.backup_recovery = true;
                    state.last_backup = name;
                } else {
                    warn!(
                        "no recovery path succeeded in {}; treating as new store",
                        self.data_dir.display()
                    );
                    state.data_integrity = true;
                }
            }
        }

        self.persist_state(&state)
    }

    /// Unconditional restore from a named backup, bypassing the probes.
    pub fn force_recovery_from_backup(&self, name: &str) -> CofferResult<()> {
        let mut state = self.state.write();
        state.recovery_mode = RecoveryMode::Backup;
        state.last_backup = name.to_string();
        state.recovery_count += 1;
        state.last_recovery = Some(Utc::now());

        self.backup.restore_from_backup(name)?;

        state.backup_recovery = true;
        state.data_integrity = true;
        self.persist_state(&state)
    }

    /// Create a precautionary backup before a risky operation.
    pub fn create_recovery_point(&self, description: &str) -> CofferResult<BackupMetadata> {
        let _state = self.state.read();
        self.backup
            .create_full_backup(&format!("Recovery point: {}", description))
    }

    /// Report every integrity issue found: missing data/index files, an
    /// unparseable index, or a WAL whose frames do not walk cleanly.
    pub fn validate_data_integrity(&self) -> CofferResult<(bool, Vec<String>)> {
        let _state = self.state.read();
        let mut issues = Vec::new();

        let data_path = self.data_dir.join(DATA_FILE_NAME);
        if !data_path.exists() {
            issues.push(format!("missing file: {}", DATA_FILE_NAME));
        }

        let index_path = self.data_dir.join(INDEX_FILE_NAME);
        if !index_path.exists() {
            issues.push(format!("missing file: {}", INDEX_FILE_NAME));
        } else if let Err(e) = parse_index_file(&index_path) {
            issues.push(format!("index consistency issue: {}", e));
        }

        let wal_path = self.data_dir.join(WAL_FILE_NAME);
        if wal_path.exists() {
            match fs::read(&wal_path) {
                Ok(bytes) => {
                    if let Err(e) = codec::walk_frames(&bytes, &wal_path) {
                        issues.push(format!("WAL consistency issue: {}", e));
                    }
                }
                Err(e) => issues.push(format!("cannot read {}: {}", WAL_FILE_NAME, e)),
            }
        }

        Ok((issues.is_empty(), issues))
    }

    /// Snapshot of the current recovery state.
    pub fn get_recovery_state(&self) -> RecoveryState {
        self.state.read().clone()
    }

    /// Set the recovery mode; must be "auto", "manual", or "backup".
    pub fn set_recovery_mode(&self, mode: &str) -> CofferResult<()> {
        let parsed = RecoveryMode::parse(mode).ok_or_else(|| CofferError::InvalidArgument {
            message: format!("invalid recovery mode: {}", mode),
        })?;

        let mut state = self.state.write();
        state.recovery_mode = parsed;
        self.persist_state(&state)
    }

    /// The index file exists and parses.
    fn probe_primary_integrity(&self) -> bool {
        let index_path = self.data_dir.join(INDEX_FILE_NAME);
        index_path.exists() && parse_index_file(&index_path).is_ok()
    }

    /// Move an unparseable index file aside so a rebuilt store starts from
    /// an empty index instead of failing to open.
    fn quarantine_corrupt_index(&self) {
        let index_path = self.data_dir.join(INDEX_FILE_NAME);
        if !index_path.exists() {
            return;
        }
        let quarantine = self.data_dir.join(format!("{}.corrupt", INDEX_FILE_NAME));
        let _ = fs::remove_file(&quarantine);
        match fs::rename(&index_path, &quarantine) {
            Ok(()) => warn!("quarantined corrupt index as {}", quarantine.display()),
            Err(e) => warn!("failed to quarantine corrupt index: {}", e),
        }
    }

    /// Replay the WAL into the store. Succeeds iff the WAL exists and at
    /// least one operation replays cleanly. Errors are swallowed into the
    /// boolean; the store is closed again before returning.
    fn try_wal_recovery(&self) -> bool {
        let wal_path = self.data_dir.join(WAL_FILE_NAME);
        if !wal_path.exists() {
            return false;
        }

        let wal = match Wal::open(&wal_path, self.config.wal_max_size) {
            Ok(wal) => wal,
            Err(e) => {
                warn!("cannot open WAL for recovery: {}", e);
                return false;
            }
        };

        let store = match DiskStore::open(&self.data_dir, self.config.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!("cannot open store for WAL replay: {}", e);
                let _ = wal.close();
                return false;
            }
        };

        let outcome = wal.replay_entries(&store);
        let _ = store.close();
        let _ = wal.close();

        match outcome {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => {
                warn!("WAL replay failed: {}", e);
                false
            }
        }
    }

    /// Restore the most recent backup. Errors are swallowed; returns the
    /// backup name on success.
    fn try_backup_recovery(&self) -> Option<String> {
        let backups = match self.backup.scan_backups() {
            Ok(backups) if !backups.is_empty() => backups,
            _ => return None,
        };

        let (name, _) = backups
            .into_iter()
            .max_by_key(|(_, metadata)| metadata.timestamp)?;

        match self.backup.restore_from_backup(&name) {
            Ok(()) => Some(name),
            Err(e) => {
                warn!("restore from {} failed: {}", name, e);
                None
            }
        }
    }

    fn persist_state(&self, state: &RecoveryState) -> CofferResult<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| CofferError::Io {
            path: Some(self.state_path.clone()),
            kind: std::io::ErrorKind::InvalidData,
            message: format!("failed to serialize recovery state: {}", e),
        })?;
        fs::write(&self.state_path, bytes).map_err(|e| CofferError::Io {
            path: Some(self.state_path.clone()),
            kind: e.kind(),
            message: format!("failed to write recovery state: {}", e),
        })
    }
}

/// Shared index-parse used by the probe and the validator.
fn parse_index_file(index_path: &Path) -> CofferResult<()> {
    let bytes = fs::read(index_path).map_err(|e| CofferError::Io {
        path: Some(index_path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read index file: {}", e),
    })?;

    if bytes.is_empty() {
        return Ok(());
    }
    serde_json::from_slice::<Vec<(Vec<u8>, u64)>>(&bytes)
        .map(|_| ())
        .map_err(|e| CofferError::Malformed {
            path: index_path.to_path_buf(),
            offset: 0,
            reason: format!("index file does not parse: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_store(dir: &Path) {
        let store = DiskStore::open(dir, Config::default()).unwrap();
        store.set(b"seed", b"value").unwrap();
        store.close().unwrap();
    }

    #[test]
    fn test_fresh_directory_is_a_new_store() {
        let dir = TempDir::new().unwrap();
        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(state.data_integrity);
        assert!(!state.wal_recovery);
        assert!(!state.backup_recovery);
        assert_eq!(state.recovery_count, 1);
        assert!(state.last_recovery.is_some());
    }

    #[test]
    fn test_healthy_store_trusted() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(state.data_integrity);
        assert!(!state.wal_recovery, "no WAL present, nothing to fold");
    }

    #[test]
    fn test_wal_folded_forward_over_healthy_store() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let wal = Wal::open(dir.path().join(WAL_FILE_NAME), 1 << 20).unwrap();
        wal.log_set(b"from-wal", b"replayed", None).unwrap();
        wal.close().unwrap();

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(state.data_integrity);
        assert!(state.wal_recovery);

        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"from-wal").unwrap(), b"replayed");
        assert_eq!(store.get(b"seed").unwrap(), b"value");
    }

    #[test]
    fn test_corrupt_index_rebuilt_from_wal() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let wal = Wal::open(dir.path().join(WAL_FILE_NAME), 1 << 20).unwrap();
        wal.log_set(b"survivor", b"from wal", None).unwrap();
        wal.close().unwrap();

        fs::write(dir.path().join(INDEX_FILE_NAME), b"definitely not json").unwrap();

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(!state.data_integrity, "primary probe failed");
        assert!(state.wal_recovery);
        assert!(!state.backup_recovery);

        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"survivor").unwrap(), b"from wal");
    }

    #[test]
    fn test_backup_fallback_when_wal_absent() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let backups = BackupManager::new(dir.path()).unwrap();
        backups.create_full_backup("pre-corruption").unwrap();

        fs::write(dir.path().join(INDEX_FILE_NAME), b"garbage").unwrap();

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(!state.data_integrity);
        assert!(!state.wal_recovery);
        assert!(state.backup_recovery);
        assert!(state.last_backup.starts_with("backup_"));

        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert_eq!(store.get(b"seed").unwrap(), b"value");
    }

    #[test]
    fn test_all_paths_failed_marks_new_store() {
        let dir = TempDir::new().unwrap();
        // Unparseable index, no WAL, no backups
        fs::write(dir.path().join(INDEX_FILE_NAME), b"junk").unwrap();

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.perform_recovery().unwrap();

        let state = manager.get_recovery_state();
        assert!(state.data_integrity);
        assert!(!state.wal_recovery);
        assert!(!state.backup_recovery);
    }

    #[test]
    fn test_force_recovery_from_backup() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let backups = BackupManager::new(dir.path()).unwrap();
        backups.create_full_backup("snapshot").unwrap();
        let (name, _) = backups.scan_backups().unwrap().remove(0);

        {
            let store = DiskStore::open(dir.path(), Config::default()).unwrap();
            store.set(b"late", b"change").unwrap();
            store.close().unwrap();
        }

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        manager.force_recovery_from_backup(&name).unwrap();

        let state = manager.get_recovery_state();
        assert_eq!(state.recovery_mode, RecoveryMode::Backup);
        assert_eq!(state.last_backup, name);
        assert!(state.backup_recovery);

        let store = DiskStore::open(dir.path(), Config::default()).unwrap();
        assert!(matches!(store.get(b"late"), Err(CofferError::NotFound)));
    }

    #[test]
    fn test_create_recovery_point_prefixes_description() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        let metadata = manager.create_recovery_point("before schema change").unwrap();
        assert_eq!(metadata.description, "Recovery point: before schema change");
    }

    #[test]
    fn test_set_recovery_mode() {
        let dir = TempDir::new().unwrap();
        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();

        manager.set_recovery_mode("manual").unwrap();
        assert_eq!(manager.get_recovery_state().recovery_mode, RecoveryMode::Manual);

        assert!(matches!(
            manager.set_recovery_mode("yolo"),
            Err(CofferError::InvalidArgument { .. })
        ));

        // Mode survives a new manager instance
        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
        assert_eq!(manager.get_recovery_state().recovery_mode, RecoveryMode::Manual);
    }

    #[test]
    fn test_state_counter_accumulates() {
        let dir = TempDir::new().unwrap();
        {
            let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
            manager.perform_recovery().unwrap();
        }
        {
            let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
            manager.perform_recovery().unwrap();
            assert_eq!(manager.get_recovery_state().recovery_count, 2);
        }
    }

    #[test]
    fn test_validate_reports_missing_files() {
        let dir = TempDir::new().unwrap();
        let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();

        let (valid, issues) = manager.validate_data_integrity().unwrap();
        assert!(!valid);
        assert_eq!(issues.len(), 2, "data and index files both missing");
    }

    #[test]
    fn test_validate_reports_corrupt_wal() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        // Frame header claiming more bytes than the file holds
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        fs::write(dir.path().join(WAL_FILE_NAME), bytes).unwrap();

        let (valid, issues) = manager_validate(dir.path());
        assert!(!valid);
        assert!(issues.iter().any(|i| i.contains("WAL")));
    }

    fn manager_validate(dir: &Path) -> (bool, Vec<String>) {
        let manager = RecoveryManager::new(dir, Config::default()).unwrap();
        manager.validate_data_integrity().unwrap()
    }

    #[test]
    fn test_validate_healthy_store() {
        let dir = TempDir::new().unwrap();
        seeded_store(dir.path());

        let (valid, issues) = manager_validate(dir.path());
        assert!(valid, "unexpected issues: {:?}", issues);
    }
}
