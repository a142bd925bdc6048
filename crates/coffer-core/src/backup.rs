//! Backup manager — timestamped snapshots of the store's on-disk triad
//!
//! A backup is a `backup_YYYYMMDD_HHMMSS` directory under `backups/`
//! holding copies of the data, index, and WAL files (whichever exist) plus
//! a `metadata.json` manifest. The manifest's SHA-256 checksum covers every
//! non-manifest file, so a backup is self-describing: restore verifies the
//! checksum before touching the live files, and keeps a holding copy of
//! them so a failed restore rolls back.
//!
//! The live store must be closed around `restore_from_backup`; the
//! recovery manager enforces that sequencing.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CofferError, CofferResult};
use crate::store::{DATA_FILE_NAME, INDEX_FILE_NAME, WAL_FILE_NAME};

/// Directory under the data dir holding all snapshots
pub(crate) const BACKUP_DIR_NAME: &str = "backups";
/// Manifest file inside each backup directory
const MANIFEST_FILE_NAME: &str = "metadata.json";
/// Holding area for the live files during restore
const HOLDING_DIR_NAME: &str = "temp_restore";
/// Version tag written into every manifest
const BACKUP_VERSION: &str = "1.0.0";

/// The three files a snapshot copies; any may be absent at the source.
const SNAPSHOT_FILES: [&str; 3] = [DATA_FILE_NAME, INDEX_FILE_NAME, WAL_FILE_NAME];

/// Manifest describing one backup directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub entry_count: u64,
    pub data_size: u64,
    pub index_size: u64,
    pub wal_size: u64,
    /// Lowercase hex SHA-256 over the non-manifest files, in sorted
    /// filename order
    pub checksum: String,
    /// Only "full" is produced
    pub backup_type: String,
    pub description: String,
}

struct BackupState {
    last_backup: Option<BackupMetadata>,
    backup_count: usize,
}

/// Creates, enumerates, verifies, and restores snapshots of a data
/// directory.
pub struct BackupManager {
    data_dir: PathBuf,
    backup_dir: PathBuf,
    state: RwLock<BackupState>,
}

impl BackupManager {
    /// Create a manager for `data_dir`, discovering any existing backups
    /// under `data_dir/backups/`.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> CofferResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let backup_dir = data_dir.join(BACKUP_DIR_NAME);

        fs::create_dir_all(&backup_dir).map_err(|e| CofferError::Io {
            path: Some(backup_dir.clone()),
            kind: e.kind(),
            message: format!("failed to create backup directory: {}", e),
        })?;

        let manager = Self {
            data_dir,
            backup_dir,
            state: RwLock::new(BackupState { last_backup: None, backup_count: 0 }),
        };

        let discovered = manager.scan_backups()?;
        {
            let mut state = manager.state.write();
            state.backup_count = discovered.len();
            state.last_backup = discovered
                .into_iter()
                .map(|(_, metadata)| metadata)
                .max_by_key(|metadata| metadata.timestamp);
        }

        Ok(manager)
    }

    /// Snapshot the current data/index/WAL files into a fresh timestamped
    /// directory and write its manifest. Missing source files are skipped.
    pub fn create_full_backup(&self, description: &str) -> CofferResult<BackupMetadata> {
        let mut state = self.state.write();

        let timestamp = Utc::now();
        let (name, backup_path) = self.fresh_backup_path(&timestamp);

        fs::create_dir_all(&backup_path).map_err(|e| CofferError::Io {
            path: Some(backup_path.clone()),
            kind: e.kind(),
            message: format!("failed to create backup directory: {}", e),
        })?;

        for file in SNAPSHOT_FILES {
            let src = self.data_dir.join(file);
            if !src.exists() {
                continue;
            }
            let dst = backup_path.join(file);
            fs::copy(&src, &dst).map_err(|e| CofferError::Io {
                path: Some(src.clone()),
                kind: e.kind(),
                message: format!("failed to copy {} into backup: {}", file, e),
            })?;
        }

        let metadata = BackupMetadata {
            timestamp,
            version: BACKUP_VERSION.to_string(),
            entry_count: count_index_entries(&backup_path.join(INDEX_FILE_NAME)),
            data_size: file_size(&backup_path.join(DATA_FILE_NAME)),
            index_size: file_size(&backup_path.join(INDEX_FILE_NAME)),
            wal_size: file_size(&backup_path.join(WAL_FILE_NAME)),
            checksum: compute_checksum(&backup_path)?,
            backup_type: "full".to_string(),
            description: description.to_string(),
        };

        let manifest = serde_json::to_vec_pretty(&metadata).map_err(|e| CofferError::Io {
            path: Some(backup_path.join(MANIFEST_FILE_NAME)),
            kind: std::io::ErrorKind::InvalidData,
            message: format!("failed to serialize manifest: {}", e),
        })?;
        fs::write(backup_path.join(MANIFEST_FILE_NAME), manifest).map_err(|e| CofferError::Io {
            path: Some(backup_path.join(MANIFEST_FILE_NAME)),
            kind: e.kind(),
            message: format!("failed to write manifest: {}", e),
        })?;

        state.last_backup = Some(metadata.clone());
        state.backup_count += 1;

        info!(
            "created backup {} ({} entries, {} data bytes)",
            name, metadata.entry_count, metadata.data_size
        );
        Ok(metadata)
    }

    /// Manifests of every recognizable backup. A directory counts iff its
    /// name starts with `backup_`; unreadable or manifest-less entries are
    /// skipped.
    pub fn list_backups(&self) -> CofferResult<Vec<BackupMetadata>> {
        let _state = self.state.read();
        Ok(self
            .scan_backups()?
            .into_iter()
            .map(|(_, metadata)| metadata)
            .collect())
    }

    /// Manifest of one backup by directory name.
    pub fn get_backup_info(&self, name: &str) -> CofferResult<BackupMetadata> {
        let _state = self.state.read();
        let backup_path = self.backup_dir.join(name);
        if !backup_path.exists() {
            return Err(CofferError::InvalidArgument {
                message: format!("backup {} not found", name),
            });
        }
        load_manifest(&backup_path)
    }

    /// Recursively remove one backup.
    pub fn delete_backup(&self, name: &str) -> CofferResult<()> {
        let _state = self.state.write();
        let backup_path = self.backup_dir.join(name);
        if !backup_path.exists() {
            return Err(CofferError::InvalidArgument {
                message: format!("backup {} not found", name),
            });
        }
        fs::remove_dir_all(&backup_path).map_err(|e| CofferError::Io {
            path: Some(backup_path),
            kind: e.kind(),
            message: format!("failed to delete backup: {}", e),
        })
    }

    /// Copy a verified backup's files over the live ones.
    ///
    /// The current files are first copied to a holding directory; if
    /// installing the backup fails they are copied back. The holding
    /// directory is removed on every exit path. Files absent from the
    /// backup are removed from the live directory.
    pub fn restore_from_backup(&self, name: &str) -> CofferResult<()> {
        let _state = self.state.write();

        let backup_path = self.backup_dir.join(name);
        if !backup_path.exists() {
            return Err(CofferError::InvalidArgument {
                message: format!("backup {} not found", name),
            });
        }

        let metadata = load_manifest(&backup_path)?;
        let actual = compute_checksum(&backup_path)?;
        if actual != metadata.checksum {
            return Err(CofferError::Corrupt {
                path: backup_path,
                reason: format!(
                    "checksum mismatch: manifest has {}, computed {}",
                    metadata.checksum, actual
                ),
            });
        }

        let holding = self.data_dir.join(HOLDING_DIR_NAME);
        fs::create_dir_all(&holding).map_err(|e| CofferError::Io {
            path: Some(holding.clone()),
            kind: e.kind(),
            message: format!("failed to create holding directory: {}", e),
        })?;

        let result = (|| -> CofferResult<()> {
            copy_present_files(&self.data_dir, &holding)?;
            if let Err(install_err) = install_backup_files(&backup_path, &self.data_dir) {
                // Put the pre-restore files back before surfacing
                if let Err(rollback_err) = copy_present_files(&holding, &self.data_dir) {
                    warn!("rollback after failed restore also failed: {}", rollback_err);
                }
                return Err(install_err);
            }
            Ok(())
        })();

        if let Err(e) = fs::remove_dir_all(&holding) {
            warn!("failed to remove holding directory {}: {}", holding.display(), e);
        }

        if result.is_ok() {
            info!("restored backup {} into {}", name, self.data_dir.display());
        }
        result
    }

    /// Most recent manifest known to this manager, if any.
    pub fn last_backup(&self) -> Option<BackupMetadata> {
        self.state.read().last_backup.clone()
    }

    /// Backups created by or discovered in this manager's lifetime.
    pub fn backup_count(&self) -> usize {
        self.state.read().backup_count
    }

    /// `(directory name, manifest)` of every recognizable backup.
    pub(crate) fn scan_backups(&self) -> CofferResult<Vec<(String, BackupMetadata)>> {
        let entries = fs::read_dir(&self.backup_dir).map_err(|e| CofferError::Io {
            path: Some(self.backup_dir.clone()),
            kind: e.kind(),
            message: format!("failed to read backup directory: {}", e),
        })?;

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.starts_with("backup_") => name.to_string(),
                _ => continue,
            };
            match load_manifest(&path) {
                Ok(metadata) => backups.push((name, metadata)),
                Err(_) => continue,
            }
        }
        Ok(backups)
    }

    /// Pick `backup_<stamp>` under the backup dir, suffixing a counter on
    /// same-second collisions.
    fn fresh_backup_path(&self, timestamp: &DateTime<Utc>) -> (String, PathBuf) {
        let stamp = timestamp.format("%Y%m%d_%H%M%S");
        let mut name = format!("backup_{}", stamp);
        let mut n = 1;
        while self.backup_dir.join(&name).exists() {
            name = format!("backup_{}_{}", stamp, n);
            n += 1;
        }
        let path = self.backup_dir.join(&name);
        (name, path)
    }
}

/// Parse a backup's manifest. Missing or unparseable manifests are Corrupt:
/// the backup cannot be trusted without one.
fn load_manifest(backup_path: &Path) -> CofferResult<BackupMetadata> {
    let manifest_path = backup_path.join(MANIFEST_FILE_NAME);
    let bytes = match fs::read(&manifest_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CofferError::Corrupt {
                path: backup_path.to_path_buf(),
                reason: "manifest file missing".to_string(),
            });
        }
        Err(e) => {
            return Err(CofferError::Io {
                path: Some(manifest_path),
                kind: e.kind(),
                message: format!("failed to read manifest: {}", e),
            });
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| CofferError::Corrupt {
        path: backup_path.to_path_buf(),
        reason: format!("manifest does not parse: {}", e),
    })
}

/// SHA-256 over every non-manifest file in the backup directory, streamed
/// in sorted filename order. Lowercase hex.
fn compute_checksum(backup_path: &Path) -> CofferResult<String> {
    let entries = fs::read_dir(backup_path).map_err(|e| CofferError::Io {
        path: Some(backup_path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read backup directory: {}", e),
    })?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name != MANIFEST_FILE_NAME)
        .collect();
    names.sort();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    for name in names {
        let path = backup_path.join(&name);
        let mut file = File::open(&path).map_err(|e| CofferError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("failed to open {} for checksum: {}", name, e),
        })?;
        loop {
            let n = file.read(&mut buf).map_err(|e| CofferError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to read {} for checksum: {}", name, e),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Copy whichever of the snapshot files exist in `from` into `to`.
fn copy_present_files(from: &Path, to: &Path) -> CofferResult<()> {
    for file in SNAPSHOT_FILES {
        let src = from.join(file);
        if !src.exists() {
            continue;
        }
        fs::copy(&src, to.join(file)).map_err(|e| CofferError::Io {
            path: Some(src),
            kind: e.kind(),
            message: format!("failed to copy {}: {}", file, e),
        })?;
    }
    Ok(())
}

/// Install a backup's files over the live directory. A file missing from
/// the backup means the live counterpart is removed.
fn install_backup_files(backup_path: &Path, data_dir: &Path) -> CofferResult<()> {
    for file in SNAPSHOT_FILES {
        let src = backup_path.join(file);
        let dst = data_dir.join(file);
        if src.exists() {
            fs::copy(&src, &dst).map_err(|e| CofferError::Io {
                path: Some(src),
                kind: e.kind(),
                message: format!("failed to restore {}: {}", file, e),
            })?;
        } else if let Err(e) = fs::remove_file(&dst) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CofferError::Io {
                    path: Some(dst),
                    kind: e.kind(),
                    message: format!("failed to remove {} during restore: {}", file, e),
                });
            }
        }
    }
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Live-entry count from a copied index file; 0 if absent or unparseable.
fn count_index_entries(index_path: &Path) -> u64 {
    let bytes = match fs::read(index_path) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => return 0,
    };
    serde_json::from_slice::<Vec<(Vec<u8>, u64)>>(&bytes)
        .map(|pairs| pairs.len() as u64)
        .unwrap_or(0)
}
