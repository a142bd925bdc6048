//! Integration tests: the full engine lifecycle across components.
//!
//! These exercise the DiskStore / Wal / BackupManager / RecoveryManager
//! pipeline the way a host wires it: durable writes, reopen, compaction,
//! rotation, snapshot and restore.

use std::time::Duration;

use tempfile::TempDir;

use coffer_core::{
    BackupManager, CofferError, Config, DiskStore, Entry, MemoryStore, RecoveryManager,
    StorageBackend, Wal,
};

fn open_store(dir: &TempDir) -> DiskStore {
    DiskStore::open(dir.path(), Config::default()).unwrap()
}

// ---------------------------------------------------------------------------
// Durability and reopen
// ---------------------------------------------------------------------------

#[test]
fn test_mutations_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.set(b"user:1", b"Alice").unwrap();
        store.set(b"user:2", b"Bob").unwrap();
        store.delete(b"user:1").unwrap();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    assert!(matches!(store.get(b"user:1"), Err(CofferError::NotFound)));
    assert_eq!(store.get(b"user:2").unwrap(), b"Bob");
    assert_eq!(store.size().unwrap(), 1);
}

#[test]
fn test_oversized_key_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir); // default max_key_size = 1024

    let key = vec![0x6b; 2048];
    assert!(matches!(
        store.set(&key, b"value"),
        Err(CofferError::InvalidKey { .. })
    ));
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_reclaims_deleted_space() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let entries: Vec<Entry> = (0..1000)
        .map(|i| Entry::new(format!("key{:04}", i).into_bytes(), format!("value{:04}", i).into_bytes()))
        .collect();
    store.batch_set(entries).unwrap();

    let doomed: Vec<Vec<u8>> = (0..1000)
        .step_by(2)
        .map(|i| format!("key{:04}", i).into_bytes())
        .collect();
    store.batch_delete(&doomed).unwrap();

    let before = store.disk_usage().unwrap();
    store.compact().unwrap();
    let after = store.disk_usage().unwrap();

    assert_eq!(store.size().unwrap(), 500);
    assert!(after < before, "disk usage {} should shrink below {}", after, before);
    assert_eq!(store.get(b"key0001").unwrap(), b"value0001");
    assert!(matches!(store.get(b"key0000"), Err(CofferError::NotFound)));
}

#[test]
fn test_compaction_preserves_live_set() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.set(b"a", b"1").unwrap();
    store.set(b"b", b"2").unwrap();
    store.set(b"a", b"1-final").unwrap();
    store.delete(b"b").unwrap();
    store.set(b"c", b"3").unwrap();

    let mut before = store.keys().unwrap();
    before.sort();

    store.compact().unwrap();

    let mut after = store.keys().unwrap();
    after.sort();
    assert_eq!(before, after);
    assert_eq!(store.get(b"a").unwrap(), b"1-final");
    assert_eq!(store.get(b"c").unwrap(), b"3");
}

// ---------------------------------------------------------------------------
// WAL
// ---------------------------------------------------------------------------

#[test]
fn test_wal_rotation_archives_once() {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(dir.path().join("wal.log"), 100).unwrap();

    while !wal.should_rotate() {
        wal.log_set(b"record", b"payload bytes", None).unwrap();
    }
    wal.rotate().unwrap();

    assert_eq!(wal.size(), 0);
    assert!(wal.read_entries().unwrap().is_empty());

    let archived = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map_or(false, |n| n.starts_with("wal.log.") && n != "wal.log")
        })
        .count();
    assert_eq!(archived, 1);
}

#[test]
fn test_wal_replay_matches_direct_application() {
    let dir = TempDir::new().unwrap();
    let wal = Wal::open(dir.path().join("wal.log"), 1 << 20).unwrap();
    let direct = MemoryStore::new();

    let ops: Vec<(&[u8], Option<&[u8]>)> = vec![
        (b"a", Some(b"1")),
        (b"b", Some(b"2")),
        (b"a", Some(b"1-new")),
        (b"b", None),
        (b"c", Some(b"3")),
    ];
    for (key, value) in &ops {
        match value {
            Some(value) => {
                wal.log_set(key, value, None).unwrap();
                direct.set(key, value).unwrap();
            }
            None => {
                wal.log_delete(key).unwrap();
                direct.delete(key).unwrap();
            }
        }
    }

    let replayed = MemoryStore::new();
    wal.replay_entries(&replayed).unwrap();

    let mut direct_keys = direct.keys().unwrap();
    let mut replayed_keys = replayed.keys().unwrap();
    direct_keys.sort();
    replayed_keys.sort();
    assert_eq!(direct_keys, replayed_keys);

    for key in &direct_keys {
        assert_eq!(direct.get(key).unwrap(), replayed.get(key).unwrap());
    }
}

#[test]
fn test_wal_replay_restores_pending_writes() {
    let dir = TempDir::new().unwrap();

    // Host crashed after WAL appends but before any data-file writes:
    // only the WAL holds the mutations.
    {
        let wal = Wal::open(dir.path().join("wal.log"), 1 << 20).unwrap();
        wal.log_set(b"pending:1", b"one", None).unwrap();
        wal.log_set(b"pending:2", b"two", Some(Duration::from_secs(3600))).unwrap();
        wal.log_delete(b"pending:1").unwrap();
        wal.close().unwrap();
    }

    let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
    manager.perform_recovery().unwrap();
    assert!(manager.get_recovery_state().wal_recovery);

    let store = open_store(&dir);
    assert!(matches!(store.get(b"pending:1"), Err(CofferError::NotFound)));
    assert_eq!(store.get(b"pending:2").unwrap(), b"two");
}

// ---------------------------------------------------------------------------
// Backup and restore
// ---------------------------------------------------------------------------

#[test]
fn test_backup_restore_rolls_back_mutations() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.set(b"original", b"snapshot me").unwrap();
        store.close().unwrap();
    }

    let backups = BackupManager::new(dir.path()).unwrap();
    backups.create_full_backup("integration snapshot").unwrap();

    {
        let store = open_store(&dir);
        store.set(b"modified", b"post-snapshot").unwrap();
        store.delete(b"original").unwrap();
        store.close().unwrap();
    }

    let name = {
        let listed = backups.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        format!("backup_{}", listed[0].timestamp.format("%Y%m%d_%H%M%S"))
    };
    backups.restore_from_backup(&name).unwrap();

    let store = open_store(&dir);
    assert_eq!(store.get(b"original").unwrap(), b"snapshot me");
    assert!(matches!(store.get(b"modified"), Err(CofferError::NotFound)));
}

#[test]
fn test_tampered_backup_refused_end_to_end() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.set(b"k", b"v").unwrap();
        store.close().unwrap();
    }

    let manager = RecoveryManager::new(dir.path(), Config::default()).unwrap();
    let metadata = manager.create_recovery_point("tamper check").unwrap();
    let name = format!("backup_{}", metadata.timestamp.format("%Y%m%d_%H%M%S"));

    // Flip a byte inside the copied data file
    let victim = dir.path().join("backups").join(&name).join("data.db");
    let mut bytes = std::fs::read(&victim).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&victim, bytes).unwrap();

    assert!(matches!(
        manager.force_recovery_from_backup(&name),
        Err(CofferError::Corrupt { .. })
    ));
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[test]
fn test_expiry_cleanup_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .set_with_expiry(b"k", b"v", Duration::from_millis(100))
        .unwrap();
    assert_eq!(store.get(b"k").unwrap(), b"v");

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(store.cleanup_expired().unwrap(), 1);
    assert_eq!(store.size().unwrap(), 0);
}

#[test]
fn test_lazy_expiry_visible_to_reads() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .set_with_expiry(b"ephemeral", b"here now", Duration::from_millis(80))
        .unwrap();
    assert!(store.exists(b"ephemeral").unwrap());

    std::thread::sleep(Duration::from_millis(160));
    assert!(matches!(store.get(b"ephemeral"), Err(CofferError::Expired)));
    assert!(!store.exists(b"ephemeral").unwrap());
}

#[test]
fn test_expiry_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store
            .set_with_expiry(b"short", b"lived", Duration::from_millis(50))
            .unwrap();
        store.set(b"long", b"lived").unwrap();
        store.close().unwrap();
    }

    std::thread::sleep(Duration::from_millis(120));

    let store = open_store(&dir);
    assert!(matches!(store.get(b"short"), Err(CofferError::Expired)));
    assert_eq!(store.get(b"long").unwrap(), b"lived");
}

// ---------------------------------------------------------------------------
// Host-style wiring: WAL in front of the store
// ---------------------------------------------------------------------------

#[test]
fn test_write_path_ordering() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let wal = Wal::open(dir.path().join("wal.log"), 1 << 20).unwrap();

    // WAL-append happens-before data-file append for every mutation
    wal.log_set(b"k1", b"v1", None).unwrap();
    store.set(b"k1", b"v1").unwrap();
    wal.log_delete(b"k1").unwrap();
    store.delete(b"k1").unwrap();
    wal.log_set(b"k2", b"v2", None).unwrap();
    store.set(b"k2", b"v2").unwrap();

    assert_eq!(wal.read_entries().unwrap().len(), 3);
    assert_eq!(store.size().unwrap(), 1);

    // Replaying the same WAL over the store converges to the same state
    wal.replay_entries(&store).unwrap();
    assert_eq!(store.size().unwrap(), 1);
    assert_eq!(store.get(b"k2").unwrap(), b"v2");
    assert!(matches!(store.get(b"k1"), Err(CofferError::NotFound)));
}
