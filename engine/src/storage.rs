//! Durable backing for change log snapshots.
//!
//! A [`StoreProvider`] hands out at most one [`ChangeLogStorage`] lease per
//! datastore. The lease is released when the storage is dropped.
//!
//! File layout of [`FileStoreProvider`]:
//!
//! ```text
//! <store_dir>/<datastore>/
//! ├─ LOCK              # Advisory lock held for the session
//! ├─ SHARED            # Present while a shared-memory lease is held
//! └─ changelog.json    # Sealed snapshot
//! ```

use crate::{
    config::CapacityConfig, error::Result, snapshot::ChangeLogSnapshot,
    snapshot::SnapshotMetadata, DatastoreId, Error,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const SHARED_FILE: &str = "SHARED";
const SNAPSHOT_FILE: &str = "changelog.json";
const SNAPSHOT_TEMP: &str = "changelog.json.tmp";

/// Persistent bytes of one datastore's change log.
pub trait ChangeLogStorage: Send {
    /// Read the last saved snapshot, `None` if nothing was ever saved.
    fn load(&mut self) -> Result<Option<Vec<u8>>>;

    /// Replace the saved snapshot. Either the new bytes or the old ones
    /// remain visible after a failure, never a mix.
    fn save(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Source of exclusive storage leases.
pub trait StoreProvider: Send + Sync {
    /// Take the lease for a datastore, failing with `StoreLocked` while
    /// another session holds it.
    fn open(
        &self,
        datastore_id: &str,
        capacity: &CapacityConfig,
    ) -> Result<Box<dyn ChangeLogStorage>>;

    /// Read-only summary of a datastore's saved state.
    ///
    /// Allowed while the store is unleased, or leased with `shared_memory`.
    fn inspect(&self, datastore_id: &str) -> Result<Option<SnapshotMetadata>>;
}

fn metadata_of(bytes: Option<Vec<u8>>) -> Result<Option<SnapshotMetadata>> {
    match bytes {
        Some(bytes) => {
            let snapshot = ChangeLogSnapshot::from_bytes(&bytes)?;
            Ok(Some(SnapshotMetadata::from(&snapshot)))
        }
        None => Ok(None),
    }
}

#[derive(Debug, Default)]
struct MemorySlot {
    bytes: Option<Vec<u8>>,
    leased: bool,
    shared: bool,
    fail_saves: bool,
}

type Slots = Arc<Mutex<HashMap<DatastoreId, MemorySlot>>>;

/// Process-local provider. Clones share the same stores.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreProvider {
    slots: Slots,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw saved bytes of a datastore.
    pub fn raw_bytes(&self, datastore_id: &str) -> Option<Vec<u8>> {
        self.slots
            .lock()
            .get(datastore_id)
            .and_then(|slot| slot.bytes.clone())
    }

    /// Overwrite the saved bytes of a datastore.
    pub fn put_raw_bytes(&self, datastore_id: &str, bytes: Vec<u8>) {
        self.slots
            .lock()
            .entry(datastore_id.to_string())
            .or_default()
            .bytes = Some(bytes);
    }

    /// Make every following save of a datastore fail with an I/O error.
    pub fn fail_saves(&self, datastore_id: &str, fail: bool) {
        self.slots
            .lock()
            .entry(datastore_id.to_string())
            .or_default()
            .fail_saves = fail;
    }

    pub fn is_leased(&self, datastore_id: &str) -> bool {
        self.slots
            .lock()
            .get(datastore_id)
            .is_some_and(|slot| slot.leased)
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn open(
        &self,
        datastore_id: &str,
        capacity: &CapacityConfig,
    ) -> Result<Box<dyn ChangeLogStorage>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(datastore_id.to_string()).or_default();
        if slot.leased {
            return Err(Error::StoreLocked(datastore_id.to_string()));
        }
        slot.leased = true;
        slot.shared = capacity.shared_memory;

        Ok(Box::new(MemoryStorage {
            datastore_id: datastore_id.to_string(),
            slots: Arc::clone(&self.slots),
        }))
    }

    fn inspect(&self, datastore_id: &str) -> Result<Option<SnapshotMetadata>> {
        let slots = self.slots.lock();
        let bytes = match slots.get(datastore_id) {
            Some(slot) if slot.leased && !slot.shared => {
                return Err(Error::StoreLocked(datastore_id.to_string()));
            }
            Some(slot) => slot.bytes.clone(),
            None => None,
        };
        drop(slots);
        metadata_of(bytes)
    }
}

/// Lease on an in-memory store.
#[derive(Debug)]
pub struct MemoryStorage {
    datastore_id: DatastoreId,
    slots: Slots,
}

impl ChangeLogStorage for MemoryStorage {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .slots
            .lock()
            .get(&self.datastore_id)
            .and_then(|slot| slot.bytes.clone()))
    }

    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(self.datastore_id.clone()).or_default();
        if slot.fail_saves {
            return Err(Error::Io(format!(
                "simulated write failure for '{}'",
                self.datastore_id
            )));
        }
        slot.bytes = Some(bytes.to_vec());
        Ok(())
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(slot) = self.slots.lock().get_mut(&self.datastore_id) {
            slot.leased = false;
            slot.shared = false;
        }
    }
}

/// Provider keeping one directory per datastore under a root directory.
#[derive(Debug, Clone)]
pub struct FileStoreProvider {
    root: PathBuf,
}

impl FileStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a datastore. Characters outside `[A-Za-z0-9_.-]` are
    /// replaced so an ID can never escape the root.
    pub fn datastore_dir(&self, datastore_id: &str) -> PathBuf {
        let name: String = datastore_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.chars().all(|c| c == '.') {
            format!("_{}", name)
        } else {
            name
        };
        self.root.join(name)
    }

    fn read_snapshot(dir: &Path) -> Result<Option<Vec<u8>>> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}

impl StoreProvider for FileStoreProvider {
    fn open(
        &self,
        datastore_id: &str,
        capacity: &CapacityConfig,
    ) -> Result<Box<dyn ChangeLogStorage>> {
        let dir = self.datastore_dir(datastore_id);
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::StoreLocked(datastore_id.to_string()));
        }

        let shared_marker = dir.join(SHARED_FILE);
        if capacity.shared_memory {
            File::create(&shared_marker)?;
        } else if shared_marker.exists() {
            fs::remove_file(&shared_marker)?;
        }

        Ok(Box::new(FileStorage {
            dir,
            lock_file,
            shared: capacity.shared_memory,
        }))
    }

    fn inspect(&self, datastore_id: &str) -> Result<Option<SnapshotMetadata>> {
        let dir = self.datastore_dir(datastore_id);
        if !dir.exists() {
            return Ok(None);
        }

        let lock_path = dir.join(LOCK_FILE);
        if lock_path.exists() {
            // Readers share the lock; only a session's exclusive lease refuses it
            let reader = OpenOptions::new().read(true).open(&lock_path)?;
            if FileExt::try_lock_shared(&reader).is_ok() {
                FileExt::unlock(&reader)?;
            } else if !dir.join(SHARED_FILE).exists() {
                return Err(Error::StoreLocked(datastore_id.to_string()));
            }
        }

        metadata_of(Self::read_snapshot(&dir)?)
    }
}

/// Lease on a file backed store. Holds the `LOCK` file until dropped.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    lock_file: File,
    shared: bool,
}

impl FileStorage {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> Result<()> {
        Ok(())
    }
}

impl ChangeLogStorage for FileStorage {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        FileStoreProvider::read_snapshot(&self.dir)
    }

    /// Write-then-rename: temp file, fsync, rename, fsync directory.
    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        let temp_path = self.dir.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(SNAPSHOT_FILE))?;
        self.sync_directory()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if self.shared {
            let _ = fs::remove_file(self.dir.join(SHARED_FILE));
        }
        let _ = self.lock_file.unlock();
    }
}
