//! Durable mapping record storage.
//!
//! Records are stored as one JSON file per container under the storage
//! directory. A record lands in two phases: [`MappingStore::put`] writes it
//! to a `.pending` side file, and [`MappingStore::commit`] renames it into
//! place once the caller has finished the work the record describes. The
//! rename is the only commit point, so a crash anywhere before it leaves no
//! visible record — [`MappingStore::open`] discards stale pending files.
//!
//! The directory is guarded by an advisory `flock` on a `.lock` file so two
//! processes cannot own the same storage path at once.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use lotse_common::{ContainerId, LotseError, LotseResult};
use rustix::fs::FlockOperation;

use crate::mapping::MappingRecord;

const LOCK_FILE: &str = ".lock";
const RECORD_EXT: &str = "json";
const PENDING_EXT: &str = "pending";

/// Durable, keyed table of mapping records.
#[derive(Debug)]
pub struct MappingStore {
    /// Storage directory.
    root: PathBuf,
    /// Held advisory lock; `None` once closed.
    lock: Option<File>,
    /// Committed records, loaded at open.
    records: HashMap<ContainerId, MappingRecord>,
}

impl MappingStore {
    /// Open a store at `root`, creating the directory if absent.
    ///
    /// Acquires an exclusive advisory lock on the directory, removes stale
    /// pending files left behind by a crashed writer, and loads every
    /// committed record.
    ///
    /// # Errors
    ///
    /// Fails with [`LotseError::Locked`] if another process holds the lock,
    /// or [`LotseError::Corrupted`] if a record cannot be parsed.
    pub fn open(root: impl Into<PathBuf>) -> LotseResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lock = Self::acquire_lock(&root)?;
        let records = Self::load_records(&root)?;

        tracing::debug!(
            path = %root.display(),
            records = records.len(),
            "Opened mapping store"
        );

        Ok(Self {
            root,
            lock: Some(lock),
            records,
        })
    }

    /// The storage directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up the committed record for `id`.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<&MappingRecord> {
        self.records.get(id)
    }

    /// Whether a committed record for `id` exists.
    #[must_use]
    pub fn contains(&self, id: &ContainerId) -> bool {
        self.records.contains_key(id)
    }

    /// Iterate over all committed records.
    pub fn records(&self) -> impl Iterator<Item = &MappingRecord> {
        self.records.values()
    }

    /// Write `record` as a pending file, without making it visible.
    ///
    /// The write is durable (fsynced) but the record does not exist for
    /// readers — including a reopened store — until [`Self::commit`].
    ///
    /// # Errors
    ///
    /// Fails with [`LotseError::DuplicateId`] if a committed record for the
    /// id exists, or with an I/O error.
    pub fn put(&mut self, record: &MappingRecord) -> LotseResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(LotseError::DuplicateId {
                id: record.id.to_string(),
            });
        }

        let pending = self.pending_path(&record.id);
        let json = serde_json::to_string_pretty(record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&pending)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        tracing::debug!(
            id = %record.id,
            mappings = record.mappings.len(),
            "Staged pending record"
        );

        Ok(())
    }

    /// Promote the pending file for `record` to a committed record.
    ///
    /// This rename is the commit point: after it returns, the record
    /// survives restarts.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rename or directory sync fails.
    pub fn commit(&mut self, record: MappingRecord) -> LotseResult<()> {
        let pending = self.pending_path(&record.id);
        let path = self.record_path(&record.id);

        fs::rename(&pending, &path)?;
        File::open(&self.root)?.sync_all()?;

        tracing::debug!(id = %record.id, path = %path.display(), "Committed record");
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Discard the pending file for `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing pending file cannot be removed.
    pub fn abort(&mut self, id: &ContainerId) -> LotseResult<()> {
        let pending = self.pending_path(id);
        match fs::remove_file(&pending) {
            Ok(()) => {
                tracing::debug!(id = %id, "Discarded pending record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the committed record for `id`, returning it.
    ///
    /// The removal is atomic (a single unlink).
    ///
    /// # Errors
    ///
    /// Fails with [`LotseError::NotFound`] if no record exists for `id`.
    pub fn delete(&mut self, id: &ContainerId) -> LotseResult<MappingRecord> {
        let Some(record) = self.records.remove(id) else {
            return Err(LotseError::NotFound { id: id.to_string() });
        };

        if let Err(err) = fs::remove_file(self.record_path(id)) {
            // Keep the in-memory view aligned with disk.
            self.records.insert(id.clone(), record);
            return Err(err.into());
        }

        tracing::debug!(id = %id, "Deleted record");
        Ok(record)
    }

    /// Release the advisory lock. Idempotent.
    pub fn close(&mut self) {
        if let Some(lock) = self.lock.take() {
            // Dropping the descriptor releases the flock.
            drop(lock);
            tracing::debug!(path = %self.root.display(), "Closed mapping store");
        }
    }

    fn record_path(&self, id: &ContainerId) -> PathBuf {
        self.root.join(format!("{id}.{RECORD_EXT}"))
    }

    fn pending_path(&self, id: &ContainerId) -> PathBuf {
        self.root.join(format!("{id}.{RECORD_EXT}.{PENDING_EXT}"))
    }

    fn acquire_lock(root: &Path) -> LotseResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;

        rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive).map_err(|errno| {
            if errno == rustix::io::Errno::WOULDBLOCK {
                LotseError::Locked {
                    path: root.to_path_buf(),
                }
            } else {
                LotseError::Io(errno.into())
            }
        })?;

        Ok(file)
    }

    fn load_records(root: &Path) -> LotseResult<HashMap<ContainerId, MappingRecord>> {
        let mut records = HashMap::new();

        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            match path.extension().and_then(|e| e.to_str()) {
                Some(PENDING_EXT) => {
                    // Leftover from a writer that died before its commit
                    // point; the record was never active.
                    tracing::warn!(path = %path.display(), "Discarding stale pending record");
                    fs::remove_file(&path)?;
                }
                Some(RECORD_EXT) => {
                    let record = Self::load_record(&path)?;
                    records.insert(record.id.clone(), record);
                }
                _ => {}
            }
        }

        Ok(records)
    }

    fn load_record(path: &Path) -> LotseResult<MappingRecord> {
        let json = fs::read_to_string(path)?;
        let record: MappingRecord =
            serde_json::from_str(&json).map_err(|e| LotseError::Corrupted {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if stem != record.id.as_str() {
            return Err(LotseError::Corrupted {
                path: path.to_path_buf(),
                message: format!("file name does not match record id {}", record.id),
            });
        }

        Ok(record)
    }
}

impl Drop for MappingStore {
    fn drop(&mut self) {
        self.close();
    }
}
