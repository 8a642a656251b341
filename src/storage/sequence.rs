//! Durable per-entity id sequences
//!
//! One counter file per entity holds the highest id issued so far:
//!
//! ```text
//! <data_dir>/seq/transactions.seq   "1042"
//! <data_dir>/seq/accounts.seq       "10"
//! ```
//!
//! Every allocation takes the entity's lock, re-reads the file, increments,
//! and replaces the file atomically (write temp, fsync, rename). The lock is
//! an in-process mutex plus an exclusive OS lock on `<entity>.seq.lock`, so
//! allocators in other processes (or other `Store`s) on the same directory
//! wait their turn. Ids may have gaps when a caller never uses one, but are
//! never issued twice.

use crate::error::{Error, Result};
use crate::metrics;
use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Monotonic id allocator, one durable counter per entity
pub struct SequenceAllocator {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("root", &self.root)
            .finish()
    }
}

impl SequenceAllocator {
    /// Open the allocator rooted at `root` (usually `<data_dir>/seq`)
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            Error::StorageUnavailable(format!("Failed to create sequence dir: {}", e))
        })?;
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    fn path(&self, entity: &str) -> PathBuf {
        self.root.join(format!("{}.seq", entity))
    }

    fn lock(&self, entity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Exclusive lock on the entity's lock file, released when the file closes
    fn lock_file(&self, entity: &str) -> Result<File> {
        let path = self.root.join(format!("{}.seq.lock", entity));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                Error::StorageUnavailable(format!("Failed to open sequence lock: {}", e))
            })?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            Error::StorageUnavailable(format!("Failed to lock sequence '{}': {}", entity, e))
        })?;
        Ok(file)
    }

    /// Issue the next id for `entity`
    pub fn next_id(&self, entity: &str) -> Result<i64> {
        let lock = self.lock(entity);
        let _guard = lock.lock();
        let _file_lock = self.lock_file(entity)?;

        let current = self.read(entity)?;
        let next = current.checked_add(1).ok_or_else(|| {
            Error::StorageUnavailable(format!("Sequence for '{}' is exhausted", entity))
        })?;
        self.write(entity, next)?;

        metrics::IDS_ALLOCATED.inc();
        debug!(entity, id = next, "Allocated id");
        Ok(next)
    }

    /// Highest id issued so far (0 if none)
    pub fn current(&self, entity: &str) -> Result<i64> {
        let lock = self.lock(entity);
        let _guard = lock.lock();
        self.read(entity)
    }

    /// Raise the counter to `id` if it is lower. Never lowers it.
    pub fn ensure_at_least(&self, entity: &str, id: i64) -> Result<()> {
        let lock = self.lock(entity);
        let _guard = lock.lock();
        let _file_lock = self.lock_file(entity)?;

        let current = self.read(entity)?;
        if id > current {
            self.write(entity, id)?;
            debug!(entity, from = current, to = id, "Advanced sequence");
        }
        Ok(())
    }

    fn read(&self, entity: &str) -> Result<i64> {
        let path = self.path(entity);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::StorageUnavailable(format!(
                    "Failed to read sequence '{}': {}",
                    entity, e
                )))
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Ok(0);
        }
        text.parse::<i64>().map_err(|_| {
            Error::StorageUnavailable(format!(
                "Corrupt sequence file for '{}': {:?}",
                entity, text
            ))
        })
    }

    fn write(&self, entity: &str, value: i64) -> Result<()> {
        let path = self.path(entity);
        let temp_path = self.root.join(format!(
            ".{}.seq.{}.tmp",
            entity,
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                Error::StorageUnavailable(format!("Failed to open sequence temp file: {}", e))
            })?;
        file.write_all(value.to_string().as_bytes())
            .map_err(|e| Error::StorageUnavailable(format!("Failed to write sequence: {}", e)))?;
        file.sync_all()
            .map_err(|e| Error::StorageUnavailable(format!("Failed to sync sequence: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(|e| {
            fs::remove_file(&temp_path).ok();
            Error::StorageUnavailable(format!("Failed to replace sequence: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("minidelta_{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_sequential_ids_have_no_gaps() -> Result<()> {
        let root = temp_root("seq");
        let seq = SequenceAllocator::new(&root)?;

        let ids: Vec<i64> = (0..20).map(|_| seq.next_id("transactions")).collect::<Result<_>>()?;
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
        assert_eq!(seq.current("transactions")?, 20);

        // Entities are independent
        assert_eq!(seq.next_id("accounts")?, 1);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_counter_survives_reopen() -> Result<()> {
        let root = temp_root("seq_reopen");
        {
            let seq = SequenceAllocator::new(&root)?;
            seq.next_id("users")?;
            seq.next_id("users")?;
        }
        let seq = SequenceAllocator::new(&root)?;
        assert_eq!(seq.next_id("users")?, 3);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_concurrent_ids_are_unique() -> Result<()> {
        let root = temp_root("seq_concurrent");
        let seq = Arc::new(SequenceAllocator::new(&root)?);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| seq.next_id("transactions"))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap()? {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(all.len(), 200);
        assert_eq!(seq.current("transactions")?, 200);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_separate_allocators_share_the_counter() -> Result<()> {
        let root = temp_root("seq_instances");

        // One allocator per thread, as separate processes would have
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let seq = SequenceAllocator::new(&root)?;
                    (0..50)
                        .map(|_| seq.next_id("transactions"))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap()? {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(all.len(), 200);
        assert_eq!(all.iter().max(), Some(&200));
        assert_eq!(SequenceAllocator::new(&root)?.current("transactions")?, 200);

        // No temp files left behind
        let stray = std::fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(stray, 0);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_ensure_at_least_never_lowers() -> Result<()> {
        let root = temp_root("seq_raise");
        let seq = SequenceAllocator::new(&root)?;

        seq.ensure_at_least("categories", 10)?;
        assert_eq!(seq.next_id("categories")?, 11);
        seq.ensure_at_least("categories", 3)?;
        assert_eq!(seq.next_id("categories")?, 12);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_corrupt_counter_is_an_error() -> Result<()> {
        let root = temp_root("seq_corrupt");
        let seq = SequenceAllocator::new(&root)?;
        std::fs::write(root.join("accounts.seq"), "not-a-number").unwrap();

        assert!(matches!(
            seq.next_id("accounts"),
            Err(Error::StorageUnavailable(_))
        ));
        // And the file was left alone
        assert_eq!(
            std::fs::read_to_string(root.join("accounts.seq")).unwrap(),
            "not-a-number"
        );

        std::fs::write(root.join("empty.seq"), "").unwrap();
        assert_eq!(seq.next_id("empty")?, 1);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }
}
