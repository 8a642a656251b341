//! Commit log
//!
//! The table's logical content is defined by an ordered sequence of commits,
//! one file per version:
//!
//! ```text
//! _log/
//!   00000000000000000000.commit   Metadata(schema, partition_by)
//!   00000000000000000001.commit   Append [part-1.mdf]
//!   00000000000000000002.commit   Append [part-2.mdf]
//!   00000000000000000003.commit   DeleteWhere id = 2
//!   00000000000000000004.commit   Remove [part-2.mdf]        (vacuum)
//! ```
//!
//! A commit is published by hard-linking a fully written and fsynced temp
//! file to its version path. The link fails if the version already exists,
//! so two writers can never both own a version; the loser refreshes and
//! retries with the next one. Readers replay commits into a [`LogState`],
//! an immutable snapshot shared through `Arc`.
//!
//! Recovery: the state is rebuilt by reading versions 0, 1, 2, ... until the
//! first missing one. Cached states are refreshed incrementally.

use super::codec::{read_frame, write_frame};
use super::data_file::FileMeta;
use super::predicate::Predicate;
use super::schema::Schema;
use crate::error::{Error, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory holding commit files, relative to the table root
pub const LOG_DIR: &str = "_log";

const COMMIT_EXT: &str = "commit";

/// Table-level metadata, committed once as version 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub entity: String,
    pub schema: Schema,
    #[serde(default)]
    pub partition_by: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One operation recorded in a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    /// Table creation (version 0 only)
    Metadata(TableMetadata),
    /// New data files become part of the table
    Append { files: Vec<FileMeta> },
    /// Rows matching the predicate, appended before this commit, are hidden
    DeleteWhere { predicate: Predicate },
    /// Replace a contiguous run of files with files holding their visible rows
    Rewrite {
        removed: Vec<String>,
        added: Vec<FileMeta>,
    },
    /// Files without visible rows stop being referenced
    Remove { paths: Vec<String> },
}

impl LogAction {
    fn kind(&self) -> &'static str {
        match self {
            LogAction::Metadata(_) => "metadata",
            LogAction::Append { .. } => "append",
            LogAction::DeleteWhere { .. } => "delete",
            LogAction::Rewrite { .. } => "rewrite",
            LogAction::Remove { .. } => "remove",
        }
    }
}

/// A single, immutable commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<LogAction>,
}

impl Commit {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::StorageUnavailable(format!("Failed to serialize commit: {}", e)))?;
        let mut bytes = Vec::with_capacity(json.len() + 8);
        write_frame(&mut bytes, &json)?;
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (json, _) = read_frame(bytes)?;
        serde_json::from_slice(json)
            .map_err(|e| Error::StorageUnavailable(format!("Failed to deserialize commit: {}", e)))
    }
}

/// A data file referenced by the current state
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFile {
    pub meta: FileMeta,
    /// Version of the commit that added the file
    pub added_at: u64,
}

/// A committed logical delete
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMarker {
    pub version: u64,
    pub predicate: Predicate,
}

/// A data file no longer referenced, waiting for vacuum
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub meta: FileMeta,
    pub removed_at: u64,
    pub timestamp: DateTime<Utc>,
}

/// Replayed table state as of `version`
#[derive(Debug, Clone)]
pub struct LogState {
    pub version: u64,
    pub metadata: TableMetadata,
    /// Active files in commit order
    pub files: Vec<ActiveFile>,
    /// Delete markers in version order
    pub deletes: Vec<DeleteMarker>,
    pub tombstones: BTreeMap<String, Tombstone>,
}

impl LogState {
    fn initial(commit: &Commit) -> Result<Self> {
        if commit.version != 0 {
            return Err(Error::StorageUnavailable(format!(
                "Expected version 0, found {}",
                commit.version
            )));
        }
        let metadata = match commit.actions.as_slice() {
            [LogAction::Metadata(metadata)] => metadata.clone(),
            _ => {
                return Err(Error::StorageUnavailable(
                    "Version 0 must hold exactly one metadata action".to_string(),
                ))
            }
        };
        Ok(Self {
            version: 0,
            metadata,
            files: Vec::new(),
            deletes: Vec::new(),
            tombstones: BTreeMap::new(),
        })
    }

    fn apply(&mut self, commit: &Commit) -> Result<()> {
        if commit.version != self.version + 1 {
            return Err(Error::StorageUnavailable(format!(
                "Commit {} does not follow version {}",
                commit.version, self.version
            )));
        }

        let mut shrunk = false;
        for action in &commit.actions {
            match action {
                LogAction::Metadata(_) => {
                    return Err(Error::StorageUnavailable(format!(
                        "Metadata action outside version 0 (version {})",
                        commit.version
                    )))
                }
                LogAction::Append { files } => {
                    self.files.extend(files.iter().map(|meta| ActiveFile {
                        meta: meta.clone(),
                        added_at: commit.version,
                    }));
                }
                LogAction::DeleteWhere { predicate } => {
                    self.deletes.push(DeleteMarker {
                        version: commit.version,
                        predicate: predicate.clone(),
                    });
                }
                LogAction::Rewrite { removed, added } => {
                    let position = self
                        .files
                        .iter()
                        .position(|f| removed.contains(&f.meta.path))
                        .unwrap_or(self.files.len());
                    self.detach(removed, commit)?;
                    let added = added.iter().map(|meta| ActiveFile {
                        meta: meta.clone(),
                        added_at: commit.version,
                    });
                    self.files.splice(position..position, added);
                    shrunk = true;
                }
                LogAction::Remove { paths } => {
                    self.detach(paths, commit)?;
                    shrunk = true;
                }
            }
        }

        if shrunk {
            // Markers older than every remaining file can no longer hide anything
            let oldest = self.files.iter().map(|f| f.added_at).min().unwrap_or(commit.version);
            self.deletes.retain(|d| d.version > oldest);
        }

        self.version = commit.version;
        Ok(())
    }

    fn detach(&mut self, paths: &[String], commit: &Commit) -> Result<()> {
        let wanted: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let mut found = 0;
        let mut kept = Vec::with_capacity(self.files.len());
        for file in self.files.drain(..) {
            if wanted.contains(file.meta.path.as_str()) {
                found += 1;
                self.tombstones.insert(
                    file.meta.path.clone(),
                    Tombstone {
                        meta: file.meta,
                        removed_at: commit.version,
                        timestamp: commit.timestamp,
                    },
                );
            } else {
                kept.push(file);
            }
        }
        self.files = kept;

        if found != wanted.len() {
            return Err(Error::StorageUnavailable(format!(
                "Commit {} removes files that are not active",
                commit.version
            )));
        }
        Ok(())
    }

    /// Reject actions that could not be replayed on top of this state
    fn check(&self, actions: &[LogAction]) -> Result<()> {
        let mut active: Option<HashSet<&str>> = None;
        for action in actions {
            let paths = match action {
                LogAction::Metadata(_) => {
                    return Err(Error::InvalidArgument(
                        "Table metadata cannot be changed".to_string(),
                    ))
                }
                LogAction::Rewrite { removed, .. } => removed,
                LogAction::Remove { paths } => paths,
                _ => continue,
            };
            let active = active.get_or_insert_with(|| {
                self.files.iter().map(|f| f.meta.path.as_str()).collect()
            });
            if let Some(missing) = paths.iter().find(|p| !active.remove(p.as_str())) {
                return Err(Error::Conflict(format!("File {} is no longer active", missing)));
            }
        }
        Ok(())
    }

    /// Delete markers committed after `version`
    pub fn deletes_after(&self, version: u64) -> &[DeleteMarker] {
        let start = self.deletes.partition_point(|d| d.version <= version);
        &self.deletes[start..]
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.meta.path == path)
    }

    /// Total size of active data files
    pub fn active_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.meta.size_bytes).sum()
    }
}

/// Durable, totally ordered commit log of one table
pub struct CommitLog {
    log_dir: PathBuf,
    state: RwLock<Arc<LogState>>,
    writer: Mutex<()>,
    retries: usize,
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("log_dir", &self.log_dir)
            .field("version", &self.state.read().version)
            .finish()
    }
}

impl CommitLog {
    /// Whether a table has been initialized at `table_root`
    pub fn exists<P: AsRef<Path>>(table_root: P) -> bool {
        version_path(&table_root.as_ref().join(LOG_DIR), 0).exists()
    }

    /// Open the log at `table_root`, committing `metadata` as version 0 if
    /// the table does not exist yet.
    ///
    /// When another writer creates the table concurrently, its metadata wins
    /// and is returned in the state; callers compare it with their own.
    pub fn create_or_open<P: AsRef<Path>>(
        table_root: P,
        metadata: TableMetadata,
        retries: usize,
    ) -> Result<Self> {
        let log_dir = table_root.as_ref().join(LOG_DIR);
        fs::create_dir_all(&log_dir)
            .map_err(|e| Error::StorageUnavailable(format!("Failed to create log dir: {}", e)))?;

        let initial = match read_commit(&log_dir, 0)? {
            Some(commit) => commit,
            None => {
                let commit = Commit {
                    version: 0,
                    timestamp: Utc::now(),
                    actions: vec![LogAction::Metadata(metadata)],
                };
                if publish(&log_dir, &commit)? {
                    info!(log = ?log_dir, "Created table log");
                    commit
                } else {
                    read_commit(&log_dir, 0)?.ok_or_else(|| {
                        Error::StorageUnavailable("Version 0 vanished after race".to_string())
                    })?
                }
            }
        };

        let log = Self {
            log_dir,
            state: RwLock::new(Arc::new(LogState::initial(&initial)?)),
            writer: Mutex::new(()),
            retries: retries.max(1),
        };
        let state = log.snapshot()?;
        info!(
            log = ?log.log_dir,
            version = state.version,
            files = state.files.len(),
            deletes = state.deletes.len(),
            "Opened table log"
        );
        Ok(log)
    }

    /// Latest committed state
    pub fn snapshot(&self) -> Result<Arc<LogState>> {
        let current = self.state.read().clone();
        if !version_path(&self.log_dir, current.version + 1).exists() {
            return Ok(current);
        }

        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut *guard);
        while let Some(commit) = read_commit(&self.log_dir, state.version + 1)? {
            state.apply(&commit)?;
        }
        Ok(guard.clone())
    }

    /// Commit `actions` as the next version
    pub fn commit(&self, actions: Vec<LogAction>) -> Result<u64> {
        self.commit_with(|_| Ok(actions.clone()))?
            .ok_or_else(|| Error::InvalidArgument("Cannot commit an empty action list".to_string()))
    }

    /// Build the next commit from the latest state while holding the writer
    /// lock. Returns `None` without committing if `build` yields no actions.
    ///
    /// `build` runs again against the refreshed state when another process
    /// wins the version race.
    pub fn commit_with<F>(&self, mut build: F) -> Result<Option<u64>>
    where
        F: FnMut(&LogState) -> Result<Vec<LogAction>>,
    {
        let _writer = self.writer.lock();

        for attempt in 0..self.retries {
            let state = self.snapshot()?;
            let actions = build(&state)?;
            if actions.is_empty() {
                return Ok(None);
            }
            state.check(&actions)?;

            let commit = Commit {
                version: state.version + 1,
                timestamp: Utc::now(),
                actions,
            };

            if !publish(&self.log_dir, &commit)? {
                metrics::COMMIT_RETRIES.inc();
                warn!(version = commit.version, attempt, "Lost commit race, retrying");
                continue;
            }

            for action in &commit.actions {
                metrics::COMMITS_TOTAL.with_label_values(&[action.kind()]).inc();
            }
            {
                let mut guard = self.state.write();
                // A concurrent snapshot() may already have replayed it
                if guard.version < commit.version {
                    Arc::make_mut(&mut *guard).apply(&commit)?;
                }
            }
            debug!(version = commit.version, actions = commit.actions.len(), "Committed");
            return Ok(Some(commit.version));
        }

        Err(Error::Conflict(format!(
            "Gave up after {} lost commit races",
            self.retries
        )))
    }
}

fn version_path(log_dir: &Path, version: u64) -> PathBuf {
    log_dir.join(format!("{:020}.{}", version, COMMIT_EXT))
}

fn read_commit(log_dir: &Path, version: u64) -> Result<Option<Commit>> {
    let bytes = match fs::read(version_path(log_dir, version)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::StorageUnavailable(format!(
                "Failed to read commit {}: {}",
                version, e
            )))
        }
    };

    let commit = Commit::from_bytes(&bytes)?;
    if commit.version != version {
        return Err(Error::StorageUnavailable(format!(
            "Commit file {} claims version {}",
            version, commit.version
        )));
    }
    Ok(Some(commit))
}

/// Atomically publish `commit`. Returns `false` if its version already exists.
fn publish(log_dir: &Path, commit: &Commit) -> Result<bool> {
    let bytes = commit.to_bytes()?;
    let temp_path = log_dir.join(format!(
        ".{:020}.{}.tmp",
        commit.version,
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to create commit file: {}", e)))?;
    let written = file.write_all(&bytes).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written {
        fs::remove_file(&temp_path).ok();
        return Err(Error::StorageUnavailable(format!("Failed to write commit: {}", e)));
    }

    let linked = fs::hard_link(&temp_path, version_path(log_dir, commit.version));
    fs::remove_file(&temp_path).ok();
    match linked {
        Ok(()) => {
            if let Ok(dir) = File::open(log_dir) {
                dir.sync_all().ok();
            }
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::StorageUnavailable(format!(
            "Failed to publish commit {}: {}",
            commit.version, e
        ))),
    }
}
