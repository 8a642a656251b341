//! Table storage engine
//!
//! A [`Table`] composes a [`CommitLog`], immutable data files and an injected
//! [`SequenceAllocator`]:
//!
//! - `insert` writes one new data file and commits an `Append`
//! - `delete` commits a `DeleteWhere id = ..` marker
//! - `update` commits a delete for the id, then appends the merged record
//!   under the same id (two commits, not atomic as a pair)
//! - appends re-check id uniqueness against the state they commit on top
//!   of, so racing writers in any process never leave one id visible twice
//! - reads build a [`Scanner`] over the latest snapshot
//! - `vacuum` and `compact` are the only operations that shrink storage
//!
//! Nothing is ever edited in place.

use super::data_file::{write_data_file, FileMeta, WriteOptions, DATA_FILE_EXT, TEMP_FILE_EXT};
use super::log::{CommitLog, LogAction, LogState, TableMetadata, LOG_DIR};
use super::predicate::Predicate;
use super::scan::{collect_page, visible_rows, CancelFlag, ScanOptions, Scanner};
use super::schema::{Schema, ID_COLUMN};
use super::sequence::SequenceAllocator;
use super::value::{Record, Value};
use crate::error::{Error, Result};
use crate::metrics;
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Per-table engine settings
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub write: WriteOptions,
    pub orphan_grace: Duration,
    pub commit_retries: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        let config = crate::config::StoreConfig::default();
        Self::from(&config)
    }
}

impl From<&crate::config::StoreConfig> for TableOptions {
    fn from(config: &crate::config::StoreConfig) -> Self {
        Self {
            write: WriteOptions {
                codec: config.compression,
                level: config.compression_level,
            },
            orphan_grace: config.orphan_grace(),
            commit_retries: config.commit_retries,
        }
    }
}

/// Outcome of a vacuum
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Files tombstoned by this run because none of their rows are visible
    pub files_tombstoned: usize,
    /// Files physically deleted, relative to the table root
    pub files_removed: Vec<String>,
    pub bytes_freed: u64,
}

/// Outcome of a compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub version: Option<u64>,
    pub files_removed: usize,
    pub files_added: usize,
    pub rows_rewritten: u64,
}

/// Point-in-time table statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub version: u64,
    pub active_files: usize,
    pub active_bytes: u64,
    pub stored_rows: u64,
    pub delete_markers: usize,
    pub tombstones: usize,
}

/// A named, schema-typed, append-only table
pub struct Table {
    entity: String,
    root: PathBuf,
    metadata: TableMetadata,
    log: CommitLog,
    sequences: Arc<SequenceAllocator>,
    options: TableOptions,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("entity", &self.entity)
            .field("root", &self.root)
            .finish()
    }
}

impl Table {
    /// Open the table at `root`, creating it if it has no commit log yet.
    ///
    /// Reopening with a different schema or partitioning is a
    /// `SchemaMismatch`.
    pub fn create_if_missing<P: AsRef<Path>>(
        root: P,
        entity: &str,
        schema: Schema,
        partition_by: Vec<String>,
        sequences: Arc<SequenceAllocator>,
        options: TableOptions,
    ) -> Result<Self> {
        validate_name(entity)?;
        for column in &partition_by {
            if schema.field(column).is_none() {
                return Err(Error::SchemaMismatch(format!(
                    "Partition column '{}' is not in the schema",
                    column
                )));
            }
        }

        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::StorageUnavailable(format!("Failed to create table dir: {}", e)))?;

        let existed = CommitLog::exists(&root);
        let wanted = TableMetadata {
            entity: entity.to_string(),
            schema,
            partition_by,
            created_at: Utc::now(),
        };
        let log = CommitLog::create_or_open(&root, wanted.clone(), options.commit_retries)?;
        let metadata = log.snapshot()?.metadata.clone();

        if metadata.schema != wanted.schema || metadata.partition_by != wanted.partition_by {
            return Err(Error::SchemaMismatch(format!(
                "Table '{}' exists with a different schema or partitioning",
                entity
            )));
        }

        info!(entity, path = ?root, existed, "Table ready");
        Ok(Self {
            entity: entity.to_string(),
            root,
            metadata,
            log,
            sequences,
            options,
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn schema(&self) -> &Schema {
        &self.metadata.schema
    }

    pub fn partition_by(&self) -> &[String] {
        &self.metadata.partition_by
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Latest committed version
    pub fn version(&self) -> Result<u64> {
        Ok(self.log.snapshot()?.version)
    }

    /// Insert one record, assigning an id unless one is supplied.
    ///
    /// The record is validated before any id is allocated or file written.
    pub fn insert(&self, record: Record) -> Result<Record> {
        let mut stored = self.insert_many(vec![record])?;
        stored
            .pop()
            .ok_or_else(|| Error::Internal("Insert produced no record".to_string()))
    }

    /// Insert several records as one commit
    pub fn insert_many(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let rows = records
            .into_iter()
            .map(|r| self.metadata.schema.conform(r, true))
            .collect::<Result<Vec<_>>>()?;

        // Uniqueness is checked on this snapshot, then again at commit time
        // for anything committed since
        let base = self.log.snapshot()?;
        let mut explicit = HashSet::new();
        for row in &rows {
            if let Some(Value::Int(id)) = row.get(ID_COLUMN) {
                if !explicit.insert(*id) || self.lookup(Arc::clone(&base), *id)?.is_some() {
                    return Err(Error::DuplicateId(*id));
                }
            }
        }

        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = match row.get(ID_COLUMN) {
                Some(Value::Int(id)) => {
                    self.sequences.ensure_at_least(&self.entity, *id)?;
                    *id
                }
                _ => self.sequences.next_id(&self.entity)?,
            };
            row.insert(ID_COLUMN.to_string(), Value::Int(id));
            stored.push(row);
        }

        let ids: HashSet<i64> = stored.iter().filter_map(record_id).collect();
        let version = self
            .append(&stored, |state| {
                match self.visible_ids_since(state, base.version, &ids)?.first() {
                    Some(id) => Err(Error::DuplicateId(*id)),
                    None => Ok(true),
                }
            })?
            .ok_or_else(|| Error::Internal("Insert was not committed".to_string()))?;
        debug!(entity = %self.entity, version, rows = stored.len(), "Inserted");
        Ok(stored)
    }

    /// Write data files for `rows` (grouped by partition) and commit them.
    ///
    /// `admit` sees the state the append would land on, on every attempt:
    /// `Ok(false)` drops the append (returning `None`), an error aborts it.
    /// Written files are discarded unless the commit happens.
    fn append<F>(&self, rows: &[Record], mut admit: F) -> Result<Option<u64>>
    where
        F: FnMut(&LogState) -> Result<bool>,
    {
        let mut groups: Vec<(Vec<Value>, Vec<Record>)> = Vec::new();
        for row in rows {
            let key: Vec<Value> = self
                .metadata
                .partition_by
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(row.clone()),
                None => groups.push((key, vec![row.clone()])),
            }
        }

        let mut files = Vec::with_capacity(groups.len());
        for (_, group) in &groups {
            match self.write_file(group) {
                Ok(meta) => files.push(meta),
                Err(e) => {
                    self.discard(&files);
                    return Err(e);
                }
            }
        }

        let committed = self.log.commit_with(|state| {
            if !admit(state)? {
                return Ok(vec![]);
            }
            Ok(vec![LogAction::Append {
                files: files.clone(),
            }])
        });
        if !matches!(committed, Ok(Some(_))) {
            self.discard(&files);
        }
        committed
    }

    /// Ids from `ids` held by a visible row of a file committed after `since`
    fn visible_ids_since(
        &self,
        state: &LogState,
        since: u64,
        ids: &HashSet<i64>,
    ) -> Result<Vec<i64>> {
        let mut found = Vec::new();
        for file in state.files.iter().filter(|f| f.added_at > since) {
            if !ids.iter().any(|id| Predicate::id(*id).may_match(&file.meta)) {
                continue;
            }
            let rows = visible_rows(
                &self.root,
                &self.metadata.schema,
                file,
                state.deletes_after(file.added_at),
            )?;
            found.extend(
                rows.iter()
                    .filter_map(record_id)
                    .filter(|id| ids.contains(id)),
            );
        }
        Ok(found)
    }

    fn write_file(&self, rows: &[Record]) -> Result<FileMeta> {
        write_data_file(
            &self.root,
            &self.metadata.schema,
            &self.metadata.partition_by,
            rows,
            self.options.write,
        )
    }

    /// Best-effort removal of files that never made it into a commit
    fn discard(&self, files: &[FileMeta]) {
        for meta in files {
            if let Err(e) = fs::remove_file(self.root.join(&meta.path)) {
                warn!(path = %meta.path, error = %e, "Failed to discard uncommitted file");
            }
        }
    }

    /// Visible record with the given id
    pub fn get(&self, id: i64) -> Result<Option<Record>> {
        self.lookup(self.log.snapshot()?, id)
    }

    fn lookup(&self, snapshot: Arc<LogState>, id: i64) -> Result<Option<Record>> {
        Scanner::new(&self.root, snapshot, ScanOptions::filtered(Predicate::id(id)))?
            .next()
            .transpose()
    }

    /// Merge `patch` into the record `id` and store it under the same id.
    ///
    /// Commits a delete, then an append. A failure between the two leaves the
    /// record deleted; a concurrent reader may observe that gap. When another
    /// delete of the id lands inside the gap (a racing update or delete), that
    /// later commit wins and the append is dropped. An id re-inserted inside
    /// the gap is a `Conflict`.
    pub fn update(&self, id: i64, mut patch: Record) -> Result<Option<Record>> {
        if let Some(unknown) = patch.keys().find(|k| self.metadata.schema.field(k).is_none()) {
            return Err(Error::SchemaMismatch(format!("Unknown column '{}'", unknown)));
        }
        patch.remove(ID_COLUMN);

        let mut merged = match self.get(id)? {
            Some(current) => current,
            None => return Ok(None),
        };
        merged.extend(patch);
        merged.insert(ID_COLUMN.to_string(), Value::Int(id));
        let merged = self.metadata.schema.conform(merged, false)?;

        let deleted_at = self.log.commit(vec![LogAction::DeleteWhere {
            predicate: Predicate::id(id),
        }])?;
        let ids = HashSet::from([id]);
        let version = self.append(std::slice::from_ref(&merged), |state| {
            if state
                .deletes_after(deleted_at)
                .iter()
                .any(|d| d.predicate.matches(&merged))
            {
                return Ok(false);
            }
            if !self.visible_ids_since(state, deleted_at, &ids)?.is_empty() {
                return Err(Error::Conflict(format!(
                    "Record {} was inserted again while it was being updated",
                    id
                )));
            }
            Ok(true)
        })?;

        match version {
            Some(version) => debug!(entity = %self.entity, id, version, "Updated"),
            None => debug!(entity = %self.entity, id, "Update superseded by a later delete"),
        }
        Ok(Some(merged))
    }

    /// Logically delete the record `id`. Returns whether it existed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        let version = self.log.commit(vec![LogAction::DeleteWhere {
            predicate: Predicate::id(id),
        }])?;
        debug!(entity = %self.entity, id, version, "Deleted");
        Ok(true)
    }

    /// Lazy scan of the latest snapshot
    pub fn scan(&self, options: ScanOptions) -> Result<Scanner> {
        Scanner::new(&self.root, self.log.snapshot()?, options)
    }

    /// Rows `(page-1)*size .. page*size` of the matching rows, in commit order
    pub fn paginate(
        &self,
        page: usize,
        size: usize,
        predicate: Option<Predicate>,
    ) -> Result<Vec<Record>> {
        if page < 1 || size < 1 {
            return Err(Error::InvalidArgument(
                "Page and size must be 1 or greater".to_string(),
            ));
        }
        let scanner = self.scan(ScanOptions {
            predicate,
            ..ScanOptions::default()
        })?;
        collect_page(scanner, page, size)
    }

    /// Number of visible rows matching `predicate`
    pub fn count(&self, predicate: Option<Predicate>) -> Result<u64> {
        self.scan(ScanOptions {
            predicate,
            ..ScanOptions::default()
        })?
        .count()
    }

    /// Every visible row, all columns, in commit order
    pub fn export(&self) -> Result<Scanner> {
        self.scan(ScanOptions::all())
    }

    /// Physically remove data that no retained snapshot needs
    pub fn vacuum(&self, retention: Duration) -> Result<VacuumReport> {
        self.vacuum_with(retention, None)
    }

    /// [`Table::vacuum`] with cooperative cancellation between files
    pub fn vacuum_with(
        &self,
        retention: Duration,
        cancel: Option<&CancelFlag>,
    ) -> Result<VacuumReport> {
        let check = || cancel.map(|c| c.check()).unwrap_or(Ok(()));
        let mut report = VacuumReport::default();

        // Tombstone files whose rows are all hidden
        let snapshot = self.log.snapshot()?;
        let dead = self.dead_files(&snapshot, cancel)?;
        check()?;
        if !dead.is_empty() {
            let mut tombstoned = 0;
            self.log.commit_with(|state| {
                let paths: Vec<String> =
                    dead.iter().filter(|p| state.is_active(p)).cloned().collect();
                tombstoned = paths.len();
                Ok(if paths.is_empty() {
                    vec![]
                } else {
                    vec![LogAction::Remove { paths }]
                })
            })?;
            report.files_tombstoned = tombstoned;
        }

        // Delete tombstones older than the retention horizon
        let snapshot = self.log.snapshot()?;
        let horizon = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r));
        for (path, tombstone) in &snapshot.tombstones {
            check()?;
            let expired = horizon.map(|h| tombstone.timestamp <= h).unwrap_or(false);
            if expired {
                if let Some(bytes) = self.remove_data_file(path)? {
                    report.files_removed.push(path.clone());
                    report.bytes_freed += bytes;
                }
            }
        }

        // Delete files no commit references, once they are old enough
        let grace = retention.max(self.options.orphan_grace);
        for path in self.orphans(&snapshot, grace)? {
            check()?;
            warn!(entity = %self.entity, path = %path, "Removing unreferenced file");
            if let Some(bytes) = self.remove_data_file(&path)? {
                report.files_removed.push(path);
                report.bytes_freed += bytes;
            }
        }

        metrics::FILES_VACUUMED.inc_by(report.files_removed.len() as u64);
        metrics::BYTES_VACUUMED.inc_by(report.bytes_freed);
        info!(
            entity = %self.entity,
            tombstoned = report.files_tombstoned,
            removed = report.files_removed.len(),
            bytes = report.bytes_freed,
            "Vacuum complete"
        );
        Ok(report)
    }

    /// Active files in `snapshot` without a single visible row
    fn dead_files(&self, snapshot: &LogState, cancel: Option<&CancelFlag>) -> Result<Vec<String>> {
        let schema = &snapshot.metadata.schema;
        let results: Vec<Option<String>> = snapshot
            .files
            .par_iter()
            .map(|file| -> Result<Option<String>> {
                if let Some(cancel) = cancel {
                    cancel.check()?;
                }
                let deletes = snapshot.deletes_after(file.added_at);
                if deletes.is_empty() {
                    return Ok(None);
                }
                let dead = deletes.iter().any(|d| d.predicate.covers(&file.meta))
                    || visible_rows(&self.root, schema, file, deletes)?.is_empty();
                Ok(dead.then(|| file.meta.path.clone()))
            })
            .collect::<Result<_>>()?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Remove one data file; `None` if it was already gone
    fn remove_data_file(&self, path: &str) -> Result<Option<u64>> {
        let full = self.root.join(path);
        let size = match fs::metadata(&full) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::StorageUnavailable(format!(
                    "Failed to stat {}: {}",
                    path, e
                )))
            }
        };
        match fs::remove_file(&full) {
            Ok(()) => {
                debug!(path, size, "Removed data file");
                Ok(Some(size))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::StorageUnavailable(format!(
                "Failed to remove {}: {}",
                path, e
            ))),
        }
    }

    /// Data and temp files under the table root that no commit references
    /// and whose last modification is older than `grace`
    fn orphans(&self, snapshot: &LogState, grace: Duration) -> Result<Vec<String>> {
        let referenced: HashSet<&str> = snapshot
            .files
            .iter()
            .map(|f| f.meta.path.as_str())
            .chain(snapshot.tombstones.keys().map(String::as_str))
            .collect();
        let cutoff = SystemTime::now().checked_sub(grace);

        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir).map_err(|e| {
                Error::StorageUnavailable(format!("Failed to list {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let entry = entry
                    .map_err(|e| Error::StorageUnavailable(format!("Failed to list dir: {}", e)))?;
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .map_err(|e| Error::StorageUnavailable(format!("Failed to stat: {}", e)))?;
                if meta.is_dir() {
                    if entry.file_name() != LOG_DIR {
                        stack.push(path);
                    }
                    continue;
                }

                let ext = path.extension().and_then(|e| e.to_str());
                if ext != Some(DATA_FILE_EXT) && ext != Some(TEMP_FILE_EXT) {
                    continue;
                }
                let rel = match path.strip_prefix(&self.root) {
                    Ok(rel) => rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    Err(_) => continue,
                };
                if referenced.contains(rel.as_str()) {
                    continue;
                }
                let old_enough = match (meta.modified(), cutoff) {
                    (Ok(modified), Some(cutoff)) => modified <= cutoff,
                    _ => false,
                };
                if old_enough {
                    found.push(rel);
                }
            }
        }
        Ok(found)
    }

    /// Rewrite runs of small files (and files carrying deleted rows) into
    /// files of up to `target_rows` visible rows. File order, and so commit
    /// order of rows, is preserved.
    pub fn compact(&self, target_rows: usize) -> Result<CompactReport> {
        if target_rows < 1 {
            return Err(Error::InvalidArgument(
                "Compaction target must be at least one row".to_string(),
            ));
        }

        let snapshot = self.log.snapshot()?;

        // Contiguous runs of candidates sharing partition values
        let mut runs: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for (i, file) in snapshot.files.iter().enumerate() {
            let candidate = file.meta.row_count < target_rows as u64
                || !snapshot.deletes_after(file.added_at).is_empty();
            let continues = current.last().map_or(false, |&prev| {
                snapshot.files[prev].meta.partition_values == file.meta.partition_values
            });
            if !candidate || !continues {
                if !current.is_empty() {
                    runs.push(std::mem::take(&mut current));
                }
            }
            if candidate {
                current.push(i);
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs.retain(|run| {
            run.len() > 1
                || run
                    .iter()
                    .any(|&i| !snapshot.deletes_after(snapshot.files[i].added_at).is_empty())
        });
        if runs.is_empty() {
            return Ok(CompactReport::default());
        }

        let mut written: Vec<FileMeta> = Vec::new();
        let mut report = CompactReport::default();
        let rewritten = self.rewrite_runs(&snapshot, &runs, target_rows, &mut written, &mut report);
        let actions = match rewritten {
            Ok(actions) => actions,
            Err(e) => {
                self.discard(&written);
                return Err(e);
            }
        };

        let base = snapshot.version;
        let committed = self.log.commit_with(|state| {
            if state.deletes.last().map_or(false, |d| d.version > base) {
                return Err(Error::Conflict(
                    "A delete was committed while compacting".to_string(),
                ));
            }
            Ok(actions.clone())
        });
        match committed {
            Ok(version) => {
                report.version = version;
                info!(
                    entity = %self.entity,
                    version = ?version,
                    removed = report.files_removed,
                    added = report.files_added,
                    rows = report.rows_rewritten,
                    "Compaction complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.discard(&written);
                Err(e)
            }
        }
    }

    /// Write the visible rows of each run into new files, recording every
    /// file in `written` as soon as it exists
    fn rewrite_runs(
        &self,
        snapshot: &LogState,
        runs: &[Vec<usize>],
        target_rows: usize,
        written: &mut Vec<FileMeta>,
        report: &mut CompactReport,
    ) -> Result<Vec<LogAction>> {
        let mut actions = Vec::with_capacity(runs.len());
        for run in runs {
            let mut rows = Vec::new();
            for &i in run {
                let file = &snapshot.files[i];
                rows.extend(visible_rows(
                    &self.root,
                    &snapshot.metadata.schema,
                    file,
                    snapshot.deletes_after(file.added_at),
                )?);
            }
            report.rows_rewritten += rows.len() as u64;

            let mut added = Vec::new();
            for chunk in rows.chunks(target_rows) {
                let meta = self.write_file(chunk)?;
                written.push(meta.clone());
                added.push(meta);
            }
            report.files_removed += run.len();
            report.files_added += added.len();
            actions.push(LogAction::Rewrite {
                removed: run.iter().map(|&i| snapshot.files[i].meta.path.clone()).collect(),
                added,
            });
        }
        Ok(actions)
    }

    /// Statistics of the latest snapshot
    pub fn stats(&self) -> Result<TableStats> {
        let snapshot = self.log.snapshot()?;
        Ok(TableStats {
            version: snapshot.version,
            active_files: snapshot.files.len(),
            active_bytes: snapshot.active_bytes(),
            stored_rows: snapshot.files.iter().map(|f| f.meta.row_count).sum(),
            delete_markers: snapshot.deletes.len(),
            tombstones: snapshot.tombstones.len(),
        })
    }

    /// Partition values present among active files
    pub fn partitions(&self) -> Result<Vec<BTreeMap<String, Value>>> {
        let snapshot = self.log.snapshot()?;
        let mut seen: Vec<BTreeMap<String, Value>> = Vec::new();
        for file in &snapshot.files {
            if !seen.contains(&file.meta.partition_values) {
                seen.push(file.meta.partition_values.clone());
            }
        }
        Ok(seen)
    }
}

fn record_id(record: &Record) -> Option<i64> {
    record.get(ID_COLUMN).and_then(Value::as_int)
}

/// Validate an entity name (also used as a directory and counter file name)
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("Name cannot be empty".to_string()));
    }

    if name.len() > 128 {
        return Err(Error::InvalidArgument(
            "Name cannot be longer than 128 characters".to_string(),
        ));
    }

    // Must start with letter or underscore
    let starts_well = name
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if !starts_well {
        return Err(Error::InvalidArgument(
            "Name must start with a letter or underscore".to_string(),
        ));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidArgument(
            "Name can only contain letters, numbers, and underscores".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{DataType, Field};
    use crate::storage::value::record;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("name", DataType::Utf8),
            Field::nullable("amount", DataType::Float64),
        ])
        .unwrap()
    }

    fn open_with(name: &str, options: TableOptions) -> Result<(PathBuf, Table)> {
        let root = std::env::temp_dir().join(format!("minidelta_{}_{}", name, uuid::Uuid::new_v4()));
        let sequences = Arc::new(SequenceAllocator::new(root.join("seq"))?);
        let table = Table::create_if_missing(
            root.join("items"),
            "items",
            schema(),
            vec![],
            sequences,
            options,
        )?;
        Ok((root, table))
    }

    fn open(name: &str) -> Result<(PathBuf, Table)> {
        open_with(name, TableOptions::default())
    }

    fn item(name: &str) -> Record {
        record([("name", name)])
    }

    fn ids(rows: &[Record]) -> Vec<i64> {
        rows.iter().filter_map(|r| r["id"].as_int()).collect()
    }

    #[test]
    fn test_insert_assigns_ids_and_round_trips() -> Result<()> {
        let (root, table) = open("table_insert")?;

        let first = table.insert(item("a"))?;
        let second = table.insert(record([("name", Value::from("b")), ("amount", 3.into())]))?;
        assert_eq!(first["id"], Value::Int(1));
        assert_eq!(second["id"], Value::Int(2));
        // Missing nullable column stored as null, int widened for float column
        assert_eq!(first["amount"], Value::Null);
        assert_eq!(second["amount"], Value::Float(3.0));

        assert_eq!(table.get(2)?, Some(second));
        assert_eq!(table.get(99)?, None);
        assert_eq!(table.version()?, 2);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_invalid_insert_writes_nothing() -> Result<()> {
        let (root, table) = open("table_invalid")?;

        let unknown = table.insert(record([("name", "a"), ("colour", "red")]));
        assert!(matches!(unknown, Err(Error::SchemaMismatch(_))));
        let missing = table.insert(record([("amount", 1.0)]));
        assert!(matches!(missing, Err(Error::SchemaMismatch(_))));
        let infinite = table.insert(record([
            ("name", Value::from("a")),
            ("amount", Value::Float(f64::INFINITY)),
        ]));
        assert!(matches!(infinite, Err(Error::SchemaMismatch(_))));

        // No id was burned and no commit made
        assert_eq!(table.insert(item("a"))?["id"], Value::Int(1));
        assert_eq!(table.version()?, 1);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    fn data_files(root: &Path) -> usize {
        fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(DATA_FILE_EXT))
            .count()
    }

    #[test]
    fn test_ids_committed_by_another_handle_are_seen() -> Result<()> {
        let (root, table) = open("table_recheck")?;
        let other = Table::create_if_missing(
            table.root().to_path_buf(),
            "items",
            schema(),
            vec![],
            Arc::clone(&table.sequences),
            TableOptions::default(),
        )?;

        let base = table.log.snapshot()?;
        other.insert(record([("id", Value::Int(5)), ("name", "five".into())]))?;
        let five = HashSet::from([5]);
        let latest = table.log.snapshot()?;
        assert_eq!(table.visible_ids_since(&latest, base.version, &five)?, vec![5]);
        // Already visible before `since`
        assert!(table.visible_ids_since(&latest, latest.version, &five)?.is_empty());

        // Hidden rows do not count
        other.delete(5)?;
        let latest = table.log.snapshot()?;
        assert!(table.visible_ids_since(&latest, base.version, &five)?.is_empty());

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_refused_append_leaves_no_files() -> Result<()> {
        let (root, table) = open("table_refused")?;
        table.insert(item("kept"))?;
        let version = table.version()?;
        let row = table.metadata.schema.conform(
            record([("id", Value::Int(2)), ("name", "dropped".into())]),
            false,
        )?;

        assert_eq!(table.append(std::slice::from_ref(&row), |_| Ok(false))?, None);
        let aborted = table.append(std::slice::from_ref(&row), |_| {
            Err(Error::Conflict("busy".to_string()))
        });
        assert!(matches!(aborted, Err(Error::Conflict(_))));

        assert_eq!(table.version()?, version);
        assert_eq!(data_files(table.root()), 1);
        assert_eq!(table.get(2)?, None);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_explicit_ids() -> Result<()> {
        let (root, table) = open("table_explicit")?;

        table.insert(record([("id", Value::Int(10)), ("name", "ten".into())]))?;
        assert_eq!(table.insert(item("next"))?["id"], Value::Int(11));

        let dup = table.insert(record([("id", Value::Int(10)), ("name", "again".into())]));
        assert!(matches!(dup, Err(Error::DuplicateId(10))));

        let batch = vec![
            record([("id", Value::Int(20)), ("name", "x".into())]),
            record([("id", Value::Int(20)), ("name", "y".into())]),
        ];
        assert!(matches!(table.insert_many(batch), Err(Error::DuplicateId(20))));

        // A deleted id may be reused explicitly
        assert!(table.delete(10)?);
        table.insert(record([("id", Value::Int(10)), ("name", "back".into())]))?;
        assert_eq!(table.get(10)?.unwrap()["name"], Value::from("back"));
        assert_eq!(table.insert(item("after"))?["id"], Value::Int(12));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_update_merges_and_keeps_id() -> Result<()> {
        let (root, table) = open("table_update")?;
        table.insert(record([("name", Value::from("a")), ("amount", 1.5.into())]))?;
        table.insert(item("b"))?;

        let updated = table
            .update(1, record([("name", Value::from("renamed")), ("id", 7.into())]))?
            .unwrap();
        assert_eq!(updated["id"], Value::Int(1));
        assert_eq!(updated["name"], Value::from("renamed"));
        assert_eq!(updated["amount"], Value::Float(1.5));
        assert_eq!(table.get(1)?, Some(updated));
        assert_eq!(table.get(7)?, None);
        assert_eq!(table.count(None)?, 2);

        assert_eq!(table.update(42, item("nobody"))?, None);
        let bad = table.update(1, record([("colour", "red")]));
        assert!(matches!(bad, Err(Error::SchemaMismatch(_))));
        // Updated record moves to the end of commit order
        assert_eq!(ids(&table.paginate(1, 10, None)?), vec![2, 1]);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_delete_missing_is_noop() -> Result<()> {
        let (root, table) = open("table_delete")?;
        table.insert(item("a"))?;
        let version = table.version()?;

        assert!(!table.delete(5)?);
        assert_eq!(table.version()?, version);
        assert!(table.delete(1)?);
        assert!(!table.delete(1)?);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_reopen_requires_same_schema() -> Result<()> {
        let (root, table) = open("table_reopen")?;
        table.insert(item("a"))?;
        let sequences = Arc::new(SequenceAllocator::new(root.join("seq"))?);

        let reopened = Table::create_if_missing(
            root.join("items"),
            "items",
            schema(),
            vec![],
            Arc::clone(&sequences),
            TableOptions::default(),
        )?;
        assert_eq!(reopened.count(None)?, 1);

        let other = Schema::new(vec![Field::new("id", DataType::Int64)])?;
        let mismatch = Table::create_if_missing(
            root.join("items"),
            "items",
            other,
            vec![],
            Arc::clone(&sequences),
            TableOptions::default(),
        );
        assert!(matches!(mismatch, Err(Error::SchemaMismatch(_))));

        let partitioned = Table::create_if_missing(
            root.join("items"),
            "items",
            schema(),
            vec!["name".to_string()],
            sequences,
            TableOptions::default(),
        );
        assert!(matches!(partitioned, Err(Error::SchemaMismatch(_))));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_vacuum_removes_dead_files() -> Result<()> {
        let (root, table) = open("table_vacuum")?;
        for name in ["a", "b", "c"] {
            table.insert(item(name))?;
        }
        table.delete(2)?;

        // Within retention the file is only tombstoned
        let report = table.vacuum(Duration::from_secs(3600))?;
        assert_eq!(report.files_tombstoned, 1);
        assert!(report.files_removed.is_empty());
        assert_eq!(table.stats()?.tombstones, 1);

        let report = table.vacuum(Duration::ZERO)?;
        assert_eq!(report.files_tombstoned, 0);
        assert_eq!(report.files_removed.len(), 1);
        assert!(report.bytes_freed > 0);

        assert_eq!(table.get(2)?, None);
        assert_eq!(ids(&table.paginate(1, 10, None)?), vec![1, 3]);
        let stats = table.stats()?;
        assert_eq!(stats.active_files, 2);
        // File 1 predates the delete, so its marker is still needed
        assert_eq!(stats.delete_markers, 1);

        // Nothing left to do
        assert_eq!(table.vacuum(Duration::ZERO)?, VacuumReport::default());

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_vacuum_removes_old_orphans_only() -> Result<()> {
        let options = TableOptions {
            orphan_grace: Duration::ZERO,
            ..TableOptions::default()
        };
        let (root, table) = open_with("table_orphans", options)?;
        table.insert(item("a"))?;

        let stray = table.root().join("part-stray.tmp");
        std::fs::write(&stray, b"half written").unwrap();
        let unrelated = table.root().join("notes.txt");
        std::fs::write(&unrelated, b"keep me").unwrap();

        // Within the retention horizon orphans are kept
        assert!(table.vacuum(Duration::from_secs(3600))?.files_removed.is_empty());
        assert!(stray.exists());

        let report = table.vacuum(Duration::ZERO)?;
        assert_eq!(report.files_removed, vec!["part-stray.tmp".to_string()]);
        assert!(!stray.exists());
        assert!(unrelated.exists());
        assert_eq!(table.count(None)?, 1);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_vacuum_cancelled() -> Result<()> {
        let (root, table) = open("table_vacuum_cancel")?;
        table.insert(item("a"))?;
        table.delete(1)?;

        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = table.vacuum_with(Duration::ZERO, Some(&cancel));
        assert!(matches!(result, Err(Error::Cancelled)));
        // Nothing was committed
        assert_eq!(table.stats()?.tombstones, 0);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_compact_rewrites_small_files() -> Result<()> {
        let (root, table) = open("table_compact")?;
        for name in ["a", "b", "c", "d", "e"] {
            table.insert(item(name))?;
        }
        table.delete(3)?;

        let report = table.compact(2)?;
        assert_eq!(report.files_removed, 5);
        assert_eq!(report.files_added, 2);
        assert_eq!(report.rows_rewritten, 4);
        assert_eq!(report.version, Some(7));

        assert_eq!(ids(&table.paginate(1, 10, None)?), vec![1, 2, 4, 5]);
        let stats = table.stats()?;
        assert_eq!(stats.active_files, 2);
        assert_eq!(stats.stored_rows, 4);
        assert_eq!(stats.delete_markers, 0);
        assert_eq!(stats.tombstones, 5);

        assert_eq!(table.vacuum(Duration::ZERO)?.files_removed.len(), 5);
        assert_eq!(table.count(None)?, 4);

        // Already compact
        assert_eq!(table.compact(2)?, CompactReport::default());
        assert!(matches!(table.compact(0), Err(Error::InvalidArgument(_))));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_partition_column_must_exist() -> Result<()> {
        let root = std::env::temp_dir().join(format!("minidelta_part_{}", uuid::Uuid::new_v4()));
        let sequences = Arc::new(SequenceAllocator::new(root.join("seq"))?);
        let result = Table::create_if_missing(
            root.join("items"),
            "items",
            schema(),
            vec!["missing".to_string()],
            sequences,
            TableOptions::default(),
        );
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("transactions").is_ok());
        assert!(validate_name("_private").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1table").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(&"a".repeat(129)).is_err());
    }
}
