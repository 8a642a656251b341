//! Streaming scans over a table snapshot
//!
//! A [`Scanner`] walks the active data files of one [`LogState`] in commit
//! order and yields visible records. Files are decoded one at a time: at
//! any moment the scanner holds at most one decoded batch. Before a file
//! is opened the scanner tries to skip it:
//!
//! - the filter cannot match (partition values, min/max statistics)
//! - a later delete marker covers every row of the file
//!
//! Rows of a decoded file are then dropped when a delete committed after
//! the file hides them, or when they fail the filter. Projection happens
//! last, so it never changes which rows match.

use super::data_file::read_rows;
use super::log::{ActiveFile, DeleteMarker, LogState};
use super::predicate::Predicate;
use super::schema::Schema;
use super::value::Record;
use crate::error::{Error, Result};
use crate::metrics;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cooperative cancellation shared between a caller and a long operation
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// What a scan returns
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Restrict returned columns; `None` returns all
    pub columns: Option<Vec<String>>,
    /// Only rows matching this filter
    pub predicate: Option<Predicate>,
    pub cancel: Option<CancelFlag>,
}

impl ScanOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Visible rows decoded from one data file
#[derive(Debug, Clone)]
pub struct RecordBatch {
    /// Data file the rows came from
    pub source: String,
    pub rows: Vec<Record>,
}

impl RecordBatch {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Work done by a scan so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_read: u64,
    pub files_pruned: u64,
    pub rows_scanned: u64,
}

/// Lazy, single-pass sequence of visible records
pub struct Scanner {
    root: PathBuf,
    snapshot: Arc<LogState>,
    predicate: Option<Predicate>,
    columns: Option<Vec<String>>,
    cancel: Option<CancelFlag>,
    next_file: usize,
    pending: std::vec::IntoIter<Record>,
    pending_source: String,
    stats: ScanStats,
    done: bool,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("version", &self.snapshot.version)
            .field("next_file", &self.next_file)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Scanner {
    /// Scan `snapshot`, whose data files live under `root`
    pub fn new(root: &Path, snapshot: Arc<LogState>, options: ScanOptions) -> Result<Self> {
        let schema = &snapshot.metadata.schema;
        if let Some(predicate) = &options.predicate {
            predicate.validate(schema)?;
        }
        if let Some(columns) = &options.columns {
            if let Some(unknown) = columns.iter().find(|c| schema.field(c).is_none()) {
                return Err(Error::InvalidArgument(format!(
                    "Unknown column '{}' in projection",
                    unknown
                )));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            snapshot,
            predicate: options.predicate,
            columns: options.columns,
            cancel: options.cancel,
            next_file: 0,
            pending: Vec::new().into_iter(),
            pending_source: String::new(),
            stats: ScanStats::default(),
            done: false,
        })
    }

    /// Commit version this scan reads
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Next non-empty batch of visible rows, `None` when the scan is over
    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.pending.len() > 0 {
            return Ok(Some(RecordBatch {
                source: std::mem::take(&mut self.pending_source),
                rows: self.pending.by_ref().collect(),
            }));
        }
        if self.done {
            return Ok(None);
        }

        let snapshot = Arc::clone(&self.snapshot);
        while self.next_file < snapshot.files.len() {
            if let Err(e) = self.check_cancel() {
                self.done = true;
                return Err(e);
            }

            let file = &snapshot.files[self.next_file];
            self.next_file += 1;

            let deletes = snapshot.deletes_after(file.added_at);
            if self.prunable(file, deletes) {
                self.stats.files_pruned += 1;
                metrics::FILES_PRUNED.inc();
                continue;
            }

            let rows = match self.decode(file, deletes, &snapshot.metadata.schema) {
                Ok(rows) => rows,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };
            if rows.is_empty() {
                continue;
            }

            let rows = match &self.columns {
                Some(columns) => rows
                    .into_iter()
                    .map(|mut row| {
                        row.retain(|k, _| columns.contains(k));
                        row
                    })
                    .collect(),
                None => rows,
            };
            return Ok(Some(RecordBatch {
                source: file.meta.path.clone(),
                rows,
            }));
        }

        self.done = true;
        debug!(
            version = snapshot.version,
            files_read = self.stats.files_read,
            files_pruned = self.stats.files_pruned,
            rows_scanned = self.stats.rows_scanned,
            "Scan complete"
        );
        Ok(None)
    }

    /// Number of visible matching rows in the rest of the scan.
    ///
    /// Files with no later delete markers are counted from their metadata
    /// when the scan has no filter.
    pub fn count(mut self) -> Result<u64> {
        let mut total = self.pending.len() as u64;
        self.pending = Vec::new().into_iter();

        let snapshot = Arc::clone(&self.snapshot);
        while self.next_file < snapshot.files.len() && !self.done {
            self.check_cancel()?;

            let file = &snapshot.files[self.next_file];
            self.next_file += 1;

            let deletes = snapshot.deletes_after(file.added_at);
            if self.predicate.is_none() && deletes.is_empty() {
                total += file.meta.row_count;
                continue;
            }
            if self.prunable(file, deletes) {
                self.stats.files_pruned += 1;
                metrics::FILES_PRUNED.inc();
                continue;
            }
            total += self.decode(file, deletes, &snapshot.metadata.schema)?.len() as u64;
        }
        self.done = true;
        Ok(total)
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) => cancel.check(),
            None => Ok(()),
        }
    }

    fn prunable(&self, file: &ActiveFile, deletes: &[DeleteMarker]) -> bool {
        if let Some(predicate) = &self.predicate {
            if !predicate.may_match(&file.meta) {
                return true;
            }
        }
        deletes.iter().any(|d| d.predicate.covers(&file.meta))
    }

    fn decode(
        &mut self,
        file: &ActiveFile,
        deletes: &[DeleteMarker],
        schema: &Schema,
    ) -> Result<Vec<Record>> {
        let rows = visible_rows(&self.root, schema, file, deletes)?;
        self.stats.files_read += 1;
        self.stats.rows_scanned += file.meta.row_count;
        metrics::FILES_READ.inc();
        metrics::ROWS_SCANNED.inc_by(file.meta.row_count);

        Ok(match &self.predicate {
            Some(predicate) => rows.into_iter().filter(|r| predicate.matches(r)).collect(),
            None => rows,
        })
    }
}

impl Iterator for Scanner {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.next() {
                return Some(Ok(record));
            }
            match self.next_batch() {
                Ok(Some(batch)) => {
                    self.pending_source = batch.source;
                    self.pending = batch.rows.into_iter();
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Rows of `file` not hidden by `deletes`, all columns
pub(crate) fn visible_rows(
    root: &Path,
    schema: &Schema,
    file: &ActiveFile,
    deletes: &[DeleteMarker],
) -> Result<Vec<Record>> {
    let names = schema.names();
    let rows = read_rows(root, &file.meta, schema)?;
    Ok(rows
        .into_iter()
        .map(|values| {
            names
                .iter()
                .map(|n| n.to_string())
                .zip(values)
                .collect::<Record>()
        })
        .filter(|record| !deletes.iter().any(|d| d.predicate.matches(record)))
        .collect())
}

/// Collect page `page` (1-based) of `size` rows, stopping the scan as soon
/// as the page is full.
pub fn collect_page(mut scanner: Scanner, page: usize, size: usize) -> Result<Vec<Record>> {
    if page < 1 || size < 1 {
        return Err(Error::InvalidArgument(
            "Page and size must be 1 or greater".to_string(),
        ));
    }
    let skip = (page - 1)
        .checked_mul(size)
        .ok_or_else(|| Error::InvalidArgument("Page offset overflows".to_string()))?;

    let mut seen = 0usize;
    let mut out = Vec::with_capacity(size.min(1024));
    for record in scanner.by_ref() {
        let record = record?;
        if seen >= skip {
            out.push(record);
            if out.len() == size {
                break;
            }
        }
        seen += 1;
    }
    debug!(page, size, files_read = scanner.stats().files_read, "Collected page");
    Ok(out)
}
