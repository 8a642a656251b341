//! Storage layer
//!
//! # Architecture
//!
//! Every entity is a table: immutable data files plus an ordered commit log.
//! The logical content is a fold over the log.
//!
//! ```text
//! Store (data_dir)
//!   ├─→ SequenceAllocator   seq/<entity>.seq, shared by all tables
//!   └─→ Table               delta/<entity>/
//!        ├─→ CommitLog      _log/<version>.commit
//!        └─→ data files     [col=value/]part-<uuid>.mdf
//! ```
//!
//! ## Writes
//!
//! - **insert** writes a new data file and commits `Append`
//! - **delete** commits a `DeleteWhere` marker; no file changes
//! - **update** is a delete followed by an insert keeping the id
//! - **vacuum** tombstones dead files and deletes expired ones
//! - **compact** rewrites small files into larger ones
//!
//! ## Reads
//!
//! A [`Scanner`] reads one snapshot of the log, decoding one data file at a
//! time. Pagination stops reading as soon as the page is full.

pub mod codec;
pub mod compression;
pub mod data_file;
pub mod engine;
pub mod log;
pub mod predicate;
pub mod scan;
pub mod schema;
pub mod sequence;
pub mod store;
pub mod table;
pub mod value;

pub use compression::CompressionAlgorithm;
pub use engine::{BlockingStore, RecordStore, Storage};
pub use predicate::Predicate;
pub use scan::{CancelFlag, RecordBatch, ScanOptions, ScanStats, Scanner};
pub use schema::{DataType, Field, Schema, ID_COLUMN};
pub use sequence::SequenceAllocator;
pub use store::Store;
pub use table::{validate_name, CompactReport, Table, TableOptions, TableStats, VacuumReport};
pub use value::{record, Record, Value};
