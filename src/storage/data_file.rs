//! Immutable data files
//!
//! Each append writes one self-describing data file:
//!
//! ```text
//! "MDF1"
//! [frame: header json]  codec, row_count, columns, partition_values
//! [frame: body]         (compressed) json array of rows, schema order
//! ```
//!
//! Files live under the table root, inside hive-style partition
//! directories when the table is partitioned:
//!
//! ```text
//! transactions/
//!   part-6f1c...mdf
//!   type=income/part-a9e2...mdf
//! ```
//!
//! A file is never modified after its rename into place. The commit log
//! carries a [`FileMeta`] for it, including per-column min/max statistics that
//! let scans skip the file without opening it.

use super::codec::{read_frame, write_frame};
use super::compression::CompressionAlgorithm;
use super::schema::Schema;
use super::value::{Record, Value};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 4] = b"MDF1";

/// Extension of committed data files
pub const DATA_FILE_EXT: &str = "mdf";

/// Extension of files still being written
pub const TEMP_FILE_EXT: &str = "tmp";

/// Min/max/null statistics of one column within one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
}

impl ColumnStats {
    fn observe(&mut self, value: &Value) {
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        let lower = match &self.min {
            Some(min) => value.total_cmp(min).is_lt(),
            None => true,
        };
        if lower {
            self.min = Some(value.clone());
        }
        let higher = match &self.max {
            Some(max) => value.total_cmp(max).is_gt(),
            None => true,
        };
        if higher {
            self.max = Some(value.clone());
        }
    }
}

/// Log-side description of a committed data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Path relative to the table root, `/`-separated
    pub path: String,
    pub size_bytes: u64,
    pub row_count: u64,
    #[serde(default)]
    pub partition_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub stats: BTreeMap<String, ColumnStats>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataFileHeader {
    codec: CompressionAlgorithm,
    row_count: u64,
    columns: Vec<String>,
    partition_values: BTreeMap<String, Value>,
}

/// Data file writer settings
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub codec: CompressionAlgorithm,
    pub level: i32,
}

/// Write `rows` (already conformed to `schema`) as a new data file.
///
/// All rows must share the values of the `partition_by` columns.
pub fn write_data_file(
    root: &Path,
    schema: &Schema,
    partition_by: &[String],
    rows: &[Record],
    options: WriteOptions,
) -> Result<FileMeta> {
    let first = rows
        .first()
        .ok_or_else(|| Error::InvalidArgument("Cannot write an empty data file".to_string()))?;

    let partition_values: BTreeMap<String, Value> = partition_by
        .iter()
        .map(|col| (col.clone(), first.get(col).cloned().unwrap_or(Value::Null)))
        .collect();
    for row in rows {
        for (col, value) in &partition_values {
            if row.get(col).unwrap_or(&Value::Null) != value {
                return Err(Error::InvalidArgument(format!(
                    "Rows span several values of partition column '{}'",
                    col
                )));
            }
        }
    }

    let mut stats: BTreeMap<String, ColumnStats> = BTreeMap::new();
    let mut body_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let values = schema.row_of(row);
        for (field, value) in schema.fields().iter().zip(&values) {
            stats.entry(field.name.clone()).or_default().observe(value);
        }
        body_rows.push(values);
    }

    let header = DataFileHeader {
        codec: options.codec,
        row_count: rows.len() as u64,
        columns: schema.names().into_iter().map(String::from).collect(),
        partition_values: partition_values.clone(),
    };
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to serialize header: {}", e)))?;
    let body_json = serde_json::to_vec(&body_rows)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to serialize rows: {}", e)))?;
    let body = options.codec.compress(&body_json, options.level)?;

    let mut bytes = Vec::with_capacity(MAGIC.len() + header_json.len() + body.len() + 16);
    bytes.extend_from_slice(MAGIC);
    write_frame(&mut bytes, &header_json)?;
    write_frame(&mut bytes, &body)?;

    let dir = partition_dir(&partition_values);
    let name = format!("part-{}.{}", uuid::Uuid::new_v4().simple(), DATA_FILE_EXT);
    let rel_path = if dir.is_empty() { name } else { format!("{}/{}", dir, name) };

    let final_path = root.join(&rel_path);
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::StorageUnavailable(format!("Failed to create partition dir: {}", e))
        })?;
    }
    let temp_path = final_path.with_extension(TEMP_FILE_EXT);

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to create data file: {}", e)))?;
    file.write_all(&bytes)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to write data file: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::StorageUnavailable(format!("Failed to sync data file: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, &final_path)
        .map_err(|e| Error::StorageUnavailable(format!("Failed to publish data file: {}", e)))?;

    debug!(path = %rel_path, rows = rows.len(), bytes = bytes.len(), "Wrote data file");

    Ok(FileMeta {
        path: rel_path,
        size_bytes: bytes.len() as u64,
        row_count: rows.len() as u64,
        partition_values,
        stats,
    })
}

/// Read every row of a data file, in schema column order.
///
/// The file handle is closed before this returns.
pub fn read_rows(root: &Path, meta: &FileMeta, schema: &Schema) -> Result<Vec<Vec<Value>>> {
    let path = root.join(&meta.path);
    let bytes = fs::read(&path).map_err(|e| {
        Error::StorageUnavailable(format!("Failed to read data file {}: {}", meta.path, e))
    })?;

    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::StorageUnavailable(format!(
            "Not a data file: {}",
            meta.path
        )));
    }
    let rest = &bytes[MAGIC.len()..];
    let (header_json, used) = read_frame(rest)?;
    let (body, _) = read_frame(&rest[used..])?;

    let header: DataFileHeader = serde_json::from_slice(header_json)
        .map_err(|e| Error::StorageUnavailable(format!("Corrupt data file header: {}", e)))?;
    if header.columns.iter().map(String::as_str).ne(schema.names()) {
        return Err(Error::StorageUnavailable(format!(
            "Data file {} does not match the table schema",
            meta.path
        )));
    }

    let body_json = header.codec.decompress(body)?;
    let rows: Vec<Vec<Value>> = serde_json::from_slice(&body_json)
        .map_err(|e| Error::StorageUnavailable(format!("Corrupt data file body: {}", e)))?;
    if rows.len() as u64 != header.row_count {
        return Err(Error::StorageUnavailable(format!(
            "Data file {} holds {} rows, header says {}",
            meta.path,
            rows.len(),
            header.row_count
        )));
    }
    Ok(rows)
}

/// Relative directory for a set of partition values, e.g. `type=income`
fn partition_dir(values: &BTreeMap<String, Value>) -> String {
    values
        .iter()
        .map(|(col, value)| {
            let text = match value {
                Value::Null => "__null__".to_string(),
                v => escape(&v.to_string()),
            };
            format!("{}={}", col, text)
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for b in text.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{DataType, Field};
    use crate::storage::value::record;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("kind", DataType::Utf8),
            Field::new("amount", DataType::Float64),
        ])
        .unwrap()
    }

    fn temp_root(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("minidelta_{}_{}", name, uuid::Uuid::new_v4()))
    }

    const OPTS: WriteOptions = WriteOptions {
        codec: CompressionAlgorithm::Zstd,
        level: 3,
    };

    #[test]
    fn test_write_and_read_rows() -> Result<()> {
        let root = temp_root("datafile");
        let rows = vec![
            record([("id", Value::Int(3)), ("kind", "out".into()), ("amount", 9.5.into())]),
            record([("id", Value::Int(1)), ("kind", "in".into()), ("amount", 20.0.into())]),
        ];
        let meta = write_data_file(&root, &schema(), &[], &rows, OPTS)?;

        assert_eq!(meta.row_count, 2);
        assert!(meta.path.ends_with(".mdf"));
        let id_stats = &meta.stats["id"];
        assert_eq!(id_stats.min, Some(Value::Int(1)));
        assert_eq!(id_stats.max, Some(Value::Int(3)));

        let read = read_rows(&root, &meta, &schema())?;
        assert_eq!(read.len(), 2);
        assert_eq!(read[0][0], Value::Int(3));
        assert_eq!(read[1][1], Value::from("in"));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_partitioned_layout() -> Result<()> {
        let root = temp_root("datafile_part");
        let rows =
            vec![record([("id", Value::Int(1)), ("kind", "a/b c".into()), ("amount", 1.0.into())])];
        let meta = write_data_file(&root, &schema(), &["kind".to_string()], &rows, OPTS)?;

        assert!(meta.path.starts_with("kind=a%2Fb%20c/"));
        assert_eq!(meta.partition_values["kind"], Value::from("a/b c"));
        assert!(root.join(&meta.path).exists());

        let mixed = vec![
            record([("id", Value::Int(1)), ("kind", "x".into()), ("amount", 1.0.into())]),
            record([("id", Value::Int(2)), ("kind", "y".into()), ("amount", 1.0.into())]),
        ];
        assert!(write_data_file(&root, &schema(), &["kind".to_string()], &mixed, OPTS).is_err());

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[test]
    fn test_corrupted_file_rejected() -> Result<()> {
        let root = temp_root("datafile_corrupt");
        let rows =
            vec![record([("id", Value::Int(1)), ("kind", "x".into()), ("amount", 1.0.into())])];
        let meta = write_data_file(&root, &schema(), &[], &rows, OPTS)?;

        let path = root.join(&meta.path);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x5a;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_rows(&root, &meta, &schema()),
            Err(Error::StorageUnavailable(_))
        ));

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }
}
