//! Async record store trait
//!
//! The table engine does blocking file I/O. [`BlockingStore`] moves every call
//! onto tokio's blocking pool so async callers never stall a runtime worker.

use super::predicate::Predicate;
use super::table::{CompactReport, Table, TableStats, VacuumReport};
use super::value::Record;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Record operations of one entity table
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name of the entity the store serves
    fn entity(&self) -> &str;

    async fn insert(&self, record: Record) -> Result<Record>;
    async fn get(&self, id: i64) -> Result<Option<Record>>;
    async fn update(&self, id: i64, patch: Record) -> Result<Option<Record>>;
    async fn delete(&self, id: i64) -> Result<bool>;

    /// One page (1-based) of matching records in commit order
    async fn paginate(
        &self,
        page: usize,
        size: usize,
        predicate: Option<Predicate>,
    ) -> Result<Vec<Record>>;

    async fn count(&self, predicate: Option<Predicate>) -> Result<u64>;

    /// Stream every visible record. Dropping the receiver stops the scan.
    async fn export(&self) -> Result<mpsc::Receiver<Result<Record>>>;

    async fn vacuum(&self, retention: Duration) -> Result<VacuumReport>;
    async fn compact(&self, target_rows: usize) -> Result<CompactReport>;
    async fn stats(&self) -> Result<TableStats>;
}

/// [`RecordStore`] over a [`Table`], run on the blocking thread pool
#[derive(Debug, Clone)]
pub struct BlockingStore {
    table: Arc<Table>,
    export_capacity: usize,
}

impl BlockingStore {
    pub fn new(table: Table, export_capacity: usize) -> Self {
        Self {
            table: Arc::new(table),
            export_capacity: export_capacity.max(1),
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Table) -> Result<T> + Send + 'static,
    {
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || op(&table))
            .await
            .map_err(|e| Error::Internal(format!("Blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl RecordStore for BlockingStore {
    fn entity(&self) -> &str {
        self.table.entity()
    }

    async fn insert(&self, record: Record) -> Result<Record> {
        self.run(move |t| t.insert(record)).await
    }

    async fn get(&self, id: i64) -> Result<Option<Record>> {
        self.run(move |t| t.get(id)).await
    }

    async fn update(&self, id: i64, patch: Record) -> Result<Option<Record>> {
        self.run(move |t| t.update(id, patch)).await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.run(move |t| t.delete(id)).await
    }

    async fn paginate(
        &self,
        page: usize,
        size: usize,
        predicate: Option<Predicate>,
    ) -> Result<Vec<Record>> {
        self.run(move |t| t.paginate(page, size, predicate)).await
    }

    async fn count(&self, predicate: Option<Predicate>) -> Result<u64> {
        self.run(move |t| t.count(predicate)).await
    }

    async fn export(&self) -> Result<mpsc::Receiver<Result<Record>>> {
        // Open the scanner up front so snapshot errors surface here
        let scanner = self.run(|t| t.export()).await?;
        let entity = self.table.entity().to_string();
        let (tx, rx) = mpsc::channel(self.export_capacity);

        tokio::task::spawn_blocking(move || {
            let mut sent = 0u64;
            for item in scanner {
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() {
                    debug!(entity = %entity, sent, "Export receiver dropped");
                    return;
                }
                if failed {
                    return;
                }
                sent += 1;
            }
            debug!(entity = %entity, sent, "Export finished");
        });
        Ok(rx)
    }

    async fn vacuum(&self, retention: Duration) -> Result<VacuumReport> {
        self.run(move |t| t.vacuum(retention)).await
    }

    async fn compact(&self, target_rows: usize) -> Result<CompactReport> {
        self.run(move |t| t.compact(target_rows)).await
    }

    async fn stats(&self) -> Result<TableStats> {
        self.run(|t| t.stats()).await
    }
}

/// Main storage interface
pub struct Storage {
    engine: Box<dyn RecordStore>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("entity", &self.engine.entity())
            .finish()
    }
}

impl Storage {
    pub fn new(engine: Box<dyn RecordStore>) -> Self {
        Self { engine }
    }

    pub fn entity(&self) -> &str {
        self.engine.entity()
    }

    pub async fn insert(&self, record: Record) -> Result<Record> {
        self.engine.insert(record).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Record>> {
        self.engine.get(id).await
    }

    pub async fn update(&self, id: i64, patch: Record) -> Result<Option<Record>> {
        self.engine.update(id, patch).await
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        self.engine.delete(id).await
    }

    pub async fn paginate(
        &self,
        page: usize,
        size: usize,
        predicate: Option<Predicate>,
    ) -> Result<Vec<Record>> {
        self.engine.paginate(page, size, predicate).await
    }

    pub async fn count(&self, predicate: Option<Predicate>) -> Result<u64> {
        self.engine.count(predicate).await
    }

    pub async fn export(&self) -> Result<mpsc::Receiver<Result<Record>>> {
        self.engine.export().await
    }

    pub async fn vacuum(&self, retention: Duration) -> Result<VacuumReport> {
        self.engine.vacuum(retention).await
    }

    pub async fn compact(&self, target_rows: usize) -> Result<CompactReport> {
        self.engine.compact(target_rows).await
    }

    pub async fn stats(&self) -> Result<TableStats> {
        self.engine.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{DataType, Field, Schema};
    use crate::storage::sequence::SequenceAllocator;
    use crate::storage::table::TableOptions;
    use crate::storage::value::{record, Value};

    fn open(name: &str) -> Result<(std::path::PathBuf, Storage)> {
        let root = std::env::temp_dir().join(format!("minidelta_{}_{}", name, uuid::Uuid::new_v4()));
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("name", DataType::Utf8),
        ])?;
        let sequences = Arc::new(SequenceAllocator::new(root.join("seq"))?);
        let table = Table::create_if_missing(
            root.join("delta/users"),
            "users",
            schema,
            vec![],
            sequences,
            TableOptions::default(),
        )?;
        Ok((root, Storage::new(Box::new(BlockingStore::new(table, 4)))))
    }

    #[tokio::test]
    async fn test_async_crud() -> Result<()> {
        let (root, storage) = open("engine_crud")?;

        let stored = storage.insert(record([("name", "ada")])).await?;
        assert_eq!(stored["id"], Value::Int(1));
        assert_eq!(storage.get(1).await?, Some(stored));

        let updated = storage.update(1, record([("name", "grace")])).await?;
        assert_eq!(updated.unwrap()["name"], Value::from("grace"));
        assert!(storage.delete(1).await?);
        assert!(!storage.delete(1).await?);
        assert_eq!(storage.count(None).await?, 0);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_export_streams_through_small_channel() -> Result<()> {
        let (root, storage) = open("engine_export")?;
        for i in 0..10 {
            storage
                .insert(record([("name", format!("user{}", i))]))
                .await?;
        }

        let mut rx = storage.export().await?;
        let mut ids = Vec::new();
        while let Some(row) = rx.recv().await {
            ids.push(row?["id"].as_int().unwrap());
        }
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());

        // Dropping the receiver early must not hang the worker
        let mut rx = storage.export().await?;
        assert!(rx.recv().await.is_some());
        drop(rx);

        std::fs::remove_dir_all(root).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_page_is_rejected() -> Result<()> {
        let (root, storage) = open("engine_page")?;
        assert!(matches!(
            storage.paginate(0, 10, None).await,
            Err(Error::InvalidArgument(_))
        ));
        std::fs::remove_dir_all(root).ok();
        Ok(())
    }
}
