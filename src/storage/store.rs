//! Catalog of entity tables under one data directory
//!
//! ```text
//! <data_dir>/
//!   delta/<entity>/   one table per entity
//!   seq/<entity>.seq  id counters, shared by all tables
//! ```

use super::engine::{BlockingStore, Storage};
use super::schema::Schema;
use super::sequence::SequenceAllocator;
use super::table::{Table, TableOptions};
use crate::config::StoreConfig;
use crate::entities::Entity;
use crate::error::{Error, Result};
use std::fs;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Store {
    config: StoreConfig,
    sequences: Arc<SequenceAllocator>,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(config.tables_dir()).map_err(|e| {
            Error::StorageUnavailable(format!(
                "Failed to create data dir {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;
        let sequences = Arc::new(SequenceAllocator::new(config.sequences_dir())?);
        info!(data_dir = ?config.data_dir, "Opened store");
        Ok(Self { config, sequences })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn sequences(&self) -> &Arc<SequenceAllocator> {
        &self.sequences
    }

    /// Open (creating if needed) the table for `entity`
    pub fn table(&self, entity: &str, schema: Schema, partition_by: Vec<String>) -> Result<Table> {
        Table::create_if_missing(
            self.config.tables_dir().join(entity),
            entity,
            schema,
            partition_by,
            Arc::clone(&self.sequences),
            TableOptions::from(&self.config),
        )
    }

    /// Table of one of the application's entities
    pub fn entity(&self, entity: Entity) -> Result<Table> {
        self.table(entity.name(), entity.schema()?, entity.partition_by())
    }

    /// Async storage over an entity table
    pub fn storage(&self, entity: Entity) -> Result<Storage> {
        let table = self.entity(entity)?;
        Ok(Storage::new(Box::new(BlockingStore::new(
            table,
            self.config.export_channel_capacity,
        ))))
    }

    /// Entity tables that exist on disk
    pub fn existing(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(self.config.tables_dir())
            .map_err(|e| Error::StorageUnavailable(format!("Failed to list tables: {}", e)))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::StorageUnavailable(format!("Failed to list tables: {}", e)))?;
            if super::log::CommitLog::exists(entry.path()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
