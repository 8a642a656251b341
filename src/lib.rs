// minidelta - append-only typed table storage
// Immutable data files, an ordered commit log, logical deletes and vacuum

#![warn(rust_2018_idioms)]

pub mod config;
pub mod entities;
pub mod metrics;
pub mod storage;

// Re-exports for convenience
pub use config::StoreConfig;
pub use entities::Entity;
pub use storage::{
    Predicate, Record, RecordStore, ScanOptions, Schema, Storage, Store, Table, Value,
};

/// minidelta error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Schema mismatch: {0}")]
        SchemaMismatch(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Storage unavailable: {0}")]
        StorageUnavailable(String),

        #[error("Duplicate id: {0}")]
        DuplicateId(i64),

        #[error("Commit conflict: {0}")]
        Conflict(String),

        #[error("Operation cancelled")]
        Cancelled,

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(VERSION.split('.').count() >= 3);
    }
}
