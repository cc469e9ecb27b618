//! Destination tables.
//!
//! [`TableStore`] is the capability the loader needs from an analytical
//! store: create a table with a fixed layout, and append rows to it.
//! [`MemoryStore`] backs tests, [`SqliteStore`] is the embedded file
//! database, [`CsvDirStore`] and [`S3Store`] lay tables out as partitioned
//! CSV files locally or in a bucket.

mod csv_dir;
mod memory;
mod s3;
mod sqlite;

pub use csv_dir::CsvDirStore;
pub use memory::MemoryStore;
pub use s3::S3Store;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::IngestError;
use crate::partition::PartitionKey;
use crate::schema::{RowBatch, TableSchema};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {table} exists as [{found}], expected [{expected}]")]
    SchemaConflict {
        table: String,
        expected: String,
        found: String,
    },

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("object store: {0}")]
    Remote(String),

    #[error("store task failed: {0}")]
    Task(String),

    /// The caller stopped waiting; the write was rolled back.
    #[error("store call cancelled before commit")]
    Cancelled,
}

impl StoreError {
    /// Attaches the table being written; conflicts keep their own variant.
    pub fn into_ingest(self, table: &str) -> IngestError {
        match self {
            StoreError::SchemaConflict {
                table,
                expected,
                found,
            } => IngestError::SchemaConflict {
                table,
                expected,
                found,
            },
            other => IngestError::Load {
                table: table.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// One table's share of an append call.
#[derive(Debug, Clone, Copy)]
pub struct TableWrite<'a> {
    pub schema: &'a TableSchema,
    pub partition: Option<&'a PartitionKey>,
    pub batch: &'a RowBatch,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Short backend label for logs.
    fn name(&self) -> &'static str;

    /// Creates the table if missing. An existing table with the same layout
    /// is left alone; any other layout is a [`StoreError::SchemaConflict`].
    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError>;

    /// Appends the rows of every write, returning how many were written.
    /// Rows are validated by the caller. Existing rows are never touched.
    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: TableStore + ?Sized> TableStore for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        (**self).ensure_schema(schema).await
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        (**self).append(writes).await
    }
}

#[async_trait]
impl<T: TableStore + ?Sized> TableStore for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        (**self).ensure_schema(schema).await
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        (**self).append(writes).await
    }
}
