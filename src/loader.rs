//! Appends extracted rows to their destination tables.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::IngestError;
use crate::extract::{Extraction, Extractor};
use crate::partition::PartitionKey;
use crate::schema::{RowBatch, TableSchema};
use crate::store::{StoreError, TableStore, TableWrite};

/// Rows written by one [`Loader::load`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub snapshot_rows: u64,
    pub boundary_rows: u64,
}

/// Validates row shape, enforces the call deadline and maps store failures
/// onto [`IngestError`]. Nothing is retried here.
pub struct Loader<S> {
    store: S,
    timeout: Duration,
}

impl<S: TableStore> Loader<S> {
    pub fn new(store: S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deadline<T>(
        &self,
        table: &str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, IngestError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| e.into_ingest(table)),
            Err(_) => Err(IngestError::LoadTimeout {
                table: table.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Creates `schema.name` with exactly the declared columns if it does
    /// not exist. Repeating the call is a no-op; a differing existing
    /// layout is [`IngestError::SchemaConflict`].
    #[tracing::instrument(skip_all, fields(table = %schema.name, store = self.store.name()))]
    pub async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), IngestError> {
        self.deadline(&schema.name, self.store.ensure_schema(schema))
            .await?;
        debug!("Table schema ensured");
        Ok(())
    }

    /// Appends `batch` to `schema.name`. See [`Loader::append_all`].
    pub async fn append(
        &self,
        schema: &TableSchema,
        partition: Option<&PartitionKey>,
        batch: &RowBatch,
    ) -> Result<u64, IngestError> {
        self.append_all(&[TableWrite {
            schema,
            partition,
            batch,
        }])
        .await
    }

    /// Appends several batches in one store call.
    ///
    /// Every batch is checked against its schema first; a mismatch is
    /// [`IngestError::RowShape`] and nothing is written.
    pub async fn append_all(&self, writes: &[TableWrite<'_>]) -> Result<u64, IngestError> {
        for write in writes {
            write.schema.validate(write.batch)?;
        }

        if writes.iter().all(|w| w.batch.is_empty()) {
            debug!("Nothing to append");
            return Ok(0);
        }

        let tables = writes
            .iter()
            .map(|w| w.schema.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.deadline(&tables, self.store.append(writes)).await
    }

    /// Writes both tables of one tick in a single append call.
    #[tracing::instrument(
        skip_all,
        fields(
            store = self.store.name(),
            partition = partition.map(|p| p.to_string()),
            snapshots = extraction.snapshot_batch.len(),
            boundaries = extraction.boundary_batch.len(),
        )
    )]
    pub async fn load(
        &self,
        extractor: &Extractor,
        extraction: &Extraction,
        partition: Option<&PartitionKey>,
    ) -> Result<LoadSummary, IngestError> {
        let writes = [
            TableWrite {
                schema: extractor.snapshot_schema(),
                partition,
                batch: &extraction.snapshot_batch,
            },
            TableWrite {
                schema: extractor.boundary_schema(),
                partition,
                batch: &extraction.boundary_batch,
            },
        ];
        self.append_all(&writes).await?;

        let summary = LoadSummary {
            snapshot_rows: extraction.snapshot_batch.len() as u64,
            boundary_rows: extraction.boundary_batch.len() as u64,
        };
        info!(
            snapshot_rows = summary.snapshot_rows,
            boundary_rows = summary.boundary_rows,
            "Tick loaded"
        );
        Ok(summary)
    }
}
