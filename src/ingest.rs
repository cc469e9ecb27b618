//! One tick: pull a feed, flatten it, append it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, warn};

use crate::error::IngestError;
use crate::extract::Extractor;
use crate::feed::FeedSource;
use crate::loader::{LoadSummary, Loader};
use crate::partition::{PartitionKey, PartitionWindow};
use crate::store::TableStore;

/// Outcome of a successful tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub source_id: String,
    pub observed_at: DateTime<Utc>,
    pub partition: PartitionKey,
    pub trips: usize,
    pub loaded: LoadSummary,
}

/// Wires a feed source, an extractor and a loader together. Ticks share
/// nothing but the destination tables.
pub struct Ingestor<F, S> {
    feed: F,
    extractor: Extractor,
    loader: Loader<S>,
    window: PartitionWindow,
}

impl<F: FeedSource, S: TableStore> Ingestor<F, S> {
    pub fn new(feed: F, extractor: Extractor, loader: Loader<S>, window: PartitionWindow) -> Self {
        Self {
            feed,
            extractor,
            loader,
            window,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn loader(&self) -> &Loader<S> {
        &self.loader
    }

    /// Ensures both destination tables exist with the configured layout.
    pub async fn prepare(&self) -> Result<(), IngestError> {
        self.loader
            .ensure_schema(self.extractor.snapshot_schema())
            .await?;
        self.loader
            .ensure_schema(self.extractor.boundary_schema())
            .await
    }

    /// Runs one extract/load cycle for `source_id`. Any failure aborts the
    /// tick before or during the single append call, so the tables receive
    /// either all of the tick's rows or none.
    #[tracing::instrument(skip(self))]
    pub async fn run_tick(&self, source_id: &str) -> Result<TickReport, IngestError> {
        let snapshot = self.feed.pull(source_id).await?;
        let extraction = self
            .extractor
            .extract(&snapshot.trips, snapshot.generated_at)?;
        let partition = self.window.partition_for(snapshot.generated_at);

        if snapshot.trips.is_empty() {
            warn!(%partition, "Feed returned no trips");
        }

        let loaded = self
            .loader
            .load(&self.extractor, &extraction, Some(&partition))
            .await?;

        Ok(TickReport {
            source_id: source_id.to_string(),
            observed_at: snapshot.generated_at,
            partition,
            trips: snapshot.trips.len(),
            loaded,
        })
    }
}

impl<F, S> Ingestor<F, S>
where
    F: FeedSource + 'static,
    S: TableStore + 'static,
{
    /// Runs one tick per source, at most `concurrency` at a time. Results
    /// come back in `sources` order; a failed tick does not affect others.
    pub async fn run_sources(
        self: &Arc<Self>,
        sources: &[String],
        concurrency: usize,
    ) -> Vec<(String, Result<TickReport, IngestError>)> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = Vec::with_capacity(sources.len());

        for source_id in sources {
            let sem = semaphore.clone();
            let ingestor = Arc::clone(self);
            let source = source_id.clone();
            let span = tracing::info_span!("tick", source_id = %source);

            tasks.push((
                source_id.clone(),
                tokio::spawn(
                    async move {
                        let _permit = sem.acquire_owned().await.ok();
                        ingestor.run_tick(&source).await
                    }
                    .instrument(span),
                ),
            ));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (source_id, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(IngestError::feed_unavailable(&source_id, format!("tick task aborted: {e}"))),
            };
            match &result {
                Ok(report) => info!(
                    source_id = %source_id,
                    partition = %report.partition,
                    trips = report.trips,
                    snapshot_rows = report.loaded.snapshot_rows,
                    boundary_rows = report.loaded.boundary_rows,
                    "Tick complete"
                ),
                Err(e) => error!(source_id = %source_id, error = %e, retryable = e.is_retryable(), "Tick failed"),
            }
            results.push((source_id, result));
        }
        results
    }
}
