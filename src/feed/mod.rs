//! Where trips come from.
//!
//! A [`FeedSource`] turns a source identifier (an NYCT line-group code such
//! as `"A"` or `"SIR"`) into a batch of [`Trip`]s and the instant the feed
//! says it was generated.

pub mod nyct;

pub use nyct::NyctFeed;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::model::Trip;

/// One poll of one source.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub source_id: String,
    pub trips: Vec<Trip>,
    /// Generation time stated by the feed, shared by every row of the poll.
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetches and decodes the current feed for `source_id`.
    ///
    /// Any fetch or decode failure is [`IngestError::FeedUnavailable`].
    async fn pull(&self, source_id: &str) -> Result<FeedSnapshot, IngestError>;
}

#[async_trait]
impl<T: FeedSource + ?Sized> FeedSource for Arc<T> {
    async fn pull(&self, source_id: &str) -> Result<FeedSnapshot, IngestError> {
        (**self).pull(source_id).await
    }
}
