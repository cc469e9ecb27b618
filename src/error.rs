//! Error taxonomy for the extract/load core.

use std::time::Duration;

use thiserror::Error;

/// Every way a tick can fail. None of these are retried inside the crate;
/// the caller (scheduler, poll loop) decides what to do next.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A trip in the batch lacks a field the snapshot table requires.
    /// The whole batch is rejected.
    #[error("malformed trip {trip_id}: missing {field}")]
    MalformedRecord { trip_id: String, field: String },

    /// The destination table exists with a different column layout.
    #[error("schema conflict on table {table}: expected [{expected}], found [{found}]")]
    SchemaConflict {
        table: String,
        expected: String,
        found: String,
    },

    /// A row batch does not match the declared table schema.
    #[error("row shape mismatch for table {table}: {detail}")]
    RowShape { table: String, detail: String },

    /// The destination rejected or could not be reached for a write.
    #[error("load into {table} failed: {message}")]
    Load { table: String, message: String },

    /// A store call exceeded the configured deadline.
    #[error("load into {table} timed out after {timeout:?}")]
    LoadTimeout { table: String, timeout: Duration },

    /// The feed source could not produce a snapshot for this tick.
    #[error("feed {source_id} unavailable: {reason}")]
    FeedUnavailable { source_id: String, reason: String },

    /// Static schedule archive could not be read.
    #[error("static schedule error: {0}")]
    StaticData(String),

    /// Invalid configuration (unknown column, bad store settings, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    pub fn feed_unavailable(source_id: &str, reason: impl ToString) -> Self {
        Self::FeedUnavailable {
            source_id: source_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// `true` for failures an orchestrator may reasonably retry on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Load { .. } | Self::LoadTimeout { .. } | Self::FeedUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_record_message_names_trip_and_field() {
        let err = IngestError::MalformedRecord {
            trip_id: "021150_1..N03R".to_string(),
            field: "route_id".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("021150_1..N03R"));
        assert!(msg.contains("route_id"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(IngestError::feed_unavailable("A", "timeout").is_retryable());
        assert!(
            IngestError::LoadTimeout {
                table: "raw_trips".into(),
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(
            !IngestError::SchemaConflict {
                table: "raw_trips".into(),
                expected: String::new(),
                found: String::new()
            }
            .is_retryable()
        );
    }
}
