//! Runtime configuration.
//!
//! Stored as a JSON object on disk; every field is optional and falls back
//! to the defaults below:
//!
//! ```json
//! {
//!   "sources": ["1", "A", "B", "G", "J", "L", "N", "SIR"],
//!   "partition_minutes": 5,
//!   "load_timeout_secs": 15.0,
//!   "store": { "kind": "sqlite", "path": "mta.sqlite" }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::extract::Extractor;
use crate::feed::nyct::{DEFAULT_SOURCES, MTA_FEED_BASE_URL};
use crate::partition::PartitionWindow;
use crate::schema::TableSchema;
use crate::store::{CsvDirStore, S3Store, SqliteStore, TableStore};

pub const DEFAULT_STATIC_URL: &str = "https://rrgtfsfeeds.s3.amazonaws.com/gtfs_subway.zip";

/// Destination backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite {
        path: PathBuf,
    },
    Csv {
        dir: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        gzip: bool,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: PathBuf::from("mta.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Source identifiers polled each tick.
    pub sources: Vec<String>,
    pub feed_base_url: String,
    /// Environment variable holding an optional `x-api-key` for the feeds.
    pub api_key_env: String,
    pub fetch_timeout_secs: u64,
    pub partition_start: DateTime<Utc>,
    pub partition_minutes: u32,
    /// Deadline for each `ensure_schema`/`append` store call.
    pub load_timeout_secs: f64,
    /// Maximum ticks in flight at once.
    pub concurrency: usize,
    /// Whether the snapshot table carries `headsign_text`.
    pub include_headsign: bool,
    pub trips_table: String,
    pub updates_table: String,
    pub static_url: String,
    /// Destination table name -> member file in the static archive.
    pub static_tables: BTreeMap<String, String>,
    /// Load `stops.txt` before polling to fill stop names and headsigns.
    pub resolve_stop_names: bool,
    pub store: StoreConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources: DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
            feed_base_url: MTA_FEED_BASE_URL.to_string(),
            api_key_env: "MTA_API_KEY".to_string(),
            fetch_timeout_secs: 30,
            partition_start: Utc
                .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            partition_minutes: 5,
            load_timeout_secs: 15.0,
            concurrency: 4,
            include_headsign: true,
            trips_table: "raw_trips".to_string(),
            updates_table: "raw_stop_time_updates".to_string(),
            static_url: DEFAULT_STATIC_URL.to_string(),
            static_tables: BTreeMap::from([
                ("raw_stops".to_string(), "stops.txt".to_string()),
                ("raw_stop_times".to_string(), "stop_times.txt".to_string()),
            ]),
            resolve_stop_names: true,
            store: StoreConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Loads and validates the config at `path`.
    pub fn load(path: &str) -> Result<Self, IngestError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("{path}: {e}")))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, IngestError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        let invalid = |msg: &str| Err(IngestError::Config(msg.to_string()));

        if self.sources.is_empty() {
            return invalid("at least one source is required");
        }
        if self.partition_minutes == 0 {
            return invalid("partition_minutes must be positive");
        }
        if !(self.load_timeout_secs.is_finite() && self.load_timeout_secs > 0.0) {
            return invalid("load_timeout_secs must be a positive number");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be positive");
        }
        if self.trips_table == self.updates_table {
            return invalid("trips_table and updates_table must differ");
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.load_timeout_secs).unwrap_or(Duration::from_secs(15))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn partition_window(&self) -> Result<PartitionWindow, IngestError> {
        PartitionWindow::new(self.partition_start, self.partition_minutes)
            .ok_or_else(|| IngestError::Config("partition_minutes must be positive".to_string()))
    }

    pub fn trips_schema(&self) -> TableSchema {
        TableSchema::trip_snapshots(&self.trips_table, self.include_headsign)
    }

    pub fn updates_schema(&self) -> TableSchema {
        TableSchema::boundary_updates(&self.updates_table)
    }

    pub fn extractor(&self) -> Result<Extractor, IngestError> {
        Extractor::new(self.trips_schema(), self.updates_schema())
    }

    /// Opens the configured backend. S3 credentials come from the ambient
    /// AWS environment.
    pub async fn open_store(&self) -> Box<dyn TableStore> {
        match &self.store {
            StoreConfig::Sqlite { path } => {
                Box::new(SqliteStore::new(path).with_busy_timeout(self.load_timeout()))
            }
            StoreConfig::Csv { dir } => Box::new(CsvDirStore::new(dir)),
            StoreConfig::S3 {
                bucket,
                prefix,
                gzip,
            } => Box::new(S3Store::from_env(bucket, prefix, *gzip).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = IngestConfig::from_json("{}").unwrap();
        assert_eq!(config.sources, ["1", "A", "B", "G", "J", "L", "N", "SIR"]);
        assert_eq!(config.partition_minutes, 5);
        assert_eq!(config.load_timeout(), Duration::from_secs(15));
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(config.static_tables["raw_stops"], "stops.txt");
        assert_eq!(config.trips_schema().columns.len(), 15);
    }

    #[test]
    fn test_store_variants() {
        let config = IngestConfig::from_json(
            r#"{"store": {"kind": "s3", "bucket": "delays", "prefix": "raw", "gzip": true}}"#,
        )
        .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::S3 {
                bucket: "delays".to_string(),
                prefix: "raw".to_string(),
                gzip: true
            }
        );

        let config = IngestConfig::from_json(r#"{"store": {"kind": "csv", "dir": "tables"}}"#).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Csv {
                dir: PathBuf::from("tables")
            }
        );
    }

    #[test]
    fn test_headsign_toggle_changes_schema() {
        let config = IngestConfig::from_json(r#"{"include_headsign": false}"#).unwrap();
        assert_eq!(config.trips_schema().columns.len(), 14);
        assert!(config.extractor().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{"sources": []}"#,
            r#"{"partition_minutes": 0}"#,
            r#"{"load_timeout_secs": -1.0}"#,
            r#"{"concurrency": 0}"#,
            r#"{"trips_table": "t", "updates_table": "t"}"#,
            r#"{"store": {"kind": "duckdb"}}"#,
        ] {
            assert!(
                matches!(IngestConfig::from_json(json), Err(IngestError::Config(_))),
                "{json}"
            );
        }
    }

    #[test]
    fn test_partition_start_parses_rfc3339() {
        let config =
            IngestConfig::from_json(r#"{"partition_start": "2026-02-01T00:00:00Z", "partition_minutes": 15}"#)
                .unwrap();
        let key = config
            .partition_window()
            .unwrap()
            .partition_for(Utc.with_ymd_and_hms(2026, 2, 1, 0, 20, 0).unwrap());
        assert_eq!(key.to_string(), "2026-02-01-00:15");
    }
}
