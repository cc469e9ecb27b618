//! Tables as directories of CSV files.
//!
//! Layout under the root directory:
//!
//! ```text
//! table=raw_trips/_schema.json
//! table=raw_trips/partition=2026-01-05-13:05/data.csv
//! table=raw_stops/data.csv
//! ```

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use csv::WriterBuilder;
use tracing::{debug, warn};

use super::{StoreError, TableStore, TableWrite};
use crate::schema::{RowBatch, TableSchema};

const SCHEMA_FILE: &str = "_schema.json";
const DATA_FILE: &str = "data.csv";

pub struct CsvDirStore {
    root: PathBuf,
    // Serializes appends from concurrent ticks in this process.
    write_lock: Mutex<()>,
}

impl CsvDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(format!("table={table}"))
    }

    /// CSV file receiving rows for `table` in `partition`.
    pub fn data_path(&self, table: &str, partition: Option<&str>) -> PathBuf {
        let dir = self.table_dir(table);
        match partition {
            Some(p) => dir.join(format!("partition={p}")).join(DATA_FILE),
            None => dir.join(DATA_FILE),
        }
    }

    fn read_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let path = self.table_dir(table).join(SCHEMA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Renders `batch` as CSV, optionally with a header line.
pub(crate) fn encode_csv(batch: &RowBatch, with_header: bool) -> Result<Vec<u8>, StoreError> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    if with_header {
        writer.write_record(&batch.columns)?;
    }
    for row in &batch.rows {
        writer.write_record(row.iter().map(ToString::to_string))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

#[async_trait]
impl TableStore for CsvDirStore {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.read_schema(&schema.name)? {
            Some(existing) => {
                let found: Vec<_> = existing
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.ty))
                    .collect();
                if schema.same_layout(&found) {
                    Ok(())
                } else {
                    Err(StoreError::SchemaConflict {
                        table: schema.name.clone(),
                        expected: schema.describe(),
                        found: existing.describe(),
                    })
                }
            }
            None => {
                let dir = self.table_dir(&schema.name);
                fs::create_dir_all(&dir)?;
                fs::write(dir.join(SCHEMA_FILE), serde_json::to_vec_pretty(schema)?)?;
                debug!(table = %schema.name, dir = %dir.display(), "Created table directory");
                Ok(())
            }
        }
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Render and check everything before touching any file.
        let mut staged: Vec<(PathBuf, Vec<u8>, u64)> = Vec::with_capacity(writes.len());
        for write in writes.iter().filter(|w| !w.batch.is_empty()) {
            if self.read_schema(&write.schema.name)?.is_none() {
                return Err(StoreError::MissingTable(write.schema.name.clone()));
            }
            let partition = write.partition.map(ToString::to_string);
            let path = self.data_path(&write.schema.name, partition.as_deref());
            let needs_header = !path.exists() && !staged.iter().any(|(p, _, _)| *p == path);
            let bytes = encode_csv(write.batch, needs_header)?;
            staged.push((path, bytes, write.batch.len() as u64));
        }

        let mut applied = Vec::with_capacity(staged.len());
        let mut written = 0;
        for (path, bytes, rows) in staged {
            let previous_len = fs::metadata(&path).ok().map(|m| m.len());
            debug!(path = %path.display(), rows, "Appending CSV rows");
            let result = write_staged(&path, &bytes);
            applied.push((path, previous_len));
            if let Err(e) = result {
                rollback(&applied);
                return Err(e);
            }
            written += rows;
        }
        Ok(written)
    }
}

fn write_staged(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    append_bytes(path, bytes)
}

/// Restores files written earlier in a failed call: truncated back to their
/// previous length, or removed if the call created them.
fn rollback(applied: &[(PathBuf, Option<u64>)]) {
    for (path, previous_len) in applied.iter().rev() {
        let result = match previous_len {
            Some(len) => OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| file.set_len(*len)),
            None => match fs::remove_file(path) {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "Rolled back CSV append"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to roll back CSV append"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionKey, PartitionWindow};
    use crate::schema::Value;
    use chrono::{TimeZone, Utc};

    fn batch(schema: &TableSchema, stop: &str) -> RowBatch {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, 13, 7, 0).unwrap();
        let mut batch = RowBatch::for_schema(schema);
        batch
            .rows
            .push(vec![ts.into(), "t1".into(), stop.into(), ts.into(), Value::Null]);
        batch
    }

    #[test]
    fn test_encode_csv_renders_nulls_empty() {
        let schema = TableSchema::boundary_updates("u");
        let bytes = encode_csv(&batch(&schema, "101N"), true).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "updated_at,trip_id,stop_id,arrival,departure");
        assert_eq!(
            lines[1],
            "2026-01-05T13:07:00Z,t1,101N,2026-01-05T13:07:00Z,"
        );
    }

    #[tokio::test]
    async fn test_append_writes_header_once_per_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        let schema = TableSchema::boundary_updates("raw_stop_time_updates");
        store.ensure_schema(&schema).await.unwrap();

        let key = PartitionWindow::default()
            .partition_for(Utc.with_ymd_and_hms(2026, 1, 5, 13, 7, 0).unwrap());
        let first = batch(&schema, "101N");
        let second = batch(&schema, "142N");
        for b in [&first, &second] {
            store
                .append(&[TableWrite {
                    schema: &schema,
                    partition: Some(&key),
                    batch: b,
                }])
                .await
                .unwrap();
        }

        let path = store.data_path("raw_stop_time_updates", Some("2026-01-05-13:05"));
        let content = fs::read_to_string(path).unwrap();
        let header_count = content.lines().filter(|l| l.starts_with("updated_at")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_schema_conflict_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        store
            .ensure_schema(&TableSchema::trip_snapshots("raw_trips", true))
            .await
            .unwrap();
        let err = store
            .ensure_schema(&TableSchema::trip_snapshots("raw_trips", false))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn test_append_without_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        let schema = TableSchema::boundary_updates("u");
        let b = batch(&schema, "101N");
        let result = store
            .append(&[TableWrite {
                schema: &schema,
                partition: None,
                batch: &b,
            }])
            .await;
        assert!(matches!(result, Err(StoreError::MissingTable(_))));
        assert!(!store.data_path("u", None).exists());
    }

    fn write<'a>(schema: &'a TableSchema, key: Option<&'a PartitionKey>, batch: &'a RowBatch) -> TableWrite<'a> {
        TableWrite {
            schema,
            partition: key,
            batch,
        }
    }

    #[tokio::test]
    async fn test_failed_second_table_rolls_back_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        let trips = TableSchema::boundary_updates("a");
        let updates = TableSchema::boundary_updates("b");
        store.ensure_schema(&trips).await.unwrap();
        store.ensure_schema(&updates).await.unwrap();

        let key = PartitionWindow::default()
            .partition_for(Utc.with_ymd_and_hms(2026, 1, 5, 13, 7, 0).unwrap());
        let earlier = batch(&trips, "101N");
        store.append(&[write(&trips, Some(&key), &earlier)]).await.unwrap();
        let a_path = store.data_path("a", Some("2026-01-05-13:05"));
        let before = fs::read_to_string(&a_path).unwrap();

        // A plain file where table b's partition directory should go.
        fs::write(store.table_dir("b").join("partition=2026-01-05-13:05"), b"").unwrap();

        let a_rows = batch(&trips, "142N");
        let b_rows = batch(&updates, "142N");
        let result = store
            .append(&[write(&trips, Some(&key), &a_rows), write(&updates, Some(&key), &b_rows)])
            .await;

        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(fs::read_to_string(&a_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_call_removes_files_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        let trips = TableSchema::boundary_updates("a");
        let updates = TableSchema::boundary_updates("b");
        store.ensure_schema(&trips).await.unwrap();
        store.ensure_schema(&updates).await.unwrap();
        fs::write(store.table_dir("b").join("partition=2026-01-05-13:05"), b"").unwrap();

        let key = PartitionWindow::default()
            .partition_for(Utc.with_ymd_and_hms(2026, 1, 5, 13, 7, 0).unwrap());
        let a_rows = batch(&trips, "101N");
        let b_rows = batch(&updates, "101N");
        let result = store
            .append(&[write(&trips, Some(&key), &a_rows), write(&updates, Some(&key), &b_rows)])
            .await;

        assert!(result.is_err());
        assert!(!store.data_path("a", Some("2026-01-05-13:05")).exists());
    }

    #[tokio::test]
    async fn test_same_partition_twice_in_one_call_has_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirStore::new(dir.path());
        let schema = TableSchema::boundary_updates("u");
        store.ensure_schema(&schema).await.unwrap();

        let key = PartitionWindow::default()
            .partition_for(Utc.with_ymd_and_hms(2026, 1, 5, 13, 7, 0).unwrap());
        let first = batch(&schema, "101N");
        let second = batch(&schema, "142N");
        let written = store
            .append(&[write(&schema, Some(&key), &first), write(&schema, Some(&key), &second)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let content = fs::read_to_string(store.data_path("u", Some("2026-01-05-13:05"))).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("updated_at"));
        assert!(lines[2].contains("142N"));
    }
}
