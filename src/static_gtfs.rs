//! Static schedule reference data: download the GTFS zip, pull out the
//! member files we keep, and land them as string tables.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::loader::Loader;
use crate::schema::{Column, ColumnType, RowBatch, TableSchema, Value};
use crate::store::TableStore;

/// A parsed CSV member: header row plus records, all as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn parse(bytes: &[u8]) -> Result<Self, IngestError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new().from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|e| IngestError::StaticData(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| IngestError::StaticData(e.to_string()))?;
            records.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, records })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Schema and rows for landing this file as `table`: a `loaded_at`
    /// timestamp followed by one nullable text column per header. Empty
    /// cells become nulls.
    pub fn to_table(&self, table: &str, loaded_at: DateTime<Utc>) -> (TableSchema, RowBatch) {
        let mut columns = vec![Column::required("loaded_at", ColumnType::Timestamp)];
        columns.extend(
            self.headers
                .iter()
                .map(|h| Column::nullable(h, ColumnType::String)),
        );
        let schema = TableSchema::new(table, columns);

        let mut batch = RowBatch::for_schema(&schema);
        for record in &self.records {
            let mut row = Vec::with_capacity(self.headers.len() + 1);
            row.push(Value::Timestamp(loaded_at));
            row.extend(record.iter().map(|cell| {
                if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.clone())
                }
            }));
            batch.rows.push(row);
        }

        (schema, batch)
    }
}

/// Upper bound on what the declared (untrusted) member size may preallocate.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOC)).unwrap_or(0)
}

/// Reads one member file out of a zip archive held in memory.
pub fn read_member(archive: &[u8], member: &str) -> Result<Vec<u8>, IngestError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| IngestError::StaticData(format!("invalid archive: {e}")))?;
    let mut file = zip
        .by_name(member)
        .map_err(|e| IngestError::StaticData(format!("{member}: {e}")))?;

    let mut buf = Vec::with_capacity(initial_capacity(file.size()));
    file.read_to_end(&mut buf)
        .map_err(|e| IngestError::StaticData(format!("{member}: {e}")))?;
    Ok(buf)
}

/// Stop id to display name, from `stops.txt`.
#[derive(Debug, Clone, Default)]
pub struct StopDirectory {
    names: HashMap<String, String>,
}

impl StopDirectory {
    pub fn from_stops(stops: &CsvTable) -> Result<Self, IngestError> {
        let missing = |col: &str| IngestError::StaticData(format!("stops.txt has no {col} column"));
        let id_idx = stops.column_index("stop_id").ok_or_else(|| missing("stop_id"))?;
        let name_idx = stops.column_index("stop_name").ok_or_else(|| missing("stop_name"))?;

        let names = stops
            .records
            .iter()
            .filter_map(|r| Some((r.get(id_idx)?.clone(), r.get(name_idx)?.clone())))
            .collect();
        Ok(Self { names })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Name of `stop_id`, falling back to its parent station (the id
    /// without the trailing `N`/`S` platform direction).
    pub fn name(&self, stop_id: &str) -> Option<&str> {
        self.names
            .get(stop_id)
            .or_else(|| {
                stop_id
                    .strip_suffix(['N', 'S'])
                    .and_then(|parent| self.names.get(parent))
            })
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Downloads the schedule archive.
pub async fn fetch_archive<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Vec<u8>, IngestError> {
    fetch_bytes(client, url)
        .await
        .map_err(|e| IngestError::StaticData(format!("download {url}: {e:#}")))
}

/// Downloads the archive and builds a [`StopDirectory`] from `stops.txt`.
pub async fn fetch_stop_directory<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<StopDirectory, IngestError> {
    let archive = fetch_archive(client, url).await?;
    StopDirectory::from_stops(&CsvTable::parse(&read_member(&archive, "stops.txt")?)?)
}

/// Lands each `table name -> member file` pair of `tables` from `archive`.
/// Returns rows written per table.
pub async fn load_static_tables<S: TableStore>(
    loader: &Loader<S>,
    archive: &[u8],
    tables: &BTreeMap<String, String>,
    loaded_at: DateTime<Utc>,
) -> Result<Vec<(String, u64)>, IngestError> {
    let mut loaded = Vec::with_capacity(tables.len());

    for (table, member) in tables {
        let parsed = CsvTable::parse(&read_member(archive, member)?)?;
        if parsed.records.is_empty() {
            warn!(table = %table, member = %member, "Static member has no rows");
        }
        let (schema, batch) = parsed.to_table(table, loaded_at);

        loader.ensure_schema(&schema).await?;
        let rows = loader.append(&schema, None, &batch).await?;
        info!(table = %table, member = %member, rows, "Static table loaded");
        loaded.push((table.clone(), rows));
    }

    Ok(loaded)
}
