use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{StoreError, TableStore, TableWrite};
use crate::schema::{TableSchema, Value};

/// A row as held by [`MemoryStore`], with the partition it was filed under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub partition: Option<String>,
    pub values: Vec<Value>,
}

struct MemoryTable {
    schema: TableSchema,
    rows: Vec<StoredRow>,
}

/// Process-local store. Every append is applied under one lock, so a call
/// either lands all of its rows or none.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.lock().get(table).map(|t| t.schema.clone())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().get(table).map_or(0, |t| t.rows.len())
    }

    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Distinct partitions present in `table`, in first-seen order.
    pub fn partitions(&self, table: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for row in self.rows(table) {
            if let Some(p) = row.partition {
                if !seen.contains(&p) {
                    seen.push(p);
                }
            }
        }
        seen
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let mut tables = self.lock();
        match tables.get(&schema.name) {
            Some(existing) => {
                let found: Vec<_> = existing
                    .schema
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
                        found: existing.schema.describe(),
                    })
                }
            }
            None => {
                tables.insert(
                    schema.name.clone(),
                    MemoryTable {
                        schema: schema.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        let mut tables = self.lock();

        if let Some(missing) = writes.iter().find(|w| !tables.contains_key(&w.schema.name)) {
            return Err(StoreError::MissingTable(missing.schema.name.clone()));
        }

        let mut written = 0u64;
        for write in writes {
            let partition = write.partition.map(ToString::to_string);
            if let Some(table) = tables.get_mut(&write.schema.name) {
                table.rows.extend(write.batch.rows.iter().map(|values| StoredRow {
                    partition: partition.clone(),
                    values: values.clone(),
                }));
                written += write.batch.len() as u64;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, RowBatch};

    fn schema() -> TableSchema {
        TableSchema::new(
            "stops",
            vec![
                Column::required("stop_id", ColumnType::String),
                Column::nullable("stop_name", ColumnType::String),
            ],
        )
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_schema(&schema()).await.unwrap();
        store.ensure_schema(&schema()).await.unwrap();
        assert_eq!(store.schema("stops"), Some(schema()));
    }

    #[tokio::test]
    async fn test_ensure_schema_conflict() {
        let store = MemoryStore::new();
        store.ensure_schema(&schema()).await.unwrap();

        let mut other = schema();
        other.columns[1].ty = ColumnType::Integer;
        let err = store.ensure_schema(&other).await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn test_append_to_missing_table_writes_nothing() {
        let store = MemoryStore::new();
        let stops = schema();
        store.ensure_schema(&stops).await.unwrap();

        let mut batch = RowBatch::for_schema(&stops);
        batch.rows.push(vec!["101".into(), Value::Null]);
        let missing = TableSchema::new("nope", stops.columns.clone());

        let writes = [
            TableWrite {
                schema: &stops,
                partition: None,
                batch: &batch,
            },
            TableWrite {
                schema: &missing,
                partition: None,
                batch: &batch,
            },
        ];
        assert!(matches!(
            store.append(&writes).await,
            Err(StoreError::MissingTable(_))
        ));
        assert_eq!(store.row_count("stops"), 0);
    }
}
