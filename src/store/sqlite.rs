use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, InterruptHandle, TransactionBehavior, params_from_iter};
use tracing::debug;

use super::{StoreError, TableStore, TableWrite};
use crate::schema::{ColumnType, RowBatch, TableSchema, Value};

/// Embedded single-file database.
///
/// Each call opens its own connection and drops it before returning, so
/// concurrent ticks serialize on SQLite's file lock (waiting up to
/// `busy_timeout`) rather than on shared state in this process. Partitions
/// are not materialized: every batch lands in the one table.
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let conn = open(&self.path, self.busy_timeout)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Declared `(name, type)` pairs of `table`, empty if it does not exist.
    pub fn table_layout(&self, table: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = open(&self.path, self.busy_timeout)?;
        Ok(table_layout(&conn, table)?)
    }

    /// Runs `f` on a fresh connection in the blocking pool.
    ///
    /// If the returned future is dropped before the task finishes (the
    /// loader's deadline passed), the call is marked cancelled and the
    /// running statement interrupted. `f` checks the mark before
    /// committing, so an abandoned call rolls back instead of landing rows
    /// the caller was told timed out.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Connection, &CallState) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let state = Arc::new(CallState::default());
        let mut guard = CancelOnDrop(Some(state.clone()));

        let result = tokio::task::spawn_blocking(move || {
            let conn = open(&path, busy_timeout)?;
            state.register(&conn);
            state.check()?;
            f(conn, &*state)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        guard.0 = None;
        result
    }
}

/// Cancellation shared between an async store call and its blocking task.
#[derive(Default)]
struct CallState {
    cancelled: AtomicBool,
    interrupt: Mutex<Option<InterruptHandle>>,
}

impl CallState {
    fn register(&self, conn: &Connection) {
        *self.interrupt.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(conn.get_interrupt_handle());
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.interrupt();
        }
    }
}

struct CancelOnDrop(Option<Arc<CallState>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(state) = self.0.take() {
            debug!("SQLite call abandoned, cancelling");
            state.cancel();
        }
    }
}

fn open(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_layout(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?;
    rows.collect()
}

fn create_table_sql(schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_name()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quote_ident(&schema.name))
}

fn insert_sql(batch: &RowBatch) -> String {
    let columns = batch
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; batch.columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
        quote_ident(&batch.table)
    )
}

fn ensure_table(conn: &Connection, schema: &TableSchema) -> Result<(), StoreError> {
    let existing = table_layout(conn, &schema.name)?;

    if existing.is_empty() {
        conn.execute(&create_table_sql(schema), [])?;
        debug!(table = %schema.name, "Created table");
        return Ok(());
    }

    let typed: Option<Vec<(String, ColumnType)>> = existing
        .iter()
        .map(|(name, ty)| ColumnType::from_sql_name(ty).map(|t| (name.clone(), t)))
        .collect();

    match typed {
        Some(found) if schema.same_layout(&found) => Ok(()),
        _ => Err(StoreError::SchemaConflict {
            table: schema.name.clone(),
            expected: schema.describe(),
            found: existing
                .iter()
                .map(|(name, ty)| format!("{name} {ty}"))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            Value::Timestamp(ts) => ts.to_sql(),
            Value::Date(d) => d.to_sql(),
            Value::String(s) => s.to_sql(),
            Value::Boolean(b) => b.to_sql(),
            Value::Integer(i) => i.to_sql(),
        }
    }
}

#[async_trait]
impl TableStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let schema = schema.clone();
        self.blocking(move |mut conn, state| {
            // IMMEDIATE takes the write lock up front, so the layout check
            // and the create cannot interleave with another writer's.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_table(&tx, &schema)?;
            state.check()?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        let batches: Vec<RowBatch> = writes
            .iter()
            .filter(|w| !w.batch.is_empty())
            .map(|w| w.batch.clone())
            .collect();

        self.blocking(move |mut conn, state| {
            let tx = conn.transaction()?;
            let mut written = 0u64;
            for batch in &batches {
                let mut stmt = tx.prepare(&insert_sql(batch))?;
                for row in &batch.rows {
                    stmt.execute(params_from_iter(row.iter()))?;
                }
                written += batch.len() as u64;
            }
            // Dropping `tx` without commit rolls back every table in this call.
            state.check()?;
            tx.commit()?;
            Ok(written)
        })
        .await
    }
}
