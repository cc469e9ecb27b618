//! Column schemas, cell values and row batches shared by the extractor,
//! the loader and every storage backend.

use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Semantic column type. Backends map these onto their own type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Timestamp,
    Date,
    String,
    Boolean,
    Integer,
}

impl ColumnType {
    /// SQL type name used in DDL.
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Date => "DATE",
            ColumnType::String => "VARCHAR",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "INTEGER",
        }
    }

    /// Inverse of [`ColumnType::sql_name`], case-insensitive.
    pub fn from_sql_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TIMESTAMP" => Some(ColumnType::Timestamp),
            "DATE" => Some(ColumnType::Date),
            "VARCHAR" => Some(ColumnType::String),
            "BOOLEAN" => Some(ColumnType::Boolean),
            "INTEGER" => Some(ColumnType::Integer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn required(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
        }
    }
}

/// Ordered column layout of one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// One row per trip per poll. `include_headsign` toggles the
    /// `headsign_text` column, which not every deployment carries.
    pub fn trip_snapshots(name: &str, include_headsign: bool) -> Self {
        use ColumnType::*;

        let mut columns = vec![
            Column::required("updated_at", Timestamp),
            Column::required("trip_id", String),
            Column::required("start_date", Date),
            Column::required("route_id", String),
            Column::required("direction", String),
            Column::nullable("location", String),
            Column::nullable("location_status", String),
        ];
        if include_headsign {
            columns.push(Column::nullable("headsign_text", String));
        }
        columns.extend([
            Column::nullable("departure_time", Timestamp),
            Column::required("underway", Boolean),
            Column::required("train_assigned", Boolean),
            Column::nullable("last_position_update", Timestamp),
            Column::required("current_stop_sequence_index", Integer),
            Column::required("num_stops_left", Integer),
            Column::required("has_delay_alert", Boolean),
        ]);

        Self::new(name, columns)
    }

    /// Next-stop and terminal-stop updates, at most two rows per trip per poll.
    pub fn boundary_updates(name: &str) -> Self {
        use ColumnType::*;

        Self::new(
            name,
            vec![
                Column::required("updated_at", Timestamp),
                Column::required("trip_id", String),
                Column::required("stop_id", String),
                Column::nullable("arrival", Timestamp),
                Column::nullable("departure", Timestamp),
            ],
        )
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Compares names and types in order. Nullability is not part of the
    /// physical layout and is ignored.
    pub fn same_layout(&self, found: &[(String, ColumnType)]) -> bool {
        self.columns.len() == found.len()
            && self
                .columns
                .iter()
                .zip(found)
                .all(|(c, (name, ty))| c.name == *name && c.ty == *ty)
    }

    /// Human-readable `name TYPE, ...` listing, also used in conflict errors.
    pub fn describe(&self) -> String {
        describe_layout(
            self.columns
                .iter()
                .map(|c| (c.name.as_str(), c.ty))
                .collect::<Vec<_>>()
                .as_slice(),
        )
    }

    /// Checks that `batch` can be written to this table: same columns in the
    /// same order, every row the right width, every cell the declared type,
    /// and nulls only in nullable columns.
    pub fn validate(&self, batch: &RowBatch) -> Result<(), IngestError> {
        let shape_err = |detail: String| IngestError::RowShape {
            table: self.name.clone(),
            detail,
        };

        let expected = self.column_names();
        if batch.columns != expected {
            return Err(shape_err(format!(
                "columns [{}] do not match schema [{}]",
                batch.columns.join(", "),
                expected.join(", ")
            )));
        }

        for (i, row) in batch.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(shape_err(format!(
                    "row {i} has {} values, expected {}",
                    row.len(),
                    self.columns.len()
                )));
            }
            for (column, value) in self.columns.iter().zip(row) {
                match value.column_type() {
                    None if !column.nullable => {
                        return Err(shape_err(format!(
                            "row {i}: null in non-nullable column {}",
                            column.name
                        )));
                    }
                    Some(ty) if ty != column.ty => {
                        return Err(shape_err(format!(
                            "row {i}: column {} expects {}, got {}",
                            column.name,
                            column.ty.sql_name(),
                            ty.sql_name()
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn describe_layout(columns: &[(&str, ColumnType)]) -> String {
    columns
        .iter()
        .map(|(name, ty)| format!("{name} {}", ty.sql_name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    String(String),
    Boolean(bool),
    Integer(i64),
}

impl Value {
    /// `None` for [`Value::Null`], which fits any nullable column.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Date(_) => Some(ColumnType::Date),
            Value::String(_) => Some(ColumnType::String),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Integer(_) => Some(ColumnType::Integer),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// Text rendering used by the CSV-based stores. Null renders as empty.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::String(s) => f.write_str(s),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
        }
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Rows destined for one table, with the column order they were built in.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowBatch {
    /// Empty batch laid out for `schema`.
    pub fn for_schema(schema: &TableSchema) -> Self {
        Self {
            table: schema.name.clone(),
            columns: schema.column_names(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column across all rows.
    pub fn column(&self, name: &str) -> Vec<&Value> {
        match self.column_index(name) {
            Some(i) => self.rows.iter().map(|r| &r[i]).collect(),
            None => Vec::new(),
        }
    }
}
