//! Flattens trips into tabular rows.
//!
//! Each poll yields one snapshot row per trip and up to two boundary rows per
//! trip: the next stop and the terminal stop. Which columns are emitted, and
//! which of them may be null, is driven by the [`TableSchema`]s the
//! [`Extractor`] is built with.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::error::IngestError;
use crate::model::{StopTimeUpdate, Trip};
use crate::schema::{ColumnType, RowBatch, TableSchema, Value};

/// Flat per-trip record for one observation instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TripSnapshotRow {
    pub updated_at: DateTime<Utc>,
    pub trip_id: String,
    pub start_date: Option<NaiveDate>,
    pub route_id: Option<String>,
    pub direction: Option<String>,
    pub location: Option<String>,
    pub location_status: Option<String>,
    pub headsign_text: Option<String>,
    pub departure_time: Option<DateTime<Utc>>,
    pub underway: bool,
    pub train_assigned: bool,
    pub last_position_update: Option<DateTime<Utc>>,
    pub current_stop_sequence_index: i64,
    pub num_stops_left: i64,
    pub has_delay_alert: bool,
}

impl TripSnapshotRow {
    /// Every column a snapshot row can populate.
    pub const FIELDS: &'static [(&'static str, ColumnType)] = &[
        ("updated_at", ColumnType::Timestamp),
        ("trip_id", ColumnType::String),
        ("start_date", ColumnType::Date),
        ("route_id", ColumnType::String),
        ("direction", ColumnType::String),
        ("location", ColumnType::String),
        ("location_status", ColumnType::String),
        ("headsign_text", ColumnType::String),
        ("departure_time", ColumnType::Timestamp),
        ("underway", ColumnType::Boolean),
        ("train_assigned", ColumnType::Boolean),
        ("last_position_update", ColumnType::Timestamp),
        ("current_stop_sequence_index", ColumnType::Integer),
        ("num_stops_left", ColumnType::Integer),
        ("has_delay_alert", ColumnType::Boolean),
    ];

    pub fn from_trip(trip: &Trip, observed_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: observed_at,
            trip_id: trip.trip_id.clone(),
            start_date: trip.start_date,
            route_id: trip.route_id.clone(),
            direction: trip.direction.clone(),
            location: trip.location.clone(),
            location_status: trip.location_status.clone(),
            headsign_text: trip.headsign_text.clone(),
            departure_time: trip.departure_time,
            underway: trip.underway,
            train_assigned: trip.train_assigned,
            last_position_update: trip.last_position_update,
            current_stop_sequence_index: trip.current_stop_sequence_index,
            num_stops_left: trip.stop_time_updates.len() as i64,
            has_delay_alert: trip.has_delay_alert,
        }
    }

    /// Cell for `column`, or `None` if this row has no such field.
    pub fn value(&self, column: &str) -> Option<Value> {
        let v: Value = match column {
            "updated_at" => self.updated_at.into(),
            "trip_id" => non_empty(&self.trip_id),
            "start_date" => self.start_date.into(),
            "route_id" => self.route_id.clone().into(),
            "direction" => self.direction.clone().into(),
            "location" => self.location.clone().into(),
            "location_status" => self.location_status.clone().into(),
            "headsign_text" => self.headsign_text.clone().into(),
            "departure_time" => self.departure_time.into(),
            "underway" => self.underway.into(),
            "train_assigned" => self.train_assigned.into(),
            "last_position_update" => self.last_position_update.into(),
            "current_stop_sequence_index" => self.current_stop_sequence_index.into(),
            "num_stops_left" => self.num_stops_left.into(),
            "has_delay_alert" => self.has_delay_alert.into(),
            _ => return None,
        };
        Some(v)
    }
}

/// Next-stop or terminal-stop prediction for one trip.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryUpdateRow {
    pub updated_at: DateTime<Utc>,
    pub trip_id: String,
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
}

impl BoundaryUpdateRow {
    pub const FIELDS: &'static [(&'static str, ColumnType)] = &[
        ("updated_at", ColumnType::Timestamp),
        ("trip_id", ColumnType::String),
        ("stop_id", ColumnType::String),
        ("stop_name", ColumnType::String),
        ("arrival", ColumnType::Timestamp),
        ("departure", ColumnType::Timestamp),
    ];

    pub fn from_update(update: &StopTimeUpdate, trip_id: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: observed_at,
            trip_id: trip_id.to_string(),
            stop_id: update.stop_id.clone(),
            stop_name: update.stop_name.clone(),
            arrival: update.arrival,
            departure: update.departure,
        }
    }

    pub fn value(&self, column: &str) -> Option<Value> {
        let v: Value = match column {
            "updated_at" => self.updated_at.into(),
            "trip_id" => non_empty(&self.trip_id),
            "stop_id" => non_empty(&self.stop_id),
            "stop_name" => self.stop_name.clone().into(),
            "arrival" => self.arrival.into(),
            "departure" => self.departure.into(),
            _ => return None,
        };
        Some(v)
    }
}

fn non_empty(s: &str) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}

/// Picks the updates worth keeping for a trip: nothing, the single update,
/// or the first (next stop) and last (terminal stop) in that order.
pub fn boundary_updates(updates: &[StopTimeUpdate]) -> Vec<&StopTimeUpdate> {
    match updates {
        [] => Vec::new(),
        [only] => vec![only],
        [next, .., terminal] => vec![next, terminal],
    }
}

/// Output of one [`Extractor::extract`] call.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub observed_at: DateTime<Utc>,
    pub snapshots: Vec<TripSnapshotRow>,
    pub boundaries: Vec<BoundaryUpdateRow>,
    /// `snapshots` laid out for the snapshot table.
    pub snapshot_batch: RowBatch,
    /// `boundaries` laid out for the boundary-update table.
    pub boundary_batch: RowBatch,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.boundaries.is_empty()
    }
}

/// Turns trip batches into rows for a fixed pair of table schemas.
#[derive(Debug, Clone)]
pub struct Extractor {
    snapshot_schema: TableSchema,
    boundary_schema: TableSchema,
}

impl Extractor {
    /// Fails if either schema names a column the corresponding row type
    /// cannot fill, or declares it with a different type.
    pub fn new(snapshot_schema: TableSchema, boundary_schema: TableSchema) -> Result<Self, IngestError> {
        check_columns(&snapshot_schema, TripSnapshotRow::FIELDS)?;
        check_columns(&boundary_schema, BoundaryUpdateRow::FIELDS)?;
        Ok(Self {
            snapshot_schema,
            boundary_schema,
        })
    }

    pub fn snapshot_schema(&self) -> &TableSchema {
        &self.snapshot_schema
    }

    pub fn boundary_schema(&self) -> &TableSchema {
        &self.boundary_schema
    }

    /// Flattens `trips`, tagging every row with `observed_at`.
    ///
    /// Snapshot rows follow input order. Boundary rows follow input trip
    /// order, next stop before terminal stop within a trip.
    ///
    /// # Errors
    ///
    /// [`IngestError::MalformedRecord`] for the first trip (or boundary
    /// update) with no value for a non-nullable column. Nothing is returned
    /// for the rest of the batch in that case.
    pub fn extract(&self, trips: &[Trip], observed_at: DateTime<Utc>) -> Result<Extraction, IngestError> {
        let mut snapshots = Vec::with_capacity(trips.len());
        let mut boundaries = Vec::new();
        let mut snapshot_batch = RowBatch::for_schema(&self.snapshot_schema);
        let mut boundary_batch = RowBatch::for_schema(&self.boundary_schema);

        for trip in trips {
            let snapshot = TripSnapshotRow::from_trip(trip, observed_at);
            snapshot_batch.rows.push(row_values(&self.snapshot_schema, &trip.trip_id, |c| {
                snapshot.value(c)
            })?);
            snapshots.push(snapshot);

            for update in boundary_updates(&trip.stop_time_updates) {
                let boundary = BoundaryUpdateRow::from_update(update, &trip.trip_id, observed_at);
                boundary_batch.rows.push(row_values(&self.boundary_schema, &trip.trip_id, |c| {
                    boundary.value(c)
                })?);
                boundaries.push(boundary);
            }
        }

        debug!(
            trips = trips.len(),
            snapshot_rows = snapshots.len(),
            boundary_rows = boundaries.len(),
            "Extracted trip batch"
        );

        Ok(Extraction {
            observed_at,
            snapshots,
            boundaries,
            snapshot_batch,
            boundary_batch,
        })
    }
}

fn check_columns(schema: &TableSchema, fields: &[(&str, ColumnType)]) -> Result<(), IngestError> {
    for column in &schema.columns {
        match fields.iter().find(|(name, _)| *name == column.name) {
            None => {
                return Err(IngestError::Config(format!(
                    "table {} declares unknown column {}",
                    schema.name, column.name
                )));
            }
            Some((_, ty)) if *ty != column.ty => {
                return Err(IngestError::Config(format!(
                    "table {} declares {} as {}, expected {}",
                    schema.name,
                    column.name,
                    column.ty.sql_name(),
                    ty.sql_name()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn row_values(
    schema: &TableSchema,
    trip_id: &str,
    value: impl Fn(&str) -> Option<Value>,
) -> Result<Vec<Value>, IngestError> {
    let mut row = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        // Columns were checked against FIELDS in Extractor::new.
        let v = value(&column.name).unwrap_or(Value::Null);
        if v.is_null() && !column.nullable {
            return Err(IngestError::MalformedRecord {
                trip_id: if trip_id.is_empty() {
                    "<unknown>".to_string()
                } else {
                    trip_id.to_string()
                },
                field: column.name.clone(),
            });
        }
        row.push(v);
    }
    Ok(row)
}
