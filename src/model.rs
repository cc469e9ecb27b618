//! Read-only trip records as produced by a feed source.
//!
//! Fields a feed may omit are optional here; whether an omission is
//! acceptable is decided by the extractor against the target schema.

use chrono::{DateTime, NaiveDate, Utc};

/// One real-time-tracked vehicle run and its projected remaining stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: Option<String>,
    /// Compass direction code (`N`, `S`, `E`, `W`).
    pub direction: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub location: Option<String>,
    pub location_status: Option<String>,
    pub headsign_text: Option<String>,
    pub departure_time: Option<DateTime<Utc>>,
    pub underway: bool,
    pub train_assigned: bool,
    pub last_position_update: Option<DateTime<Utc>>,
    pub current_stop_sequence_index: i64,
    pub has_delay_alert: bool,
    /// Next stop first, terminal stop last.
    pub stop_time_updates: Vec<StopTimeUpdate>,
}

/// Predicted arrival/departure at a single stop of a trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopTimeUpdate {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
}

impl StopTimeUpdate {
    pub fn new(stop_id: impl Into<String>) -> Self {
        Self {
            stop_id: stop_id.into(),
            ..Default::default()
        }
    }

    pub fn arriving(mut self, at: DateTime<Utc>) -> Self {
        self.arrival = Some(at);
        self
    }

    pub fn departing(mut self, at: DateTime<Utc>) -> Self {
        self.departure = Some(at);
        self
    }
}
