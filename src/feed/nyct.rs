//! NYCT subway GTFS-realtime feeds.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::America::New_York;
use tracing::debug;

use super::{FeedSnapshot, FeedSource};
use crate::error::IngestError;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::gtfs_rt::trip_update::StopTimeUpdate as RtStopTimeUpdate;
use crate::gtfs_rt::{FeedMessage, TripUpdate, VehiclePosition, nyct_trip_descriptor::Direction};
use crate::model::{StopTimeUpdate, Trip};
use crate::parser::parse_feed;
use crate::static_gtfs::StopDirectory;

/// Base URL for MTA GTFS-RT feeds; the line-group suffix is appended.
pub const MTA_FEED_BASE_URL: &str = "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs";

/// One source per feed, named after a route it carries.
pub const DEFAULT_SOURCES: &[&str] = &["1", "A", "B", "G", "J", "L", "N", "SIR"];

/// Feed URL suffix for a source identifier. Any route of a line group
/// selects that group's feed.
pub fn feed_suffix(source_id: &str) -> Option<&'static str> {
    match source_id {
        "1" | "2" | "3" | "4" | "5" | "6" | "GS" => Some(""),
        "A" | "C" | "E" | "H" | "FS" => Some("-ace"),
        "B" | "D" | "F" | "M" => Some("-bdfm"),
        "G" => Some("-g"),
        "J" | "Z" => Some("-jz"),
        "N" | "Q" | "R" | "W" => Some("-nqrw"),
        "L" => Some("-l"),
        "7" => Some("-7"),
        "SI" | "SIR" => Some("-si"),
        _ => None,
    }
}

/// Live NYCT feeds fetched over HTTP.
pub struct NyctFeed {
    client: Box<dyn HttpClient>,
    base_url: String,
    stops: StopDirectory,
}

impl NyctFeed {
    pub fn new(client: Box<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            stops: StopDirectory::default(),
        }
    }

    /// Resolve stop names (and headsigns) through `stops`.
    pub fn with_stops(mut self, stops: StopDirectory) -> Self {
        self.stops = stops;
        self
    }

    pub fn feed_url(&self, source_id: &str) -> Option<String> {
        feed_suffix(source_id).map(|suffix| format!("{}{}", self.base_url, suffix))
    }
}

#[async_trait]
impl FeedSource for NyctFeed {
    #[tracing::instrument(skip(self))]
    async fn pull(&self, source_id: &str) -> Result<FeedSnapshot, IngestError> {
        let url = self
            .feed_url(source_id)
            .ok_or_else(|| IngestError::feed_unavailable(source_id, "unknown source identifier"))?;

        let bytes = fetch_bytes(self.client.as_ref(), &url)
            .await
            .map_err(|e| IngestError::feed_unavailable(source_id, format!("{e:#}")))?;
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");

        let feed = parse_feed(&bytes).map_err(|e| IngestError::feed_unavailable(source_id, format!("{e:#}")))?;
        snapshot_from_feed(source_id, &feed, &self.stops)
    }
}

/// Decodes a parsed feed into a [`FeedSnapshot`]. The header timestamp is
/// the observation instant; a feed without one is unusable.
pub fn snapshot_from_feed(
    source_id: &str,
    feed: &FeedMessage,
    stops: &StopDirectory,
) -> Result<FeedSnapshot, IngestError> {
    let generated_at = feed
        .header
        .timestamp
        .and_then(from_posix)
        .ok_or_else(|| IngestError::feed_unavailable(source_id, "feed header has no timestamp"))?;

    let trips = trips_from_feed(feed, stops);
    debug!(source_id, trips = trips.len(), %generated_at, "Feed decoded");

    Ok(FeedSnapshot {
        source_id: source_id.to_string(),
        trips,
        generated_at,
    })
}

/// One [`Trip`] per trip-update entity, in feed order, joined with the
/// vehicle position and alerts that reference the same trip id.
pub fn trips_from_feed(feed: &FeedMessage, stops: &StopDirectory) -> Vec<Trip> {
    let live = feed.entity.iter().filter(|e| !e.is_deleted());

    let mut vehicles: HashMap<&str, &VehiclePosition> = HashMap::new();
    let mut alerted: HashSet<&str> = HashSet::new();
    for entity in live.clone() {
        if let Some(vehicle) = &entity.vehicle {
            if let Some(trip_id) = vehicle.trip.as_ref().and_then(|t| t.trip_id.as_deref()) {
                vehicles.insert(trip_id, vehicle);
            }
        }
        if let Some(alert) = &entity.alert {
            alerted.extend(
                alert
                    .informed_entity
                    .iter()
                    .filter_map(|sel| sel.trip.as_ref()?.trip_id.as_deref()),
            );
        }
    }

    live.filter_map(|e| e.trip_update.as_ref())
        .map(|tu| {
            let trip_id = tu.trip.trip_id();
            trip_from_update(
                tu,
                vehicles.get(trip_id).copied(),
                alerted.contains(trip_id),
                stops,
            )
        })
        .collect()
}

fn trip_from_update(
    tu: &TripUpdate,
    vehicle: Option<&VehiclePosition>,
    has_delay_alert: bool,
    stops: &StopDirectory,
) -> Trip {
    let desc = &tu.trip;
    let trip_id = desc.trip_id().to_string();
    let nyct = desc.nyct_trip_descriptor.as_ref();

    let start_date = desc
        .start_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok());

    let direction = nyct
        .and_then(|n| n.direction)
        .and_then(|d| Direction::try_from(d).ok())
        .map(|d| direction_code(d).to_string())
        .or_else(|| direction_from_trip_id(&trip_id));

    let route_id = desc
        .route_id
        .clone()
        .filter(|r| !r.is_empty())
        .or_else(|| route_from_trip_id(&trip_id));

    let stop_time_updates: Vec<StopTimeUpdate> = tu
        .stop_time_update
        .iter()
        .map(|stu| stop_time_update(stu, stops))
        .collect();

    Trip {
        departure_time: start_date
            .and_then(|date| scheduled_departure(date, desc.start_time.as_deref(), &trip_id)),
        route_id,
        direction,
        start_date,
        location: vehicle.and_then(|v| v.stop_id.clone()),
        location_status: vehicle.map(|v| v.current_status().as_str_name().to_string()),
        headsign_text: stop_time_updates.last().and_then(|u| u.stop_name.clone()),
        underway: vehicle.is_some(),
        train_assigned: nyct.and_then(|n| n.is_assigned).unwrap_or(false),
        last_position_update: vehicle.and_then(|v| v.timestamp).and_then(from_posix),
        current_stop_sequence_index: vehicle
            .and_then(|v| v.current_stop_sequence)
            .map_or(0, i64::from),
        has_delay_alert,
        stop_time_updates,
        trip_id,
    }
}

fn stop_time_update(stu: &RtStopTimeUpdate, stops: &StopDirectory) -> StopTimeUpdate {
    let stop_id = stu.stop_id().to_string();
    StopTimeUpdate {
        stop_name: stops.name(&stop_id).map(str::to_string),
        arrival: stu.arrival.as_ref().and_then(|e| e.time).and_then(from_posix_i64),
        departure: stu.departure.as_ref().and_then(|e| e.time).and_then(from_posix_i64),
        stop_id,
    }
}

fn direction_code(direction: Direction) -> &'static str {
    match direction {
        Direction::North => "N",
        Direction::East => "E",
        Direction::South => "S",
        Direction::West => "W",
    }
}

/// NYCT trip ids look like `021150_1..N03R`: origin code, route, then the
/// direction letter after `..`.
fn direction_from_trip_id(trip_id: &str) -> Option<String> {
    let (_, rest) = trip_id.split_once("..")?;
    rest.chars()
        .next()
        .filter(|c| matches!(c, 'N' | 'S' | 'E' | 'W'))
        .map(String::from)
}

fn route_from_trip_id(trip_id: &str) -> Option<String> {
    let (_, rest) = trip_id.split_once('_')?;
    let route = rest.split('.').next()?;
    (!route.is_empty()).then(|| route.to_string())
}

/// Scheduled origin departure in New York local time. Uses the descriptor
/// `start_time` (`HH:MM:SS`, hours may exceed 23) when present, else the
/// origin code prefix of the trip id, counted in hundredths of a minute
/// past midnight.
fn scheduled_departure(date: NaiveDate, start_time: Option<&str>, trip_id: &str) -> Option<DateTime<Utc>> {
    let seconds = start_time
        .and_then(parse_gtfs_time)
        .or_else(|| origin_code_seconds(trip_id))?;
    let local = date
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(TimeDelta::try_seconds(seconds)?)?;
    New_York
        .from_local_datetime(&local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_gtfs_time(s: &str) -> Option<i64> {
    let mut parts = s.split(':').map(|p| p.parse::<i64>().ok());
    let (h, m, sec) = (parts.next()??, parts.next()??, parts.next()??);
    if parts.next().is_some() || h < 0 || !(0..60).contains(&m) || !(0..60).contains(&sec) {
        return None;
    }
    h.checked_mul(3600)?.checked_add(m * 60 + sec)
}

fn origin_code_seconds(trip_id: &str) -> Option<i64> {
    let (code, _) = trip_id.split_once('_')?;
    let hundredths: i64 = code.parse().ok()?;
    Some(hundredths.checked_mul(60)? / 100)
}

fn from_posix(secs: u64) -> Option<DateTime<Utc>> {
    from_posix_i64(i64::try_from(secs).ok()?)
}

fn from_posix_i64(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
