pub mod config;
pub mod error;
pub mod extract;
pub mod feed;
pub mod fetch;
pub mod ingest;
pub mod loader;
pub mod model;
pub mod parser;
pub mod partition;
pub mod schema;
pub mod static_gtfs;
pub mod store;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

pub use error::IngestError;
pub use extract::{BoundaryUpdateRow, Extraction, Extractor, TripSnapshotRow};
pub use loader::Loader;
pub use model::{StopTimeUpdate, Trip};
