//! Source adapters: snapshot XML loading, schema normalization and geocoding providers.

pub mod geocoder;
pub mod normalize;
pub mod xml;

use std::path::{Path, PathBuf};

use dinesafe_core::{InfractionRecord, SnapshotId, SnapshotIdError};
use thiserror::Error;

pub use geocoder::{BingGeocoder, GeocodeError, Geocoder};
pub use normalize::normalize_table;
pub use xml::{parse_snapshot_xml, read_snapshot_table, RawTable};

pub const CRATE_NAME: &str = "dinesafe-adapters";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("reading {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot directory of {path} is not a snapshot id")]
    SnapshotName {
        path: PathBuf,
        #[source]
        source: SnapshotIdError,
    },
    #[error("parsing XML of snapshot {snapshot}")]
    Xml {
        snapshot: SnapshotId,
        #[source]
        source: roxmltree::Error,
    },
    #[error("snapshot {snapshot} has no {column} column")]
    MissingColumn {
        snapshot: SnapshotId,
        column: &'static str,
    },
    #[error("snapshot {snapshot} row {row}: {column} is missing")]
    MissingValue {
        snapshot: SnapshotId,
        row: usize,
        column: &'static str,
    },
    #[error("snapshot {snapshot} row {row}: {column} has invalid value `{value}`")]
    InvalidValue {
        snapshot: SnapshotId,
        row: usize,
        column: &'static str,
        value: String,
    },
}

/// Read one extracted snapshot file and normalize it into infraction records.
pub fn read_snapshot_records(xml_path: &Path) -> Result<Vec<InfractionRecord>, IngestError> {
    let table = read_snapshot_table(xml_path)?;
    normalize_table(&table)
}
