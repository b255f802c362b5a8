//! Core domain model for the DineSafe inspection pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dinesafe-core";

/// Identifier of one archived data snapshot (its capture timestamp, e.g. `20130723222156`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotIdError {
    #[error("snapshot id is empty")]
    Empty,
    #[error("snapshot id `{0}` is longer than 20 characters")]
    TooLong(String),
    #[error("snapshot id `{0}` must contain only ASCII digits")]
    NotNumeric(String),
}

impl SnapshotId {
    pub const MAX_LEN: usize = 20;

    pub fn parse(input: &str) -> Result<Self, SnapshotIdError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SnapshotIdError::Empty);
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(SnapshotIdError::TooLong(trimmed.to_string()));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SnapshotIdError::NotNumeric(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = SnapshotIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SnapshotId> for String {
    fn from(value: SnapshotId) -> Self {
        value.0
    }
}

/// Storage class of a column in the infractions table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_sql(self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

/// Columns of the relational infractions table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    RowId,
    EstablishmentId,
    InspectionId,
    EstablishmentName,
    EstablishmentType,
    EstablishmentAddress,
    Latitude,
    Longitude,
    EstablishmentStatus,
    MinimumInspectionsPerYear,
    InfractionDetails,
    InspectionDate,
    Severity,
    Action,
    CourtOutcome,
    AmountFined,
    Filename,
}

impl Column {
    pub const COUNT: usize = 17;

    pub const ALL: [Column; Column::COUNT] = [
        Column::RowId,
        Column::EstablishmentId,
        Column::InspectionId,
        Column::EstablishmentName,
        Column::EstablishmentType,
        Column::EstablishmentAddress,
        Column::Latitude,
        Column::Longitude,
        Column::EstablishmentStatus,
        Column::MinimumInspectionsPerYear,
        Column::InfractionDetails,
        Column::InspectionDate,
        Column::Severity,
        Column::Action,
        Column::CourtOutcome,
        Column::AmountFined,
        Column::Filename,
    ];

    /// Column name as stored in the database (and, upper-cased, in the raw XML).
    pub fn name(self) -> &'static str {
        match self {
            Column::RowId => "row_id",
            Column::EstablishmentId => "establishment_id",
            Column::InspectionId => "inspection_id",
            Column::EstablishmentName => "establishment_name",
            Column::EstablishmentType => "establishmenttype",
            Column::EstablishmentAddress => "establishment_address",
            Column::Latitude => "latitude",
            Column::Longitude => "longitude",
            Column::EstablishmentStatus => "establishment_status",
            Column::MinimumInspectionsPerYear => "minimum_inspections_peryear",
            Column::InfractionDetails => "infraction_details",
            Column::InspectionDate => "inspection_date",
            Column::Severity => "severity",
            Column::Action => "action",
            Column::CourtOutcome => "court_outcome",
            Column::AmountFined => "amount_fined",
            Column::Filename => "filename",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.name() == lower)
    }

    pub fn sql_type(self) -> SqlType {
        match self {
            Column::RowId
            | Column::EstablishmentId
            | Column::InspectionId
            | Column::MinimumInspectionsPerYear => SqlType::Integer,
            Column::Latitude | Column::Longitude | Column::AmountFined => SqlType::Real,
            _ => SqlType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown column `{0}` in target schema")]
    UnknownColumn(String),
    #[error("column `{0}` listed more than once in target schema")]
    DuplicateColumn(String),
    #[error("target schema must include the `filename` column")]
    MissingFilename,
}

/// Ordered list of columns written to the infractions table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSchema {
    columns: Vec<Column>,
}

impl Default for TargetSchema {
    fn default() -> Self {
        Self {
            columns: Column::ALL.to_vec(),
        }
    }
}

impl TargetSchema {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, SchemaError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let column =
                Column::from_name(name).ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))?;
            if columns.contains(&column) {
                return Err(SchemaError::DuplicateColumn(column.name().to_string()));
            }
            columns.push(column);
        }
        if !columns.contains(&Column::Filename) {
            return Err(SchemaError::MissingFilename);
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name()).collect()
    }
}

/// A single typed cell, ready to be bound into SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Integer(Option<i64>),
    Real(Option<f64>),
    Text(Option<String>),
    Date(NaiveDate),
}

/// One normalized infraction row of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfractionRecord {
    pub row_id: Option<i64>,
    pub establishment_id: i64,
    pub inspection_id: i64,
    pub establishment_name: String,
    pub establishment_type: String,
    pub establishment_address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub establishment_status: String,
    pub minimum_inspections_per_year: i64,
    pub infraction_details: Option<String>,
    pub inspection_date: NaiveDate,
    pub severity: Option<String>,
    pub action: Option<String>,
    pub court_outcome: Option<String>,
    pub amount_fined: Option<f64>,
    pub snapshot: SnapshotId,
}

impl InfractionRecord {
    pub fn value(&self, column: Column) -> ColumnValue {
        match column {
            Column::RowId => ColumnValue::Integer(self.row_id),
            Column::EstablishmentId => ColumnValue::Integer(Some(self.establishment_id)),
            Column::InspectionId => ColumnValue::Integer(Some(self.inspection_id)),
            Column::EstablishmentName => ColumnValue::Text(Some(self.establishment_name.clone())),
            Column::EstablishmentType => ColumnValue::Text(Some(self.establishment_type.clone())),
            Column::EstablishmentAddress => {
                ColumnValue::Text(Some(self.establishment_address.clone()))
            }
            Column::Latitude => ColumnValue::Real(self.latitude),
            Column::Longitude => ColumnValue::Real(self.longitude),
            Column::EstablishmentStatus => {
                ColumnValue::Text(Some(self.establishment_status.clone()))
            }
            Column::MinimumInspectionsPerYear => {
                ColumnValue::Integer(Some(self.minimum_inspections_per_year))
            }
            Column::InfractionDetails => ColumnValue::Text(self.infraction_details.clone()),
            Column::InspectionDate => ColumnValue::Date(self.inspection_date),
            Column::Severity => ColumnValue::Text(self.severity.clone()),
            Column::Action => ColumnValue::Text(self.action.clone()),
            Column::CourtOutcome => ColumnValue::Text(self.court_outcome.clone()),
            Column::AmountFined => ColumnValue::Real(self.amount_fined),
            Column::Filename => ColumnValue::Text(Some(self.snapshot.to_string())),
        }
    }

    pub fn identity(&self) -> InfractionIdentity {
        InfractionIdentity {
            establishment_id: self.establishment_id,
            inspection_id: self.inspection_id,
            inspection_date: self.inspection_date,
            infraction_details: self.infraction_details.clone(),
            severity: self.severity.clone(),
            action: self.action.clone(),
            court_outcome: self.court_outcome.clone(),
            amount_fined_bits: self.amount_fined.map(f64::to_bits),
        }
    }
}

/// Snapshot-independent identity of an infraction; the same infraction appears in
/// every snapshot captured while it was published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InfractionIdentity {
    pub establishment_id: i64,
    pub inspection_id: i64,
    pub inspection_date: NaiveDate,
    pub infraction_details: Option<String>,
    pub severity: Option<String>,
    pub action: Option<String>,
    pub court_outcome: Option<String>,
    pub amount_fined_bits: Option<u64>,
}

/// Severity buckets counted per inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityBucket {
    Significant,
    Crucial,
    Minor,
    NotApplicable,
}

impl SeverityBucket {
    pub const ALL: [SeverityBucket; 4] = [
        SeverityBucket::Significant,
        SeverityBucket::Crucial,
        SeverityBucket::Minor,
        SeverityBucket::NotApplicable,
    ];

    /// Leading code of the raw severity text (`S - Significant`, `NA - Not Applicable`, ...).
    pub fn code(self) -> &'static str {
        match self {
            SeverityBucket::Significant => "S -",
            SeverityBucket::Crucial => "C -",
            SeverityBucket::Minor => "M -",
            SeverityBucket::NotApplicable => "NA -",
        }
    }

    pub fn count_column(self) -> &'static str {
        match self {
            SeverityBucket::Significant => "num_significant",
            SeverityBucket::Crucial => "num_crucial",
            SeverityBucket::Minor => "num_minor",
            SeverityBucket::NotApplicable => "num_na",
        }
    }

    /// `LIKE` pattern matching every severity of this bucket.
    pub fn like_pattern(self) -> String {
        format!("{}%", self.code())
    }
}

/// Severities kept by the aggregation filter (alongside missing severity).
pub const COUNTED_SEVERITIES: [&str; 3] = ["S - Significant", "C - Crucial", "M - Minor"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EstablishmentKey {
    pub establishment_id: i64,
    pub establishment_type: String,
    pub establishment_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InspectionKey {
    pub establishment: EstablishmentKey,
    pub inspection_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PivotSource {
    Action,
    CourtOutcome,
}

impl PivotSource {
    pub fn column(self) -> Column {
        match self {
            PivotSource::Action => Column::Action,
            PivotSource::CourtOutcome => Column::CourtOutcome,
        }
    }
}

/// A dynamically generated count column, one per distinct action / court outcome value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotColumn {
    pub source: PivotSource,
    /// `None` counts rows where the source column is missing.
    pub value: Option<String>,
    pub name: String,
}

/// One inspection: all infraction rows sharing establishment, date and inspection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub establishment_id: i64,
    pub establishment_type: String,
    pub establishment_address: String,
    pub inspection_date: NaiveDate,
    pub inspection_id: i64,
    pub establishment_status: String,
    pub infractions_summary: Option<String>,
    pub num_significant: i64,
    pub num_crucial: i64,
    pub num_minor: i64,
    pub num_na: i64,
    pub num_infractions: i64,
    /// Keyed by [`PivotColumn::name`].
    pub pivot_counts: BTreeMap<String, i64>,
    pub days_since_previous: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_infraction: Option<bool>,
}

impl Inspection {
    pub fn establishment_key(&self) -> EstablishmentKey {
        EstablishmentKey {
            establishment_id: self.establishment_id,
            establishment_type: self.establishment_type.clone(),
            establishment_address: self.establishment_address.clone(),
        }
    }

    pub fn inspection_key(&self) -> InspectionKey {
        InspectionKey {
            establishment: self.establishment_key(),
            inspection_id: self.inspection_id,
        }
    }

    pub fn missing_coordinates(&self) -> bool {
        self.latitude.is_none() || self.longitude.is_none()
    }
}

/// A geocoding provider answer, as cached in the address table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedAddress {
    pub address: String,
    pub neighbourhood: Option<String>,
    pub locality: Option<String>,
    pub formatted_address: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeocodedAddress {
    /// Cache entry for an address the provider could not resolve.
    pub fn unresolved(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            neighbourhood: None,
            locality: None,
            formatted_address: None,
            postal_code: None,
            latitude: None,
            longitude: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ids_must_be_short_digit_strings() {
        assert_eq!(
            SnapshotId::parse(" 20130723222156 ").unwrap().as_str(),
            "20130723222156"
        );
        assert_eq!(SnapshotId::parse(""), Err(SnapshotIdError::Empty));
        assert!(matches!(
            SnapshotId::parse("2013-07-23"),
            Err(SnapshotIdError::NotNumeric(_))
        ));
        assert!(matches!(
            SnapshotId::parse("123456789012345678901"),
            Err(SnapshotIdError::TooLong(_))
        ));
    }

    #[test]
    fn snapshot_id_deserializes_with_validation() {
        let id: SnapshotId = serde_json::from_str("\"20210626163552\"").unwrap();
        assert_eq!(id.to_string(), "20210626163552");
        assert!(serde_json::from_str::<SnapshotId>("\"abc\"").is_err());
    }

    #[test]
    fn target_schema_validates_names() {
        let schema = TargetSchema::from_names(&["FILENAME", "establishment_id", "severity"]).unwrap();
        assert_eq!(
            schema.column_names(),
            vec!["filename", "establishment_id", "severity"]
        );
        assert_eq!(
            TargetSchema::from_names(&["filename", "bogus"]),
            Err(SchemaError::UnknownColumn("bogus".into()))
        );
        assert_eq!(
            TargetSchema::from_names(&["filename", "action", "ACTION"]),
            Err(SchemaError::DuplicateColumn("action".into()))
        );
        assert_eq!(
            TargetSchema::from_names(&["action"]),
            Err(SchemaError::MissingFilename)
        );
        assert_eq!(TargetSchema::default().columns().len(), 17);
    }

    #[test]
    fn severity_patterns_match_on_leading_code() {
        assert_eq!(SeverityBucket::Significant.like_pattern(), "S -%");
        assert_eq!(SeverityBucket::NotApplicable.like_pattern(), "NA -%");
        assert_eq!(SeverityBucket::Minor.count_column(), "num_minor");
    }
}
