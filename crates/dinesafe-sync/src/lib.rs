//! Pipeline orchestration: snapshot extract, incremental load, inspection
//! aggregation, filtering, labeling, geocoding, exports and scheduling.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod export;
pub mod filter;
pub mod geocode;
pub mod label;
pub mod pipeline;
pub mod report;
pub mod task;

pub use config::{GeocodeSpec, PipelineSpec, SourceSpec, SyncConfig, TableNames, PIPELINE_FILE};
pub use db::{connect_database, prepare_database, LoadOutcome, SnapshotRecords};
pub use export::{ParquetManifest, ParquetManifestFile};
pub use geocode::GeocodeStats;
pub use label::LabelDistribution;
pub use pipeline::{run_pipeline_once_from_env, Pipeline, PipelineOutput, PipelineRunSummary};
pub use report::report_markdown;
pub use task::{TaskPolicy, TaskRunner, TaskTiming};

pub const CRATE_NAME: &str = "dinesafe-sync";

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use dinesafe_core::{InfractionRecord, Inspection, SnapshotId};
    use sqlx::SqlitePool;

    use crate::db::connect_database;

    pub async fn memory_pool() -> SqlitePool {
        connect_database("sqlite::memory:").await.unwrap()
    }

    pub fn snapshot(id: &str) -> SnapshotId {
        SnapshotId::parse(id).unwrap()
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    pub fn record(
        snapshot: &SnapshotId,
        establishment_id: i64,
        inspection_id: i64,
        inspection_date: &str,
        severity: Option<&str>,
    ) -> InfractionRecord {
        InfractionRecord {
            row_id: None,
            establishment_id,
            inspection_id,
            establishment_name: format!("CAFE {establishment_id}"),
            establishment_type: "Restaurant".into(),
            establishment_address: format!("{establishment_id} QUEEN ST W"),
            latitude: None,
            longitude: None,
            establishment_status: "Pass".into(),
            minimum_inspections_per_year: 2,
            infraction_details: severity.map(|_| "Operator fail to properly wash surfaces".into()),
            inspection_date: date(inspection_date),
            severity: severity.map(str::to_string),
            action: severity.map(|_| "Notice to Comply".into()),
            court_outcome: None,
            amount_fined: None,
            snapshot: snapshot.clone(),
        }
    }

    pub fn inspection(establishment_id: i64, inspection_id: i64, inspection_date: &str) -> Inspection {
        Inspection {
            establishment_id,
            establishment_type: "Restaurant".into(),
            establishment_address: format!("{establishment_id} QUEEN ST W"),
            inspection_date: date(inspection_date),
            inspection_id,
            establishment_status: "Pass".into(),
            infractions_summary: None,
            num_significant: 0,
            num_crucial: 0,
            num_minor: 0,
            num_na: 0,
            num_infractions: 0,
            pivot_counts: BTreeMap::new(),
            days_since_previous: None,
            latitude: None,
            longitude: None,
            is_infraction: None,
        }
    }
}
