//! Pipeline orchestration: task sequence, run summaries and scheduled runs.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dinesafe_adapters::{read_snapshot_records, BingGeocoder, Geocoder};
use dinesafe_core::{Inspection, PivotColumn, SnapshotId, TargetSchema};
use dinesafe_storage::snapshot::{LocalSnapshot, SnapshotFetcher, SnapshotSource};
use dinesafe_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::aggregate::{aggregate_inspections, pivot_columns};
use crate::config::{PipelineSpec, SyncConfig};
use crate::db::{
    connect_database, load_snapshots, loaded_snapshot_ids, prepare_database, LoadOutcome,
    SnapshotRecords,
};
use crate::export::export_inspections;
use crate::filter::{remove_multi_day_inspections, remove_reinspections};
use crate::geocode::{geocode_missing_coordinates, GeocodeStats};
use crate::label::{label_inspections, LabelDistribution};
use crate::report::write_run_reports;
use crate::task::{TaskPolicy, TaskRunner, TaskTiming};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_url: String,
    pub snapshots_requested: usize,
    pub snapshots_downloaded: usize,
    pub snapshots_transformed: Vec<SnapshotId>,
    pub load: LoadOutcome,
    pub pivot_columns: Vec<String>,
    pub inspections_aggregated: usize,
    pub multi_day_removed: usize,
    pub reinspections_removed: usize,
    pub inspections_labeled: usize,
    pub labels: LabelDistribution,
    pub geocode: GeocodeStats,
    pub tasks: Vec<TaskTiming>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub summary: PipelineRunSummary,
    /// Labeled inspections, sorted by establishment, inspection id and date.
    pub inspections: Vec<Inspection>,
}

struct Extracted {
    snapshots: Vec<LocalSnapshot>,
    already_loaded: BTreeSet<SnapshotId>,
}

pub struct Pipeline {
    config: SyncConfig,
    spec: PipelineSpec,
    schema: TargetSchema,
    pool: SqlitePool,
    fetcher: SnapshotFetcher,
    geocoder: Option<Arc<dyn Geocoder>>,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub async fn from_env() -> Result<Self> {
        Self::new(SyncConfig::from_env()).await
    }

    /// Load `pipeline.yaml` from the workspace root and connect to the configured database.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let spec = PipelineSpec::load(&config.workspace_root)?;
        let pool = connect_database(&config.database_url).await?;
        Self::with_pool(config, spec, pool)
    }

    pub fn with_pool(config: SyncConfig, spec: PipelineSpec, pool: SqlitePool) -> Result<Self> {
        spec.validate()?;
        let schema = spec.target_schema()?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let fetcher = SnapshotFetcher::new(
            config.raw_dir(),
            SnapshotSource::from(&spec.source),
            ArtifactStore::new(config.artifacts_dir.clone()),
            Arc::clone(&http),
        );
        let geocoder = config.bing_maps_key.clone().map(|key| {
            Arc::new(BingGeocoder::new(Arc::clone(&http), key)) as Arc<dyn Geocoder>
        });

        Ok(Self {
            config,
            spec,
            schema,
            pool,
            fetcher,
            geocoder,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_geocoder(mut self, geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        prepare_database(&self.pool, &self.spec.tables, &self.schema).await
    }

    /// Run every stage once. Concurrent calls are serialized.
    pub async fn run_once(&self) -> Result<PipelineOutput> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<PipelineOutput> {
        let started_at = Utc::now();
        let mut runner = TaskRunner::new(run_id);
        info!(snapshots = self.spec.snapshots.len(), "pipeline run started");

        runner.run_once("prepare_database", self.migrate()).await?;

        let extract_policy = TaskPolicy::retrying(self.spec.extract_retries, Duration::ZERO);
        let extracted = runner
            .run("extract", extract_policy, move || self.extract(run_id))
            .await?;
        let snapshots_downloaded = extracted.snapshots.iter().filter(|s| s.downloaded).count();

        let batches = runner.run_once("transform", self.transform(&extracted)).await?;
        let snapshots_transformed = batches.iter().map(|b| b.snapshot.clone()).collect::<Vec<_>>();

        let load = runner
            .run_once(
                "load",
                load_snapshots(&self.pool, &self.spec.tables, &self.schema, batches),
            )
            .await?;

        let (pivots, aggregated) = runner.run_once("aggregate", self.aggregate()).await?;
        let inspections_aggregated = aggregated.len();

        let single_day = runner
            .run_once("remove_multi_day_inspections", async {
                Ok(remove_multi_day_inspections(aggregated))
            })
            .await?;
        let multi_day_removed = inspections_aggregated - single_day.len();

        let window = self.spec.reinspection_window_days;
        let before_reinspections = single_day.len();
        let first_visits = runner
            .run_once("remove_reinspections", async {
                Ok(remove_reinspections(single_day, window))
            })
            .await?;
        let reinspections_removed = before_reinspections - first_visits.len();

        let mut inspections = runner
            .run_once("label", async {
                let mut labeled = first_visits;
                label_inspections(&mut labeled);
                Ok(labeled)
            })
            .await?;
        let labels = LabelDistribution::from_inspections(&self.spec.label_column, &inspections);

        let geocode = runner
            .run_once(
                "geocode",
                geocode_missing_coordinates(
                    &self.pool,
                    &self.spec.tables,
                    &mut inspections,
                    self.geocoder.as_deref(),
                    &self.spec.geocode,
                    run_id,
                ),
            )
            .await?;

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        let manifest_path = runner
            .run_once(
                "export",
                export_inspections(&reports_dir, &inspections, &pivots, &self.spec.label_column),
            )
            .await?;

        let mut summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            database_url: self.config.database_url.clone(),
            snapshots_requested: extracted.snapshots.len(),
            snapshots_downloaded,
            snapshots_transformed,
            load,
            pivot_columns: pivots.iter().map(|p| p.name.clone()).collect(),
            inspections_aggregated,
            multi_day_removed,
            reinspections_removed,
            inspections_labeled: inspections.len(),
            labels,
            geocode,
            tasks: runner.timings().to_vec(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        runner
            .run_once("report", write_run_reports(&reports_dir, &summary))
            .await?;
        summary.tasks = runner.timings().to_vec();

        info!(
            rows_inserted = summary.load.rows_inserted,
            inspections = summary.inspections_labeled,
            reports_dir = %summary.reports_dir,
            "pipeline run finished"
        );
        Ok(PipelineOutput {
            summary,
            inspections,
        })
    }

    async fn extract(&self, run_id: Uuid) -> Result<Extracted> {
        let mut seen = HashSet::new();
        let mut snapshots = Vec::new();
        for id in &self.spec.snapshots {
            if !seen.insert(id) {
                continue;
            }
            let local = self
                .fetcher
                .ensure_snapshot(run_id, id)
                .await
                .with_context(|| format!("extracting snapshot {id}"))?;
            snapshots.push(local);
        }
        let already_loaded = loaded_snapshot_ids(&self.pool, &self.spec.tables).await?;
        Ok(Extracted {
            snapshots,
            already_loaded,
        })
    }

    async fn transform(&self, extracted: &Extracted) -> Result<Vec<SnapshotRecords>> {
        let mut handles = Vec::new();
        for local in &extracted.snapshots {
            if extracted.already_loaded.contains(&local.id) {
                info!(
                    snapshot = %local.id,
                    table = %self.spec.tables.infractions,
                    "snapshot found in database table; did nothing"
                );
                continue;
            }
            let path = local.xml_path.clone();
            info!(snapshot = %local.id, path = %path.display(), "transforming snapshot");
            handles.push((
                local.id.clone(),
                tokio::task::spawn_blocking(move || read_snapshot_records(&path)),
            ));
        }

        let mut batches = Vec::with_capacity(handles.len());
        for (snapshot, handle) in handles {
            let records = handle
                .await
                .with_context(|| format!("transform of snapshot {snapshot} did not complete"))?
                .with_context(|| format!("transforming snapshot {snapshot}"))?;
            info!(snapshot = %snapshot, rows = records.len(), "transformed snapshot");
            batches.push(SnapshotRecords { snapshot, records });
        }
        Ok(batches)
    }

    async fn aggregate(&self) -> Result<(Vec<PivotColumn>, Vec<Inspection>)> {
        let table = &self.spec.tables.infractions;
        let pivots = pivot_columns(&self.pool, table).await?;
        let inspections =
            aggregate_inspections(&self.pool, table, &self.spec.establishment_types, &pivots)
                .await?;
        Ok((pivots, inspections))
    }

    /// One job per configured cron expression, each running the whole pipeline.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.sync_crons {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(output) => info!(
                            run_id = %output.summary.run_id,
                            reports_dir = %output.summary.reports_dir,
                            "scheduled pipeline run finished"
                        ),
                        Err(err) => {
                            error!(error = %format!("{err:#}"), "scheduled pipeline run failed")
                        }
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%cron, "scheduled pipeline runs");
        }
        Ok(Some(sched))
    }
}

pub async fn run_pipeline_once_from_env() -> Result<PipelineOutput> {
    Pipeline::from_env().await?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(root: &std::path::Path, scheduler: bool) -> SyncConfig {
        let root = root.display().to_string();
        let vars = HashMap::from([
            ("DINESAFE_WORKSPACE_ROOT", root),
            (
                "DINESAFE_SCHEDULER_ENABLED",
                if scheduler { "true" } else { "false" }.to_string(),
            ),
        ]);
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::test_support::memory_pool().await;
        let disabled = Arc::new(
            Pipeline::with_pool(config(dir.path(), false), PipelineSpec::default(), pool.clone())
                .unwrap(),
        );
        assert!(disabled.maybe_build_scheduler().await.unwrap().is_none());

        let enabled = Arc::new(
            Pipeline::with_pool(config(dir.path(), true), PipelineSpec::default(), pool).unwrap(),
        );
        assert!(enabled.maybe_build_scheduler().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migrate_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::test_support::memory_pool().await;
        let pipeline =
            Pipeline::with_pool(config(dir.path(), false), PipelineSpec::default(), pool).unwrap();
        pipeline.migrate().await.unwrap();
        let tables = &pipeline.spec().tables;
        for table in [&tables.infractions, &tables.geocoded, &tables.ledger()] {
            assert_eq!(crate::db::count_rows(pipeline.pool(), table).await.unwrap(), 0);
        }
    }
}
