use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dinesafe_adapters::{GeocodeError, Geocoder};
use dinesafe_core::GeocodedAddress;
use dinesafe_sync::{report_markdown, Pipeline, SyncConfig, PIPELINE_FILE};
use uuid::Uuid;

const SNAPSHOTS: [&str; 2] = ["20190116215713", "20190614092848"];

#[derive(Default)]
struct CountingGeocoder {
    calls: AtomicUsize,
}

#[async_trait]
impl Geocoder for CountingGeocoder {
    fn provider(&self) -> &'static str {
        "counting"
    }

    async fn geocode(
        &self,
        _run_id: Uuid,
        address: &str,
    ) -> Result<Option<GeocodedAddress>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if address.starts_with("400 Bloor") {
            return Ok(None);
        }
        Ok(Some(GeocodedAddress {
            postal_code: Some("M5H 2N2".into()),
            latitude: Some(43.6525),
            longitude: Some(-79.3835),
            ..GeocodedAddress::unresolved(address)
        }))
    }
}

fn stage_workspace(root: &Path) {
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/snapshots");
    for id in SNAPSHOTS {
        let target = root.join("data").join("raw").join(id);
        std::fs::create_dir_all(&target).unwrap();
        std::fs::copy(
            fixtures.join(id).join("dinesafe.xml"),
            target.join("dinesafe.xml"),
        )
        .unwrap();
    }
    std::fs::write(
        root.join(PIPELINE_FILE),
        format!(
            "snapshots: ['{}', '{}']\ngeocode:\n  min_delay_secs: 0\n  max_delay_secs: 0\n",
            SNAPSHOTS[0], SNAPSHOTS[1]
        ),
    )
    .unwrap();
}

fn config(root: &Path) -> SyncConfig {
    let vars = HashMap::from([
        ("DINESAFE_WORKSPACE_ROOT", root.display().to_string()),
        ("DATA_DIR", root.join("data").display().to_string()),
        ("ARTIFACTS_DIR", root.join("artifacts").display().to_string()),
        (
            "DATABASE_URL",
            format!("sqlite://{}", root.join("db").join("dinesafe.db").display()),
        ),
    ]);
    SyncConfig::from_lookup(|key| vars.get(key).cloned())
}

#[tokio::test]
async fn offline_run_loads_filters_labels_and_geocodes() {
    let root = tempfile::tempdir().unwrap();
    stage_workspace(root.path());
    let geocoder = Arc::new(CountingGeocoder::default());

    let pipeline = Pipeline::new(config(root.path()))
        .await
        .unwrap()
        .with_geocoder(Some(geocoder.clone() as Arc<dyn Geocoder>));
    let first = pipeline.run_once().await.unwrap();
    let summary = &first.summary;

    assert_eq!(summary.snapshots_requested, 2);
    assert_eq!(summary.snapshots_downloaded, 0);
    assert_eq!(summary.snapshots_transformed.len(), 2);
    assert_eq!(summary.load.rows_seen, 11);
    assert_eq!(summary.load.rows_inserted, 9);
    assert_eq!(summary.load.rows_skipped, 2);
    assert_eq!(summary.inspections_aggregated, 7);
    assert_eq!(summary.multi_day_removed, 2);
    assert_eq!(summary.reinspections_removed, 1);
    assert_eq!(summary.inspections_labeled, 4);

    let ids = first
        .inspections
        .iter()
        .map(|i| (i.inspection_id, i.is_infraction))
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![
            (5001, Some(true)),
            (5003, Some(false)),
            (5010, Some(false)),
            (5011, Some(false)),
        ]
    );

    let cafe = &first.inspections[0];
    assert_eq!(cafe.num_significant, 1);
    assert_eq!(cafe.num_minor, 1);
    assert_eq!(cafe.latitude, Some(43.6525));
    let sushi = &first.inspections[1];
    assert_eq!(sushi.latitude, Some(43.6510));
    assert_eq!(first.inspections[2].days_since_previous, Some(147));
    assert_eq!(first.inspections[3].latitude, None);

    assert_eq!(summary.geocode.addresses_missing, 2);
    assert_eq!(summary.geocode.resolved, 1);
    assert_eq!(summary.geocode.not_found, 1);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);

    let reports_dir = Path::new(&summary.reports_dir);
    assert!(reports_dir.join("run.json").exists());
    assert!(reports_dir.join("run_summary.md").exists());
    assert!(reports_dir.join("snapshots").join("inspections.parquet").exists());
    assert!(Path::new(&summary.parquet_manifest).exists());
    let task_names = summary
        .tasks
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(task_names.first(), Some(&"prepare_database"));
    assert_eq!(task_names.last(), Some(&"report"));

    // A fresh pipeline over the same database finds everything already loaded and cached.
    let again = Pipeline::new(config(root.path()))
        .await
        .unwrap()
        .with_geocoder(Some(geocoder.clone() as Arc<dyn Geocoder>));
    let second = again.run_once().await.unwrap();
    assert!(second.summary.snapshots_transformed.is_empty());
    assert_eq!(second.summary.load.rows_inserted, 0);
    assert_eq!(second.summary.inspections_labeled, 4);
    assert_eq!(second.summary.geocode.cache_hits, 2);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);

    let digest = report_markdown(5, &root.path().join("reports")).unwrap();
    assert!(digest.contains(&format!("## Run `{}`", summary.run_id)));
    assert!(digest.contains(&format!("## Run `{}`", second.summary.run_id)));
}
