//! Parquet export of labeled inspections with a hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use dinesafe_core::{Inspection, PivotColumn};
use dinesafe_storage::ArtifactStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const INSPECTIONS_FILE: &str = "inspections.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Fixed inspection columns of the export; pivot columns add `num_*` names.
pub const INSPECTION_COLUMNS: [&str; 15] = [
    "establishment_id",
    "establishmenttype",
    "establishment_address",
    "inspection_date",
    "inspection_id",
    "establishment_status",
    "infractions_summary",
    "num_significant",
    "num_crucial",
    "num_minor",
    "num_na",
    "num_infractions",
    "days_since_previous",
    "latitude",
    "longitude",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Write `snapshots/inspections.parquet` and its manifest under `reports_dir`.
pub async fn export_inspections(
    reports_dir: &Path,
    inspections: &[Inspection],
    pivots: &[PivotColumn],
    label_column: &str,
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let inspections_path = snapshot_dir.join(INSPECTIONS_FILE);
    write_parquet(
        &inspections_path,
        inspections_batch(inspections, pivots, label_column)?,
    )?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry(
            "inspections",
            reports_dir,
            &inspections_path,
            inspections.len(),
        )?],
    };

    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

fn inspections_batch(
    inspections: &[Inspection],
    pivots: &[PivotColumn],
    label_column: &str,
) -> Result<RecordBatch> {
    let mut fields = vec![
        ArrowField::new("establishment_id", DataType::Int64, false),
        ArrowField::new("establishmenttype", DataType::Utf8, false),
        ArrowField::new("establishment_address", DataType::Utf8, false),
        ArrowField::new("inspection_date", DataType::Date32, false),
        ArrowField::new("inspection_id", DataType::Int64, false),
        ArrowField::new("establishment_status", DataType::Utf8, false),
        ArrowField::new("infractions_summary", DataType::Utf8, true),
        ArrowField::new("num_significant", DataType::Int64, false),
        ArrowField::new("num_crucial", DataType::Int64, false),
        ArrowField::new("num_minor", DataType::Int64, false),
        ArrowField::new("num_na", DataType::Int64, false),
        ArrowField::new("num_infractions", DataType::Int64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.establishment_id).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            inspections
                .iter()
                .map(|i| i.establishment_type.as_str())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            inspections
                .iter()
                .map(|i| i.establishment_address.as_str())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            inspections
                .iter()
                .map(|i| days_since_epoch(i.inspection_date))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.inspection_id).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            inspections
                .iter()
                .map(|i| i.establishment_status.as_str())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            inspections
                .iter()
                .map(|i| i.infractions_summary.as_deref())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.num_significant).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.num_crucial).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.num_minor).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.num_na).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            inspections.iter().map(|i| i.num_infractions).collect::<Vec<_>>(),
        )),
    ];

    for pivot in pivots {
        fields.push(ArrowField::new(&pivot.name, DataType::Int64, false));
        columns.push(Arc::new(Int64Array::from(
            inspections
                .iter()
                .map(|i| i.pivot_counts.get(&pivot.name).copied().unwrap_or(0))
                .collect::<Vec<_>>(),
        )));
    }

    fields.extend([
        ArrowField::new("days_since_previous", DataType::Int64, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new(label_column, DataType::Boolean, true),
    ]);
    columns.push(Arc::new(Int64Array::from(
        inspections
            .iter()
            .map(|i| i.days_since_previous)
            .collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(Float64Array::from(
        inspections.iter().map(|i| i.latitude).collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(Float64Array::from(
        inspections.iter().map(|i| i.longitude).collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(BooleanArray::from(
        inspections.iter().map(|i| i.is_infraction).collect::<Vec<_>>(),
    )));

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building inspections record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: ArtifactStore::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
