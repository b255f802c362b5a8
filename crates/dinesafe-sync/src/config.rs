//! Environment and `pipeline.yaml` configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use dinesafe_core::{Column, SnapshotId, TargetSchema};
use dinesafe_storage::snapshot::{DEFAULT_URL_TEMPLATE, DEFAULT_XML_FILE_NAME};
use dinesafe_storage::SnapshotSource;
use serde::Deserialize;
use tracing::info;

use crate::export::INSPECTION_COLUMNS;

pub const PIPELINE_FILE: &str = "pipeline.yaml";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub bing_maps_key: Option<String>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            database_url: non_empty("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/dinesafe.db".to_string()),
            data_dir: non_empty("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            artifacts_dir: non_empty("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/artifacts")),
            scheduler_enabled: non_empty("DINESAFE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            // Several schedules are separated by `;` since cron fields use spaces.
            sync_crons: non_empty("DINESAFE_SYNC_CRON")
                .map(|v| {
                    v.split(';')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["0 0 6 * * *".to_string()]),
            user_agent: non_empty("DINESAFE_USER_AGENT")
                .unwrap_or_else(|| "dinesafe-pipeline/0.1".to_string()),
            http_timeout_secs: non_empty("DINESAFE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            bing_maps_key: non_empty("BING_MAPS_KEY"),
            workspace_root: non_empty("DINESAFE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    pub url_template: String,
    pub xml_file_name: String,
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            xml_file_name: DEFAULT_XML_FILE_NAME.to_string(),
        }
    }
}

impl From<&SourceSpec> for SnapshotSource {
    fn from(spec: &SourceSpec) -> Self {
        SnapshotSource {
            url_template: spec.url_template.clone(),
            xml_file_name: spec.xml_file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub infractions: String,
    pub geocoded: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            infractions: "inspections".to_string(),
            geocoded: "addressinfo".to_string(),
        }
    }
}

impl TableNames {
    /// Loaded snapshots are recorded next to the infractions table.
    pub fn ledger(&self) -> String {
        format!("{}_snapshots", self.infractions)
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.infractions)?;
        validate_identifier(&self.geocoded)?;
        if self.infractions.eq_ignore_ascii_case(&self.geocoded) {
            bail!("infractions and geocoded tables must differ (both `{}`)", self.geocoded);
        }
        Ok(())
    }
}

/// Table names are spliced into SQL, so only plain identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || name.len() > 64 || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("`{name}` is not a valid table name");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeocodeSpec {
    pub address_suffix: String,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for GeocodeSpec {
    fn default() -> Self {
        Self {
            address_suffix: ", Toronto, ON, Canada".to_string(),
            min_delay_secs: 1,
            max_delay_secs: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineSpec {
    pub snapshots: Vec<SnapshotId>,
    pub source: SourceSpec,
    pub columns: Vec<String>,
    pub establishment_types: Vec<String>,
    pub tables: TableNames,
    pub label_column: String,
    pub reinspection_window_days: i64,
    pub geocode: GeocodeSpec,
    pub extract_retries: u32,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            snapshots: default_snapshots(),
            source: SourceSpec::default(),
            columns: Column::ALL.iter().map(|c| c.name().to_string()).collect(),
            establishment_types: default_establishment_types(),
            tables: TableNames::default(),
            label_column: "is_infraction".to_string(),
            reinspection_window_days: 2,
            geocode: GeocodeSpec::default(),
            extract_retries: 2,
        }
    }
}

/// Columns read back by deduplication, aggregation and geocoding; a target schema must keep them.
const DOWNSTREAM_COLUMNS: [Column; 13] = [
    Column::EstablishmentId,
    Column::InspectionId,
    Column::EstablishmentType,
    Column::EstablishmentAddress,
    Column::Latitude,
    Column::Longitude,
    Column::EstablishmentStatus,
    Column::InfractionDetails,
    Column::InspectionDate,
    Column::Severity,
    Column::Action,
    Column::CourtOutcome,
    Column::AmountFined,
];

impl PipelineSpec {
    /// Read `pipeline.yaml` from the workspace root; a missing file means all defaults.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(PIPELINE_FILE);
        if !path.exists() {
            info!(path = %path.display(), "no pipeline file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let spec: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        spec.validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        self.tables.validate()?;
        self.target_schema()?;
        let label = self.label_column.as_str();
        if label.trim().is_empty() {
            bail!("label_column must not be empty");
        }
        if label.starts_with("num_") || INSPECTION_COLUMNS.contains(&label) {
            bail!("label_column `{label}` collides with an exported inspection column");
        }
        if self.reinspection_window_days < 0 {
            bail!("reinspection_window_days must not be negative");
        }
        if self.geocode.min_delay_secs > self.geocode.max_delay_secs {
            bail!(
                "geocode.min_delay_secs ({}) exceeds geocode.max_delay_secs ({})",
                self.geocode.min_delay_secs,
                self.geocode.max_delay_secs
            );
        }
        Ok(())
    }

    pub fn target_schema(&self) -> Result<TargetSchema> {
        let schema = TargetSchema::from_names(self.columns.as_slice())?;
        for column in DOWNSTREAM_COLUMNS {
            if !schema.columns().contains(&column) {
                bail!("target columns must include `{}`", column.name());
            }
        }
        Ok(schema)
    }
}

pub fn default_snapshots() -> Vec<SnapshotId> {
    [
        "20130723222156",
        "20150603085055",
        "20151012004454",
        "20160129205023",
        "20160317045436",
        "20160915001010",
        "20170303162206",
        "20170330001043",
        "20170726115444",
        "20190116215713",
        "20190126084933",
        "20190614092848",
        "20210626163552",
    ]
    .into_iter()
    .filter_map(|id| SnapshotId::parse(id).ok())
    .collect()
}

pub fn default_establishment_types() -> Vec<String> {
    [
        "Restaurant",
        "Food Take Out",
        "Food Store (Convenience / Variety)",
        "Food Court Vendor",
        "Supermarket",
        "Bakery",
        "Butcher Shop",
        "Cafeteria - Public Access",
        "Cocktail Bar / Beverage Room",
        "Fish Shop",
        "Bake Shop",
        "Flea Market",
        "Farmer's Market",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
