//! Download-if-missing handling for archived, zipped XML snapshots.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dinesafe_core::SnapshotId;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;
use zip::ZipArchive;

use crate::{ArtifactStore, FetchError, HttpFetcher, StoredArtifact};

/// Per-source concurrency bucket used for archive downloads.
pub const SNAPSHOT_SOURCE_ID: &str = "wayback";

pub const DEFAULT_URL_TEMPLATE: &str =
    "https://web.archive.org/web/{snapshot}/http://opendata.toronto.ca/public.health/dinesafe/dinesafe.zip";

pub const DEFAULT_XML_FILE_NAME: &str = "dinesafe.xml";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("downloading snapshot {snapshot}")]
    Fetch {
        snapshot: SnapshotId,
        #[source]
        source: FetchError,
    },
    #[error("reading archive of snapshot {snapshot}")]
    Zip {
        snapshot: SnapshotId,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("archive of snapshot {snapshot} has no {file}")]
    MissingXml { snapshot: SnapshotId, file: String },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extraction task for snapshot {snapshot} failed")]
    Join {
        snapshot: SnapshotId,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error(transparent)]
    Artifact(#[from] anyhow::Error),
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SnapshotError {
    let context = context.into();
    move |source| SnapshotError::Io { context, source }
}

/// Where snapshots come from and what file each archive must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub url_template: String,
    pub xml_file_name: String,
}

impl Default for SnapshotSource {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            xml_file_name: DEFAULT_XML_FILE_NAME.to_string(),
        }
    }
}

impl SnapshotSource {
    pub fn url_for(&self, snapshot: &SnapshotId) -> String {
        self.url_template.replace("{snapshot}", snapshot.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LocalSnapshot {
    pub id: SnapshotId,
    pub dir: PathBuf,
    pub xml_path: PathBuf,
    pub downloaded: bool,
    pub archive: Option<StoredArtifact>,
}

#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    raw_dir: PathBuf,
    source: SnapshotSource,
    store: ArtifactStore,
    http: Arc<HttpFetcher>,
}

impl SnapshotFetcher {
    pub fn new(
        raw_dir: impl Into<PathBuf>,
        source: SnapshotSource,
        store: ArtifactStore,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            source,
            store,
            http,
        }
    }

    pub fn snapshot_dir(&self, snapshot: &SnapshotId) -> PathBuf {
        self.raw_dir.join(snapshot.as_str())
    }

    /// Make sure the snapshot's XML exists locally, downloading and unpacking it when missing.
    pub async fn ensure_snapshot(
        &self,
        run_id: Uuid,
        snapshot: &SnapshotId,
    ) -> Result<LocalSnapshot, SnapshotError> {
        let dir = self.snapshot_dir(snapshot);
        let xml_path = dir.join(&self.source.xml_file_name);

        let present = fs::try_exists(&xml_path)
            .await
            .map_err(io_error(format!("checking {}", xml_path.display())))?;
        if present {
            info!(%snapshot, path = %xml_path.display(), "found snapshot locally; did nothing");
            return Ok(LocalSnapshot {
                id: snapshot.clone(),
                dir,
                xml_path,
                downloaded: false,
                archive: None,
            });
        }

        let url = self.source.url_for(snapshot);
        info!(%snapshot, %url, path = %xml_path.display(), "downloading snapshot");
        let response = self
            .http
            .fetch_bytes(run_id, SNAPSHOT_SOURCE_ID, &url)
            .await
            .map_err(|source| SnapshotError::Fetch {
                snapshot: snapshot.clone(),
                source,
            })?;

        let archive = self
            .store
            .store_bytes(snapshot.as_str(), "zip", &response.body)
            .await?;

        let body = response.body;
        let target = dir.clone();
        let xml_file_name = self.source.xml_file_name.clone();
        let id = snapshot.clone();
        tokio::task::spawn_blocking(move || extract_archive(&id, &body, &target, &xml_file_name))
            .await
            .map_err(|source| SnapshotError::Join {
                snapshot: snapshot.clone(),
                source,
            })??;

        info!(%snapshot, bytes = archive.byte_size, "snapshot extracted");
        Ok(LocalSnapshot {
            id: snapshot.clone(),
            dir,
            xml_path,
            downloaded: true,
            archive: Some(archive),
        })
    }
}

/// Unpack `bytes` into `target` via a staging directory so a crash never leaves a
/// half-extracted snapshot behind.
pub fn extract_archive(
    snapshot: &SnapshotId,
    bytes: &[u8],
    target: &Path,
    xml_file_name: &str,
) -> Result<(), SnapshotError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_error(format!("creating {}", parent.display())))?;

    let staging = parent.join(format!(".{}.{}.partial", snapshot, Uuid::new_v4()));
    let unpacked = ZipArchive::new(Cursor::new(bytes)).and_then(|mut archive| archive.extract(&staging));
    if let Err(source) = unpacked {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(SnapshotError::Zip {
            snapshot: snapshot.clone(),
            source,
        });
    }

    if !staging.join(xml_file_name).is_file() {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(SnapshotError::MissingXml {
            snapshot: snapshot.clone(),
            file: xml_file_name.to_string(),
        });
    }

    if target.exists() {
        std::fs::remove_dir_all(target)
            .map_err(io_error(format!("removing stale {}", target.display())))?;
    }
    std::fs::rename(&staging, target).map_err(io_error(format!(
        "renaming {} -> {}",
        staging.display(),
        target.display()
    )))
}
