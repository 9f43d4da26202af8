//! Persistent storage for drill results.
//!
//! Each completed repeat is written as one JSON file, organised by
//! year/month. Result ids are UUID v7, so the id alone is enough to find the
//! file again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::types::DrillRepeatSummary;

/// Errors from the result store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No result with this id exists.
    #[error("{0}")]
    NotFound(String),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A result file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A persisted repeat result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    /// Result identifier (UUID v7).
    pub id: String,
    /// Name of the drill the repeat belongs to.
    pub drill_name: String,
    /// When the result was written.
    pub saved_at: DateTime<Utc>,
    /// The repeat summary, with `drill_result_id` set to `id`.
    pub summary: DrillRepeatSummary,
}

/// Somewhere completed repeats can be kept.
pub trait ResultStore: Send + Sync {
    /// Persists a summary and returns its new id.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the result cannot be written.
    fn save(&self, drill_name: &str, summary: &DrillRepeatSummary) -> StorageResult<String>;

    /// Loads a previously saved result.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown ids.
    fn load(&self, id: &str) -> StorageResult<StoredResult>;
}

/// [`ResultStore`] writing pretty-printed JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    data_dir: PathBuf,
}

impl JsonResultStore {
    /// Creates a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn result_path(&self, id: &Uuid, saved_at: DateTime<Utc>) -> PathBuf {
        self.data_dir
            .join("results")
            .join(format!("{}", saved_at.year()))
            .join(format!("{:02}", saved_at.month()))
            .join(format!("{id}.json"))
    }
}

/// Creation time embedded in a v7 id.
fn id_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}

impl ResultStore for JsonResultStore {
    fn save(&self, drill_name: &str, summary: &DrillRepeatSummary) -> StorageResult<String> {
        let id = Uuid::now_v7();
        let saved_at = id_timestamp(&id).unwrap_or_else(Utc::now);

        let mut summary = summary.clone();
        summary.attach_result_id(id.to_string());
        let record = StoredResult {
            id: id.to_string(),
            drill_name: drill_name.to_string(),
            saved_at,
            summary,
        };

        let path = self.result_path(&id, saved_at);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        tracing::debug!(path = %path.display(), "Saved drill result");
        Ok(record.id)
    }

    fn load(&self, id: &str) -> StorageResult<StoredResult> {
        let not_found = || StorageError::NotFound(id.to_string());
        let uuid = Uuid::parse_str(id).map_err(|_| not_found())?;
        let saved_at = id_timestamp(&uuid).ok_or_else(not_found)?;

        let path = self.result_path(&uuid, saved_at);
        if !path.exists() {
            return Err(not_found());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
