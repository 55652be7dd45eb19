//! Durable record of which catalog items a run has already resolved.

use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogItem;
use crate::output::{read_json_lenient, write_json_atomic, OutputError};

/// Items resolved by earlier runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub processed_models: Vec<CatalogItem>,
    #[serde(default)]
    pub failed_models: Vec<CatalogItem>,
}

impl Checkpoint {
    pub fn is_processed(&self, item: &CatalogItem) -> bool {
        self.processed_models.contains(item)
    }

    pub fn is_failed(&self, item: &CatalogItem) -> bool {
        self.failed_models.contains(item)
    }

    /// Records a success, promoting the item out of `failed_models` if an
    /// earlier run had given up on it.
    pub fn mark_processed(&mut self, item: &CatalogItem) {
        self.failed_models.retain(|failed| failed != item);
        if !self.is_processed(item) {
            self.processed_models.push(item.clone());
        }
    }

    /// Records a failure; an item is listed at most once.
    pub fn mark_failed(&mut self, item: &CatalogItem) {
        if !self.is_failed(item) && !self.is_processed(item) {
            self.failed_models.push(item.clone());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint write failed: {0}")]
    Write(#[from] OutputError),
}

/// Load/save seam between the enrichment loop and checkpoint storage.
pub trait CheckpointStore {
    /// Returns the saved state, or an empty checkpoint when there is none.
    fn load(&self) -> Checkpoint;
    fn save(&self, processed: &[CatalogItem], failed: &[CatalogItem])
        -> Result<(), CheckpointError>;
}

/// Checkpoint kept in a single JSON file, rewritten whole on every save.
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    processed_models: &'a [CatalogItem],
    failed_models: &'a [CatalogItem],
}

impl CheckpointStore for JsonCheckpointStore {
    fn load(&self) -> Checkpoint {
        let checkpoint: Checkpoint = read_json_lenient(&self.path, "checkpoint").unwrap_or_default();
        info!(
            "Checkpoint loaded: {} processed, {} failed",
            checkpoint.processed_models.len(),
            checkpoint.failed_models.len()
        );
        checkpoint
    }

    fn save(
        &self,
        processed: &[CatalogItem],
        failed: &[CatalogItem],
    ) -> Result<(), CheckpointError> {
        write_json_atomic(
            &self.path,
            &CheckpointRef {
                processed_models: processed,
                failed_models: failed,
            },
        )?;
        info!("Checkpoint saved.");
        Ok(())
    }
}
