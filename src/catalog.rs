//! Input catalog model and loader.

use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One motorcycle model from the input catalog.
///
/// Fields other than `Brand` and `Model` are carried through untouched.
/// Equality compares the whole record, which is what checkpoint matching
/// relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    #[serde(rename = "Brand")]
    pub brand: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogItem {
    pub fn new(brand: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            model: model.into(),
            extra: Map::new(),
        }
    }

    /// Search query sent to the trends provider for this item.
    pub fn trend_query(&self) -> String {
        format!("{} {} motorcycle", self.brand, self.model)
    }

    /// Short label used in log lines.
    pub fn label(&self) -> String {
        format!("{} {}", self.brand, self.model)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads the catalog, a JSON array of records.
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogItem>, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let items: Vec<CatalogItem> =
        serde_json::from_str(&content).map_err(|source| CatalogError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    info!("Catalog loaded: {} models from {}", items.len(), path.display());
    Ok(items)
}
