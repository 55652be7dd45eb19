//! Result file model and whole-file JSON writers.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::catalog::CatalogItem;
use crate::regions::RegionalPopularity;

/// One successfully enriched catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(rename = "Brand")]
    pub brand: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Popularity_France")]
    pub popularity_france: Option<f64>,
    #[serde(rename = "Popularity_by_region")]
    pub popularity_by_region: Option<RegionalPopularity>,
}

impl EnrichedRecord {
    pub fn new(
        item: &CatalogItem,
        popularity: Option<f64>,
        regional: Option<RegionalPopularity>,
    ) -> Self {
        Self {
            brand: item.brand.clone(),
            model: item.model.clone(),
            popularity_france: popularity,
            popularity_by_region: regional,
        }
    }

    /// Whether this record was produced for `item`.
    pub fn describes(&self, item: &CatalogItem) -> bool {
        self.brand == item.brand && self.model == item.model
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Renders `value` as JSON indented with four spaces.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(buffer)
}

/// Replaces `path` with the JSON rendering of `value`.
///
/// The bytes land in a sibling temp file first and are renamed over the
/// target, so an interrupted write leaves the previous file intact.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OutputError> {
    let io_error = |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = to_pretty_json(value).map_err(|source| OutputError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp_path).map_err(io_error)?;
    file.write_all(&bytes).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    drop(file);
    std::fs::rename(&tmp_path, path).map_err(io_error)
}

/// Reads a JSON document, treating a missing or unreadable file as absent.
pub fn read_json_lenient<T: DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            warn!("Ignoring unreadable {what} at {}: {error}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!("Ignoring malformed {what} at {}: {error}", path.display());
            None
        }
    }
}

/// Writes a result sequence and logs where it went.
pub fn save_results<T: Serialize>(records: &[T], path: &Path) -> Result<(), OutputError> {
    write_json_atomic(path, records)?;
    info!("Data saved to {}", path.display());
    Ok(())
}

/// Successful records left by earlier runs.
pub fn load_previous_results(path: &Path) -> Vec<EnrichedRecord> {
    read_json_lenient(path, "successful results").unwrap_or_default()
}
