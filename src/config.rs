//! Persistent run configuration model and defaults.

use std::path::{Path, PathBuf};

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Input and output file locations.
    pub files: FilesConfig,
    #[serde(default)]
    /// Trends provider query and retry settings.
    pub trends: TrendsConfig,
    #[serde(default)]
    /// Run-level behavior.
    pub run: RunConfig,
}

/// Locations of the catalog, checkpoint and output files.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FilesConfig {
    #[serde(default = "default_catalog_path")]
    pub catalog: PathBuf,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint: PathBuf,
    #[serde(default = "default_successful_results_path")]
    pub successful_results: PathBuf,
    #[serde(default = "default_failed_models_path")]
    pub failed_models: PathBuf,
}

/// Query parameters and retry policy for the trends provider.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrendsConfig {
    /// Geographic restriction passed to the provider (ISO country code).
    #[serde(default = "default_geo")]
    pub geo: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Host language sent with every provider request.
    #[serde(default = "default_hl")]
    pub hl: String,
    /// Timezone offset in minutes, as the provider expects it.
    #[serde(default = "default_tz")]
    pub tz: i32,
    /// Attempts per catalog item; values below 1 are raised to 1.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Minimum spacing between two outgoing provider requests.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Run-level switches.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RunConfig {
    /// Re-attempt items recorded as failed by an earlier run.
    #[serde(default = "default_true")]
    pub retry_failed: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Plain-text run log appended to alongside the terminal output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog_path(),
            checkpoint: default_checkpoint_path(),
            successful_results: default_successful_results_path(),
            failed_models: default_failed_models_path(),
        }
    }
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            geo: default_geo(),
            timeframe: default_timeframe(),
            hl: default_hl(),
            tz: default_tz(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            min_request_interval_ms: default_min_request_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retry_failed: default_true(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl RunConfig {
    /// Parses `log_level`, falling back to `Info` for unknown values.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level
            .trim()
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info)
    }
}

fn default_true() -> bool {
    true
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("bikez_part_1.json")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("checkpoint.json")
}

fn default_successful_results_path() -> PathBuf {
    PathBuf::from("successful_results.json")
}

fn default_failed_models_path() -> PathBuf {
    PathBuf::from("failed_models.json")
}

fn default_geo() -> String {
    "FR".to_string()
}

fn default_timeframe() -> String {
    "today 12-m".to_string()
}

fn default_hl() -> String {
    "fr-FR".to_string()
}

fn default_tz() -> i32 {
    360
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    60
}

fn default_min_request_interval_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Errors raised while locating, reading or parsing the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),

    #[error("cannot determine a config directory for this platform")]
    NoConfigDir,

    #[error("config IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("moto-trends").join("config.toml"))
}

/// Clamps values that would make the run meaningless.
pub fn sanitize_config(mut config: Config) -> Config {
    if config.trends.max_retries == 0 {
        config.trends.max_retries = 1;
    }
    config
}

/// Parses a config document from TOML text.
pub fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str::<Config>(content)
        .map(sanitize_config)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// A parsed config and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
    /// Set when the file did not exist and defaults were written out.
    pub created_default: bool,
}

/// Loads the config from an explicit path, or from the default location.
///
/// The default location is created with default values when absent; an
/// explicit path that does not exist is an error. Nothing is logged here
/// because the logger is configured from the result.
pub fn load_config(explicit_path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let mut created_default = false;
    let config_file = match explicit_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            path.to_path_buf()
        }
        None => {
            let path = default_config_path().ok_or(ConfigError::NoConfigDir)?;
            if !path.exists() {
                write_default_config(&path)?;
                created_default = true;
            }
            path
        }
    };

    let content = std::fs::read_to_string(&config_file).map_err(|source| ConfigError::Io {
        path: config_file.clone(),
        source,
    })?;
    let config = parse_config(&content, &config_file)?;
    Ok(LoadedConfig {
        config,
        path: config_file,
        created_default,
    })
}

fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let rendered = toml::to_string(&Config::default())?;
    std::fs::write(path, rendered).map_err(io_error)
}
