//! Checkpointed popularity enrichment run.
//!
//! Each catalog item is looked up, apportioned and persisted before the
//! next one starts, so killing the process loses at most the item in flight.

use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};

use crate::catalog::{load_catalog, CatalogError, CatalogItem};
use crate::checkpoint::{CheckpointError, CheckpointStore, JsonCheckpointStore};
use crate::config::{Config, ConfigError};
use crate::output::{load_previous_results, save_results, EnrichedRecord, OutputError};
use crate::regions::{apportion, RegionWeights};
use crate::trends::google::GoogleTrendsClient;
use crate::trends::TrendSource;

/// Blocking pause between retry attempts.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps the current thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How many times a lookup is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

/// Result of looking up one catalog item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupOutcome {
    /// Mean of a non-empty series.
    Measured(f64),
    /// The provider answered with no data; not retried.
    NoSignal,
    /// Every attempt errored.
    Exhausted,
}

impl LookupOutcome {
    /// National popularity, `Some(0.0)` for `NoSignal` and `None` once
    /// retries are exhausted.
    pub fn popularity(self) -> Option<f64> {
        match self {
            Self::Measured(value) => Some(value),
            Self::NoSignal => Some(0.0),
            Self::Exhausted => None,
        }
    }
}

/// Looks up the national popularity of `item`, retrying errors with a fixed
/// backoff. Sleeps between attempts but never after the last one.
pub fn fetch_popularity(
    source: &mut dyn TrendSource,
    sleeper: &mut dyn Sleeper,
    item: &CatalogItem,
    geo: &str,
    timeframe: &str,
    policy: RetryPolicy,
) -> LookupOutcome {
    let query = item.trend_query();
    for attempt in 1..=policy.max_retries {
        match source.interest_over_time(&query, geo, timeframe) {
            Ok(series) => {
                return match series.mean() {
                    Some(average) => {
                        info!("Success: {query} - average popularity: {average}");
                        LookupOutcome::Measured(average)
                    }
                    None => {
                        warn!("No results for: {query}");
                        LookupOutcome::NoSignal
                    }
                };
            }
            Err(lookup_error) => {
                error!(
                    "Error for {query}, attempt {attempt}/{}: {lookup_error}",
                    policy.max_retries
                );
                if attempt < policy.max_retries {
                    sleeper.sleep(policy.backoff);
                }
            }
        }
    }
    warn!(
        "Failed after {} attempts for: {query}",
        policy.max_retries
    );
    LookupOutcome::Exhausted
}

/// Errors that abort a run. Lookup failures never end up here.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Per-run knobs for [`Enricher`].
#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub geo: String,
    pub timeframe: String,
    pub retry: RetryPolicy,
    pub retry_failed: bool,
    pub successful_results_path: PathBuf,
    pub failed_models_path: PathBuf,
}

impl EnrichSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            geo: config.trends.geo.clone(),
            timeframe: config.trends.timeframe.clone(),
            retry: RetryPolicy {
                max_retries: config.trends.max_retries,
                backoff: Duration::from_secs(config.trends.retry_backoff_secs),
            },
            retry_failed: config.run.retry_failed,
            successful_results_path: config.files.successful_results.clone(),
            failed_models_path: config.files.failed_models.clone(),
        }
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Catalog items left alone because the checkpoint already covers them.
    pub skipped: usize,
}

/// Drives one enrichment run over a catalog.
pub struct Enricher<T, Z, C> {
    source: T,
    sleeper: Z,
    store: C,
    weights: RegionWeights,
    settings: EnrichSettings,
}

impl<T, Z, C> Enricher<T, Z, C>
where
    T: TrendSource,
    Z: Sleeper,
    C: CheckpointStore,
{
    pub fn new(
        source: T,
        sleeper: Z,
        store: C,
        weights: RegionWeights,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            source,
            sleeper,
            store,
            weights,
            settings,
        }
    }

    pub fn source(&self) -> &T {
        &self.source
    }

    pub fn sleeper(&self) -> &Z {
        &self.sleeper
    }

    /// Processes every catalog item the checkpoint does not already cover.
    ///
    /// Results, failures and the checkpoint are rewritten after each item.
    /// The successful-results file accumulates across resumed runs.
    pub fn run(&mut self, catalog: &[CatalogItem]) -> Result<RunSummary, EnrichError> {
        let mut checkpoint = self.store.load();
        let mut successful_results = load_previous_results(&self.settings.successful_results_path);
        // A crash between the results write and the checkpoint save leaves a
        // record for an item that will be looked up again.
        let loaded_results = successful_results.len();
        successful_results.retain(|record| {
            checkpoint
                .processed_models
                .iter()
                .any(|item| record.describes(item))
        });
        if successful_results.len() < loaded_results {
            warn!(
                "Dropped {} earlier results not covered by the checkpoint",
                loaded_results - successful_results.len()
            );
        }

        let retry_failed = self.settings.retry_failed;
        let remaining: Vec<&CatalogItem> = catalog
            .iter()
            .filter(|item| !checkpoint.is_processed(item))
            .filter(|item| retry_failed || !checkpoint.is_failed(item))
            .collect();

        let mut summary = RunSummary {
            skipped: catalog.len() - remaining.len(),
            ..RunSummary::default()
        };
        info!(
            "{} of {} models to process ({} regions, {} earlier results kept)",
            remaining.len(),
            catalog.len(),
            self.weights.len(),
            successful_results.len()
        );

        for (index, item) in remaining.into_iter().enumerate() {
            info!("[{}/{}] {}", index + 1, catalog.len() - summary.skipped, item.label());
            let outcome = fetch_popularity(
                &mut self.source,
                &mut self.sleeper,
                item,
                &self.settings.geo,
                &self.settings.timeframe,
                self.settings.retry,
            );

            match outcome.popularity() {
                Some(popularity) => {
                    let regional = apportion(Some(popularity), &self.weights);
                    successful_results.push(EnrichedRecord::new(item, Some(popularity), regional));
                    checkpoint.mark_processed(item);
                    summary.succeeded += 1;
                }
                None => {
                    checkpoint.mark_failed(item);
                    summary.failed += 1;
                }
            }

            save_results(&successful_results, &self.settings.successful_results_path)?;
            save_results(&checkpoint.failed_models, &self.settings.failed_models_path)?;
            self.store
                .save(&checkpoint.processed_models, &checkpoint.failed_models)?;
        }

        info!(
            "Processing complete: {} succeeded, {} failed, {} skipped",
            summary.succeeded, summary.failed, summary.skipped
        );
        Ok(summary)
    }
}

/// Runs a full job against Google Trends as described by `config`.
pub fn run_job(config: &Config) -> Result<RunSummary, EnrichError> {
    let catalog = load_catalog(&config.files.catalog)?;
    let mut enricher = Enricher::new(
        GoogleTrendsClient::new(&config.trends),
        ThreadSleeper,
        JsonCheckpointStore::new(config.files.checkpoint.clone()),
        RegionWeights::french_regions(),
        EnrichSettings::from_config(config),
    );
    enricher.run(&catalog)
}

#[cfg(test)]
mod tests {
    use super::{
        fetch_popularity, EnrichError, EnrichSettings, Enricher, LookupOutcome, RetryPolicy,
        RunSummary, Sleeper,
    };
    use crate::catalog::CatalogItem;
    use crate::checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore};
    use crate::output::{load_previous_results, save_results, EnrichedRecord};
    use crate::regions::{apportion, RegionWeights};
    use crate::trends::{TrendError, TrendSeries, TrendSource};
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::time::Duration;

    /// Replays canned answers per query and records every call.
    #[derive(Default)]
    struct ScriptedSource {
        answers: HashMap<String, VecDeque<Result<TrendSeries, TrendError>>>,
        calls: Vec<String>,
    }

    impl ScriptedSource {
        fn answer(mut self, query: &str, answer: Result<TrendSeries, TrendError>) -> Self {
            self.answers
                .entry(query.to_string())
                .or_default()
                .push_back(answer);
            self
        }

        fn calls_for(&self, query: &str) -> usize {
            self.calls.iter().filter(|call| call.as_str() == query).count()
        }
    }

    impl TrendSource for ScriptedSource {
        fn interest_over_time(
            &mut self,
            query: &str,
            _geo: &str,
            _timeframe: &str,
        ) -> Result<TrendSeries, TrendError> {
            self.calls.push(query.to_string());
            self.answers
                .get_mut(query)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(TrendError::Transport("connection reset".to_string())))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Vec<Duration>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&mut self, duration: Duration) {
            self.sleeps.push(duration);
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_secs(60),
        }
    }

    fn settings(dir: &Path, retry_failed: bool) -> EnrichSettings {
        EnrichSettings {
            geo: "FR".to_string(),
            timeframe: "today 12-m".to_string(),
            retry: policy(3),
            retry_failed,
            successful_results_path: dir.join("successful_results.json"),
            failed_models_path: dir.join("failed_models.json"),
        }
    }

    fn half_half() -> RegionWeights {
        RegionWeights::new([("A", 0.5), ("B", 0.5)])
    }

    fn enricher(
        dir: &Path,
        source: ScriptedSource,
        retry_failed: bool,
    ) -> Enricher<ScriptedSource, RecordingSleeper, JsonCheckpointStore> {
        Enricher::new(
            source,
            RecordingSleeper::default(),
            JsonCheckpointStore::new(dir.join("checkpoint.json")),
            half_half(),
            settings(dir, retry_failed),
        )
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).expect("file should be readable"))
            .expect("file should hold json")
    }

    fn yamaha() -> CatalogItem {
        CatalogItem::new("Yamaha", "MT-07")
    }

    const YAMAHA_QUERY: &str = "Yamaha MT-07 motorcycle";

    #[test]
    fn test_retry_bound_when_lookup_always_fails() {
        let mut source = ScriptedSource::default();
        let mut sleeper = RecordingSleeper::default();
        let outcome = fetch_popularity(
            &mut source,
            &mut sleeper,
            &yamaha(),
            "FR",
            "today 12-m",
            policy(3),
        );
        assert_eq!(outcome, LookupOutcome::Exhausted);
        assert_eq!(outcome.popularity(), None);
        assert_eq!(source.calls_for(YAMAHA_QUERY), 3);
        assert_eq!(sleeper.sleeps, vec![Duration::from_secs(60); 2]);
    }

    #[test]
    fn test_retry_bound_honours_configured_count() {
        let mut source = ScriptedSource::default();
        let mut sleeper = RecordingSleeper::default();
        fetch_popularity(&mut source, &mut sleeper, &yamaha(), "FR", "today 12-m", policy(5));
        assert_eq!(source.calls.len(), 5);
        assert_eq!(sleeper.sleeps.len(), 4);
    }

    #[test]
    fn test_success_after_transient_errors_stops_retrying() {
        let mut source = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Err(TrendError::RateLimited))
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[30.0, 50.0])));
        let mut sleeper = RecordingSleeper::default();
        let outcome = fetch_popularity(
            &mut source,
            &mut sleeper,
            &yamaha(),
            "FR",
            "today 12-m",
            policy(3),
        );
        assert_eq!(outcome, LookupOutcome::Measured(40.0));
        assert_eq!(source.calls.len(), 2);
        assert_eq!(sleeper.sleeps.len(), 1);
    }

    #[test]
    fn test_empty_series_is_terminal_zero() {
        let mut source =
            ScriptedSource::default().answer(YAMAHA_QUERY, Ok(TrendSeries::empty(YAMAHA_QUERY)));
        let mut sleeper = RecordingSleeper::default();
        let outcome = fetch_popularity(
            &mut source,
            &mut sleeper,
            &yamaha(),
            "FR",
            "today 12-m",
            policy(3),
        );
        assert_eq!(outcome, LookupOutcome::NoSignal);
        assert_eq!(outcome.popularity(), Some(0.0));
        assert_eq!(source.calls.len(), 1);
        assert!(sleeper.sleeps.is_empty());
    }

    #[test]
    fn test_single_success_writes_record_and_checkpoint() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let source = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[80.0])));
        let mut enricher = enricher(dir.path(), source, true);

        let summary = enricher.run(&[yamaha()]).expect("run should succeed");
        assert_eq!(
            summary,
            RunSummary {
                succeeded: 1,
                failed: 0,
                skipped: 0
            }
        );
        assert_eq!(
            read_json(&dir.path().join("successful_results.json")),
            json!([{
                "Brand": "Yamaha",
                "Model": "MT-07",
                "Popularity_France": 80.0,
                "Popularity_by_region": {"A": 40.0, "B": 40.0}
            }])
        );
        assert_eq!(read_json(&dir.path().join("failed_models.json")), json!([]));
        let checkpoint = JsonCheckpointStore::new(dir.path().join("checkpoint.json")).load();
        assert_eq!(checkpoint.processed_models, vec![yamaha()]);
        assert!(checkpoint.failed_models.is_empty());
    }

    #[test]
    fn test_exhausted_lookup_records_failure() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let mut enricher = enricher(dir.path(), ScriptedSource::default(), true);

        let summary = enricher.run(&[yamaha()]).expect("run should succeed");
        assert_eq!(summary.failed, 1);
        assert_eq!(enricher.source().calls.len(), 3);
        assert_eq!(enricher.sleeper().sleeps.len(), 2);
        assert_eq!(read_json(&dir.path().join("successful_results.json")), json!([]));
        assert_eq!(
            read_json(&dir.path().join("failed_models.json")),
            json!([{"Brand": "Yamaha", "Model": "MT-07"}])
        );
        let checkpoint = JsonCheckpointStore::new(dir.path().join("checkpoint.json")).load();
        assert!(checkpoint.processed_models.is_empty());
        assert_eq!(checkpoint.failed_models, vec![yamaha()]);
    }

    #[test]
    fn test_empty_series_is_recorded_as_processed_with_zero_regions() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let source =
            ScriptedSource::default().answer(YAMAHA_QUERY, Ok(TrendSeries::empty(YAMAHA_QUERY)));
        let mut enricher = enricher(dir.path(), source, true);

        enricher.run(&[yamaha()]).expect("run should succeed");
        assert_eq!(
            read_json(&dir.path().join("successful_results.json")),
            json!([{
                "Brand": "Yamaha",
                "Model": "MT-07",
                "Popularity_France": 0.0,
                "Popularity_by_region": {"A": 0.0, "B": 0.0}
            }])
        );
        let checkpoint = JsonCheckpointStore::new(dir.path().join("checkpoint.json")).load();
        assert_eq!(checkpoint.processed_models, vec![yamaha()]);
        assert!(checkpoint.failed_models.is_empty());
    }

    #[test]
    fn test_processed_items_are_not_looked_up_again() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let honda = CatalogItem::new("Honda", "CB500F");
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));
        store
            .save(&[yamaha()], &[])
            .expect("seed checkpoint should save");
        let source = ScriptedSource::default().answer(
            "Honda CB500F motorcycle",
            Ok(TrendSeries::from_values("Honda CB500F motorcycle", &[10.0])),
        );
        let mut enricher = enricher(dir.path(), source, true);

        let summary = enricher
            .run(&[yamaha(), honda.clone()])
            .expect("run should succeed");
        assert_eq!(summary.skipped, 1);
        assert_eq!(enricher.source().calls_for(YAMAHA_QUERY), 0);
        assert_eq!(enricher.source().calls, vec!["Honda CB500F motorcycle".to_string()]);
        let checkpoint = store.load();
        assert_eq!(checkpoint.processed_models, vec![yamaha(), honda]);
    }

    #[test]
    fn test_results_accumulate_across_resumed_runs() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let honda = CatalogItem::new("Honda", "CB500F");
        let catalog = vec![yamaha(), honda];

        let first = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[80.0])));
        enricher(dir.path(), first, true)
            .run(&catalog)
            .expect("first run should succeed");

        let second = ScriptedSource::default().answer(
            "Honda CB500F motorcycle",
            Ok(TrendSeries::from_values("Honda CB500F motorcycle", &[20.0])),
        );
        let mut resumed = enricher(dir.path(), second, true);
        let summary = resumed.run(&catalog).expect("second run should succeed");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(resumed.source().calls_for(YAMAHA_QUERY), 0);

        let results = read_json(&dir.path().join("successful_results.json"));
        let models: Vec<&str> = results
            .as_array()
            .expect("results should be an array")
            .iter()
            .filter_map(|record| record["Model"].as_str())
            .collect();
        assert_eq!(models, vec!["MT-07", "CB500F"]);
        assert_eq!(read_json(&dir.path().join("failed_models.json")), json!([]));
    }

    #[test]
    fn test_result_written_before_checkpoint_is_not_duplicated() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let results_path = dir.path().join("successful_results.json");
        let stale = EnrichedRecord::new(
            &yamaha(),
            Some(80.0),
            apportion(Some(80.0), &half_half()),
        );
        save_results(&[stale], &results_path).expect("seed results should save");
        let source = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[80.0])));
        let mut enricher = enricher(dir.path(), source, true);

        enricher.run(&[yamaha()]).expect("run should succeed");
        assert_eq!(enricher.source().calls_for(YAMAHA_QUERY), 1);
        let results = read_json(&results_path);
        assert_eq!(results.as_array().map(Vec::len), Some(1));
        assert_eq!(results[0]["Popularity_France"], json!(80.0));
    }

    #[test]
    fn test_earlier_result_of_processed_item_is_kept() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let results_path = dir.path().join("successful_results.json");
        let earlier = EnrichedRecord::new(
            &yamaha(),
            Some(55.0),
            apportion(Some(55.0), &half_half()),
        );
        save_results(&[earlier.clone()], &results_path).expect("seed results should save");
        JsonCheckpointStore::new(dir.path().join("checkpoint.json"))
            .save(&[yamaha()], &[])
            .expect("seed checkpoint should save");
        let honda = CatalogItem::new("Honda", "CB500F");

        enricher(dir.path(), ScriptedSource::default(), true)
            .run(&[yamaha(), honda])
            .expect("run should succeed");
        assert_eq!(load_previous_results(&results_path), vec![earlier]);
    }

    #[test]
    fn test_failed_item_is_retried_and_promoted_on_success() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&[], &[yamaha()]).expect("seed checkpoint should save");
        let source = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[12.0])));

        enricher(dir.path(), source, true)
            .run(&[yamaha()])
            .expect("run should succeed");
        assert_eq!(
            store.load(),
            Checkpoint {
                processed_models: vec![yamaha()],
                failed_models: Vec::new(),
            }
        );
        assert_eq!(read_json(&dir.path().join("failed_models.json")), json!([]));
    }

    #[test]
    fn test_failed_item_failing_again_is_listed_once() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&[], &[yamaha()]).expect("seed checkpoint should save");

        enricher(dir.path(), ScriptedSource::default(), true)
            .run(&[yamaha()])
            .expect("run should succeed");
        assert_eq!(store.load().failed_models, vec![yamaha()]);
    }

    #[test]
    fn test_retry_failed_disabled_skips_failed_items() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));
        store.save(&[], &[yamaha()]).expect("seed checkpoint should save");

        let mut enricher = enricher(dir.path(), ScriptedSource::default(), false);
        let summary = enricher.run(&[yamaha()]).expect("run should succeed");
        assert_eq!(summary.skipped, 1);
        assert!(enricher.source().calls.is_empty());
    }

    #[test]
    fn test_unwritable_output_aborts_run() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").expect("file should be writable");
        let mut settings = settings(dir.path(), true);
        settings.successful_results_path = blocker.join("successful_results.json");
        let source = ScriptedSource::default()
            .answer(YAMAHA_QUERY, Ok(TrendSeries::from_values(YAMAHA_QUERY, &[80.0])));
        let mut enricher = Enricher::new(
            source,
            RecordingSleeper::default(),
            JsonCheckpointStore::new(dir.path().join("checkpoint.json")),
            half_half(),
            settings,
        );

        let error = enricher.run(&[yamaha()]).expect_err("write under a file should fail");
        assert!(matches!(error, EnrichError::Output(_)));
        assert!(!dir.path().join("checkpoint.json").exists());
    }
}
