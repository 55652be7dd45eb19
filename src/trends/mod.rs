//! Search-trends provider abstraction and concrete implementations.

pub mod google;

/// One sample of the interest-over-time series.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    /// Unix timestamp (seconds) of the sample period start.
    pub time: i64,
    pub value: f64,
    /// Set by the provider for the still-running last period.
    pub is_partial: bool,
}

/// Interest-over-time series returned for a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendSeries {
    pub query: String,
    pub points: Vec<TrendPoint>,
}

impl TrendSeries {
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            points: Vec::new(),
        }
    }

    pub fn from_values(query: impl Into<String>, values: &[f64]) -> Self {
        Self {
            query: query.into(),
            points: values
                .iter()
                .enumerate()
                .map(|(index, value)| TrendPoint {
                    time: index as i64,
                    value: *value,
                    is_partial: false,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Samples the provider flagged as belonging to an unfinished period.
    pub fn partial_count(&self) -> usize {
        self.points.iter().filter(|point| point.is_partial).count()
    }

    /// First and last sample timestamps.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        let first = self.points.iter().map(|point| point.time).min()?;
        let last = self.points.iter().map(|point| point.time).max()?;
        Some((first, last))
    }

    /// Arithmetic mean of all samples, partial ones included.
    pub fn mean(&self) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let total: f64 = self.points.iter().map(|point| point.value).sum();
        Some(total / self.points.len() as f64)
    }
}

/// Failures surfaced by a trends provider. All of them are treated as
/// transient by the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum TrendError {
    #[error("provider rate limit hit (HTTP 429)")]
    RateLimited,

    #[error("provider returned HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Interface implemented by concrete trends providers.
pub trait TrendSource {
    /// Fetches the interest-over-time series for `query` restricted to
    /// `geo` over `timeframe`. An empty series is a valid answer.
    fn interest_over_time(
        &mut self,
        query: &str,
        geo: &str,
        timeframe: &str,
    ) -> Result<TrendSeries, TrendError>;
}
