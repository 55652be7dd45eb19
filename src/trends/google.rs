//! Google Trends provider backed by `ureq`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};
use log::debug;
use serde_json::{json, Value};

use crate::config::TrendsConfig;
use crate::trends::{TrendError, TrendPoint, TrendSeries, TrendSource};

const TRENDS_HOME_URL: &str = "https://trends.google.com/";
const EXPLORE_URL: &str = "https://trends.google.com/trends/api/explore";
const INTEREST_OVER_TIME_URL: &str = "https://trends.google.com/trends/api/widgetdata/multiline";
const TIMESERIES_WIDGET_ID: &str = "TIMESERIES";
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const USER_AGENT: &str = "moto-trends/0.1.0 (popularity enrichment batch)";

type DirectLimiter =
    RateLimiter<NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Interest-over-time client for the public Google Trends endpoints.
pub struct GoogleTrendsClient {
    http_client: ureq::Agent,
    limiter: Option<DirectLimiter>,
    hl: String,
    tz: i32,
    nid_cookie: Option<String>,
}

impl GoogleTrendsClient {
    /// Creates a client from the `[trends]` config section.
    pub fn new(config: &TrendsConfig) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(USER_AGENT)
            .build();
        let limiter = Quota::with_period(Duration::from_millis(config.min_request_interval_ms))
            .and_then(|quota| NonZeroU32::new(1).map(|burst| quota.allow_burst(burst)))
            .map(RateLimiter::direct);

        Self {
            http_client,
            limiter,
            hl: config.hl.clone(),
            tz: config.tz,
            nid_cookie: None,
        }
    }

    fn wait_for_request_slot(&self) {
        let Some(limiter) = self.limiter.as_ref() else {
            return;
        };
        while limiter.check().is_err() {
            std::thread::sleep(RATE_LIMIT_POLL_INTERVAL);
        }
    }

    fn map_ureq_error(error: ureq::Error) -> TrendError {
        match error {
            ureq::Error::Status(429, _) => TrendError::RateLimited,
            ureq::Error::Status(code, _) => TrendError::Status(code),
            ureq::Error::Transport(transport) => TrendError::Transport(transport.to_string()),
        }
    }

    /// Google hands out an `NID` cookie on the landing page; the API
    /// endpoints answer 429 far more eagerly without it.
    fn ensure_cookie(&mut self, geo: &str) -> Result<(), TrendError> {
        if self.nid_cookie.is_some() {
            return Ok(());
        }
        self.wait_for_request_slot();
        let response = self
            .http_client
            .get(TRENDS_HOME_URL)
            .query("geo", geo)
            .call()
            .map_err(Self::map_ureq_error)?;
        self.nid_cookie = extract_nid_cookie(response.all("set-cookie"));
        if self.nid_cookie.is_none() {
            debug!("Trends: no NID cookie issued, continuing without it");
        }
        Ok(())
    }

    fn request(&self, request: ureq::Request) -> Result<String, TrendError> {
        self.wait_for_request_slot();
        let request = match self.nid_cookie.as_deref() {
            Some(cookie) => request.set("Cookie", cookie),
            None => request,
        };
        request
            .call()
            .map_err(Self::map_ureq_error)?
            .into_string()
            .map_err(|error| TrendError::Transport(format!("failed to read response: {error}")))
    }
}

impl TrendSource for GoogleTrendsClient {
    fn interest_over_time(
        &mut self,
        query: &str,
        geo: &str,
        timeframe: &str,
    ) -> Result<TrendSeries, TrendError> {
        self.ensure_cookie(geo)?;
        let tz = self.tz.to_string();

        let explore_req = explore_payload(query, geo, timeframe).to_string();
        let explore_body = self.request(
            self.http_client
                .post(EXPLORE_URL)
                .query("hl", &self.hl)
                .query("tz", &tz)
                .query("req", &explore_req),
        )?;
        let (widget_request, token) = parse_timeseries_widget(&explore_body)?;

        let widget_req = widget_request.to_string();
        let timeline_body = self.request(
            self.http_client
                .get(INTEREST_OVER_TIME_URL)
                .query("hl", &self.hl)
                .query("tz", &tz)
                .query("req", &widget_req)
                .query("token", &token),
        )?;
        let series = parse_timeline(&timeline_body, query)?;
        match series.time_span() {
            Some((first, last)) => debug!(
                "Trends: {} samples ({} partial) from {} to {} for query '{}'",
                series.points.len(),
                series.partial_count(),
                first,
                last,
                query
            ),
            None => debug!("Trends: no samples for query '{}'", query),
        }
        Ok(series)
    }
}

fn explore_payload(query: &str, geo: &str, timeframe: &str) -> Value {
    json!({
        "comparisonItem": [{ "keyword": query, "time": timeframe, "geo": geo }],
        "category": 0,
        "property": "",
    })
}

fn extract_nid_cookie(set_cookie_headers: Vec<&str>) -> Option<String> {
    set_cookie_headers.into_iter().find_map(|header| {
        let pair = header.split(';').next()?.trim();
        pair.starts_with("NID=").then(|| pair.to_string())
    })
}

/// Drops the anti-JSON-hijacking prefix (`)]}'`) Google puts before bodies.
fn strip_xssi_prefix(body: &str) -> Result<&str, TrendError> {
    body.find('{')
        .map(|start| &body[start..])
        .ok_or_else(|| TrendError::Malformed("no JSON object in response".to_string()))
}

fn parse_json_body(body: &str) -> Result<Value, TrendError> {
    serde_json::from_str(strip_xssi_prefix(body)?)
        .map_err(|error| TrendError::Malformed(format!("invalid JSON: {error}")))
}

fn parse_timeseries_widget(body: &str) -> Result<(Value, String), TrendError> {
    let root = parse_json_body(body)?;
    let widget = root
        .get("widgets")
        .and_then(Value::as_array)
        .and_then(|widgets| {
            widgets
                .iter()
                .find(|widget| widget.get("id").and_then(Value::as_str) == Some(TIMESERIES_WIDGET_ID))
        })
        .ok_or_else(|| TrendError::Malformed("no TIMESERIES widget".to_string()))?;
    let token = widget
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| TrendError::Malformed("TIMESERIES widget has no token".to_string()))?;
    let request = widget
        .get("request")
        .cloned()
        .ok_or_else(|| TrendError::Malformed("TIMESERIES widget has no request".to_string()))?;
    Ok((request, token.to_string()))
}

fn parse_timeline(body: &str, query: &str) -> Result<TrendSeries, TrendError> {
    let root = parse_json_body(body)?;
    let Some(timeline) = root.pointer("/default/timelineData").and_then(Value::as_array) else {
        return Ok(TrendSeries::empty(query));
    };

    let points = timeline
        .iter()
        .map(|entry| -> Result<TrendPoint, TrendError> {
            let time = match entry.get("time") {
                Some(Value::String(text)) => text.parse::<i64>().ok(),
                Some(other) => other.as_i64(),
                None => None,
            }
            .ok_or_else(|| TrendError::Malformed("timeline entry without time".to_string()))?;
            let value = entry
                .pointer("/value/0")
                .and_then(Value::as_f64)
                .ok_or_else(|| TrendError::Malformed("timeline entry without value".to_string()))?;
            let is_partial = entry
                .get("isPartial")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(TrendPoint {
                time,
                value,
                is_partial,
            })
        })
        .collect::<Result<Vec<_>, TrendError>>()?;

    Ok(TrendSeries {
        query: query.to_string(),
        points,
    })
}
