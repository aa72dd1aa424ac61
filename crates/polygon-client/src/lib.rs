use analysis_core::{
    AnalysisError, Bar, MarketDataProvider, Period, PriceSeries, StockSnapshot, Ticker,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub mod demo;

pub use demo::DemoDataset;

const BASE_URL: &str = "https://api.polygon.io";

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            let oldest = match ts.front() {
                Some(&oldest) if ts.len() >= self.max_requests => oldest,
                _ => {
                    ts.push_back(now);
                    return;
                }
            };

            // Wait until the oldest request falls out of the window
            let sleep_dur = (oldest + self.window).saturating_duration_since(now)
                + Duration::from_millis(50);
            drop(ts);
            tracing::debug!("Rate limiter: waiting {:.1}s for Polygon API slot", sleep_dur.as_secs_f64());
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// HTTP transport for the Polygon.io REST API
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    base_url: String,
    client: Client,
    rate_limiter: RateLimiter,
}

impl PolygonClient {
    pub fn new(api_key: String) -> Self {
        // Default 500 req/min for Starter plan. Free tier users should set POLYGON_RATE_LIMIT=5.
        let rate_limit: usize = std::env::var("POLYGON_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            base_url: BASE_URL.to_string(),
            client,
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(60)),
        }
    }

    /// Point the client at a different host (proxies, recorded fixtures).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Send a request with rate limiting and automatic 429 retry.
    async fn send_request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, AnalysisError> {
        let request = builder.build().map_err(|e| AnalysisError::ApiError(e.to_string()))?;

        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;
            let req_clone = request.try_clone()
                .ok_or_else(|| AnalysisError::ApiError("Cannot clone request".to_string()))?;
            let response = self.client.execute(req_clone).await.map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(e.to_string())
                } else {
                    AnalysisError::ApiError(format!("network error: {}", e))
                }
            })?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let wait_secs = 15u64;
            tracing::warn!("Polygon 429 rate limited, waiting {}s before retry {}/3", wait_secs, attempt + 1);
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }

        Err(AnalysisError::ApiError("Rate limit exceeded by Polygon after 3 retries".to_string()))
    }

    async fn error_for_status(
        symbol: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, AnalysisError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AnalysisError::NotFound(format!("Ticker {} not found", symbol)));
        }
        Err(AnalysisError::ApiError(format!(
            "HTTP {}: {}",
            status,
            response.text().await.unwrap_or_default()
        )))
    }

    /// Get aggregates (bars) for a symbol
    pub async fn get_aggregates(
        &self,
        symbol: &str,
        multiplier: u32,
        timespan: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AnalysisError> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            timespan,
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        );

        let response = self.send_request(
            self.client.get(&url).query(&[("apiKey", self.api_key.as_str()), ("adjusted", "true")])
        ).await?;
        let response = Self::error_for_status(symbol, response).await?;

        let agg_response: AggregateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::ApiError(e.to_string()))?;

        Ok(agg_response.results.into_iter().map(AggregateResult::into_bar).collect())
    }

    /// Get snapshot for a ticker (near-real-time last trade, today's OHLCV, prev day)
    pub async fn get_snapshot(&self, symbol: &str) -> Result<SnapshotTicker, AnalysisError> {
        let url = format!(
            "{}/v2/snapshot/locale/us/markets/stocks/tickers/{}",
            self.base_url, symbol
        );

        let response = self.send_request(
            self.client.get(&url).query(&[("apiKey", &self.api_key)])
        ).await?;
        let response = Self::error_for_status(symbol, response).await?;

        let snap_response: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::ApiError(e.to_string()))?;

        snap_response
            .ticker
            .ok_or_else(|| AnalysisError::NotFound(format!("Ticker {} not found", symbol)))
    }
}

#[async_trait]
impl MarketDataProvider for PolygonClient {
    async fn fetch_snapshot(&self, ticker: &Ticker) -> Result<StockSnapshot, AnalysisError> {
        let snapshot = self.get_snapshot(ticker.as_str()).await?;
        snapshot.into_stock_snapshot(ticker)
    }

    async fn fetch_series(&self, ticker: &Ticker, period: Period) -> Result<PriceSeries, AnalysisError> {
        let to = Utc::now();
        let from = to - ChronoDuration::days(period.days());
        let bars = self.get_aggregates(ticker.as_str(), 1, "day", from, to).await?;
        tracing::debug!("Fetched {} bars for {} ({})", bars.len(), ticker, period);

        Ok(PriceSeries {
            ticker: ticker.clone(),
            period,
            bars,
        })
    }

    fn provider_name(&self) -> &'static str {
        "polygon"
    }
}

// Response structures
#[derive(Debug, Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    results: Vec<AggregateResult>,
}

#[derive(Debug, Deserialize)]
struct AggregateResult {
    t: i64, // timestamp
    o: f64, // open
    h: f64, // high
    l: f64, // low
    c: f64, // close
    v: f64, // volume
}

impl AggregateResult {
    fn into_bar(self) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp_millis(self.t).unwrap_or_else(Utc::now),
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    ticker: Option<SnapshotTicker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTicker {
    pub day: Option<SnapshotDay>,
    #[serde(rename = "lastTrade")]
    pub last_trade: Option<SnapshotLastTrade>,
    #[serde(rename = "prevDay")]
    pub prev_day: Option<SnapshotDay>,
    #[serde(rename = "todaysChange")]
    pub todays_change: Option<f64>,
    #[serde(rename = "todaysChangePerc")]
    pub todays_change_perc: Option<f64>,
    #[serde(default)]
    pub updated: Option<i64>,
}

impl SnapshotTicker {
    /// Prefer the last trade, then today's close, then yesterday's close.
    pub fn current_price(&self) -> Option<f64> {
        self.last_trade
            .as_ref()
            .and_then(|lt| lt.p)
            .or_else(|| self.day.as_ref().and_then(|d| d.c).filter(|c| *c > 0.0))
            .or_else(|| self.prev_day.as_ref().and_then(|d| d.c))
    }

    fn into_stock_snapshot(self, ticker: &Ticker) -> Result<StockSnapshot, AnalysisError> {
        let price = self.current_price().ok_or_else(|| {
            AnalysisError::InsufficientData(format!("No price available for {}", ticker))
        })?;

        // Polygon reports `updated` in nanoseconds
        let as_of = self
            .updated
            .and_then(|ns| DateTime::from_timestamp_millis(ns / 1_000_000))
            .unwrap_or_else(Utc::now);

        Ok(StockSnapshot {
            ticker: ticker.clone(),
            name: None,
            price,
            previous_close: self.prev_day.as_ref().and_then(|d| d.c),
            change_percent: self.todays_change_perc,
            volume: self.day.as_ref().and_then(|d| d.v),
            as_of,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDay {
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLastTrade {
    pub p: Option<f64>,
    pub s: Option<i64>,
    pub t: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker() -> Ticker {
        Ticker::parse("aapl").unwrap()
    }

    #[test]
    fn test_snapshot_prefers_last_trade() {
        let json = r#"{
            "ticker": {
                "day": {"o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 1000.0},
                "lastTrade": {"p": 190.25, "s": 100, "t": 1},
                "prevDay": {"o": 1.0, "h": 2.0, "l": 0.5, "c": 188.0, "v": 900.0},
                "todaysChangePerc": 1.2
            }
        }"#;
        let resp: SnapshotResponse = serde_json::from_str(json).unwrap();
        let snap = resp.ticker.unwrap().into_stock_snapshot(&ticker()).unwrap();

        assert_eq!(snap.price, 190.25);
        assert_eq!(snap.previous_close, Some(188.0));
        assert_eq!(snap.change_percent, Some(1.2));
        assert_eq!(snap.volume, Some(1000.0));
        assert_eq!(snap.ticker.as_str(), "AAPL");
    }

    #[test]
    fn test_snapshot_falls_back_to_prev_close_before_open() {
        let json = r#"{
            "ticker": {
                "day": {"o": 0.0, "h": 0.0, "l": 0.0, "c": 0.0, "v": 0.0},
                "prevDay": {"c": 188.0}
            }
        }"#;
        let resp: SnapshotResponse = serde_json::from_str(json).unwrap();
        let snap = resp.ticker.unwrap().into_stock_snapshot(&ticker()).unwrap();
        assert_eq!(snap.price, 188.0);
    }

    #[test]
    fn test_snapshot_without_any_price_is_insufficient() {
        let resp: SnapshotResponse = serde_json::from_str(r#"{"ticker": {}}"#).unwrap();
        let err = resp.ticker.unwrap().into_stock_snapshot(&ticker()).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData(_)));
    }

    #[test]
    fn test_aggregate_parsing() {
        let json = r#"{"results": [{"t": 1700000000000, "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 10.0}]}"#;
        let resp: AggregateResponse = serde_json::from_str(json).unwrap();
        let bars: Vec<Bar> = resp.results.into_iter().map(AggregateResult::into_bar).collect();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 1.5);
        assert_eq!(bars[0].timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_base_url_override_drops_trailing_slash() {
        let client = PolygonClient::new("test-key".to_string()).with_base_url("http://127.0.0.1:8080/");
        assert_eq!(client.base_url, "http://127.0.0.1:8080");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
