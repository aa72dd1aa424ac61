//! Offline demo dataset.
//!
//! Serves deterministic quotes and price history for a fixed set of tickers so the
//! tool works without a Polygon key.

use analysis_core::{
    AnalysisError, Bar, MarketDataProvider, Period, PriceSeries, StockSnapshot, Ticker, DEMO_TICKERS,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};

#[derive(Debug, Clone, Default)]
pub struct DemoDataset;

impl DemoDataset {
    pub fn new() -> Self {
        Self
    }

    pub fn supports(&self, ticker: &Ticker) -> bool {
        DEMO_TICKERS.contains(&ticker.as_str())
    }

    fn ensure_supported(&self, ticker: &Ticker) -> Result<(), AnalysisError> {
        if self.supports(ticker) {
            Ok(())
        } else {
            Err(AnalysisError::InvalidData(format!(
                "{} is not available in demo dataset",
                ticker
            )))
        }
    }

    /// Stable per-ticker seed in [0, 1)
    fn seed(ticker: &Ticker) -> f64 {
        let hash = ticker
            .as_str()
            .bytes()
            .fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        (hash % 1000) as f64 / 1000.0
    }

    fn base_price(ticker: &Ticker) -> f64 {
        50.0 + Self::seed(ticker) * 450.0
    }

    /// Close `days_ago` days before the latest close
    fn close_at(ticker: &Ticker, days_ago: i64) -> f64 {
        let seed = Self::seed(ticker);
        let t = days_ago as f64;
        let drift = 1.0 - (0.0002 + seed * 0.0004) * t;
        let wave = 1.0 + 0.06 * (t / 17.0 + seed * 6.28).sin();
        (Self::base_price(ticker) * drift.max(0.2) * wave * 100.0).round() / 100.0
    }
}

#[async_trait]
impl MarketDataProvider for DemoDataset {
    async fn fetch_snapshot(&self, ticker: &Ticker) -> Result<StockSnapshot, AnalysisError> {
        self.ensure_supported(ticker)?;

        let price = Self::close_at(ticker, 0);
        let previous_close = Self::close_at(ticker, 1);
        let change_percent = (price - previous_close) / previous_close * 100.0;

        Ok(StockSnapshot {
            ticker: ticker.clone(),
            name: None,
            price,
            previous_close: Some(previous_close),
            change_percent: Some(change_percent),
            volume: Some(1_000_000.0 + Self::seed(ticker) * 9_000_000.0),
            as_of: Utc::now(),
        })
    }

    async fn fetch_series(&self, ticker: &Ticker, period: Period) -> Result<PriceSeries, AnalysisError> {
        self.ensure_supported(ticker)?;

        let now = Utc::now();
        let bars = (0..=period.days())
            .rev()
            .map(|days_ago| {
                let close = Self::close_at(ticker, days_ago);
                let open = Self::close_at(ticker, days_ago + 1);
                Bar {
                    timestamp: now - Duration::days(days_ago),
                    open,
                    high: open.max(close) * 1.005,
                    low: open.min(close) * 0.995,
                    close,
                    volume: 1_000_000.0,
                }
            })
            .collect();

        Ok(PriceSeries {
            ticker: ticker.clone(),
            period,
            bars,
        })
    }

    fn provider_name(&self) -> &'static str {
        "demo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_deterministic() {
        let demo = DemoDataset::new();
        let ticker = Ticker::parse("msft").unwrap();
        let a = demo.fetch_snapshot(&ticker).await.unwrap();
        let b = demo.fetch_snapshot(&ticker).await.unwrap();
        assert_eq!(a.price, b.price);
        assert!(a.price > 0.0);
    }

    #[tokio::test]
    async fn test_unknown_ticker_is_rejected() {
        let demo = DemoDataset::new();
        let err = demo
            .fetch_snapshot(&Ticker::parse("ZZZZ").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not available in demo dataset"));
    }

    #[tokio::test]
    async fn test_series_covers_period_oldest_first() {
        let demo = DemoDataset::new();
        let ticker = Ticker::parse("AAPL").unwrap();
        let series = demo.fetch_series(&ticker, Period::OneMonth).await.unwrap();
        assert_eq!(series.period, Period::OneMonth);
        assert_eq!(series.bars.len(), 31);
        assert!(series.bars.first().unwrap().timestamp < series.bars.last().unwrap().timestamp);

        let snapshot = demo.fetch_snapshot(&ticker).await.unwrap();
        assert_eq!(series.bars.last().unwrap().close, snapshot.price);
    }
}
