//! Concurrent fan-out of historical period fetches with an all-or-nothing join.

use analysis_core::{AnalysisError, MarketDataProvider, Period, PriceSeries, Ticker};
use futures_util::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::with_timeout;

pub type HistoricalData = BTreeMap<Period, PriceSeries>;

/// Fetch every standard period (1M, 3M, 6M, 1Y, 5Y) for `ticker`.
pub async fn fetch_all_periods(
    provider: Arc<dyn MarketDataProvider>,
    ticker: &Ticker,
    timeout: Duration,
) -> Result<HistoricalData, AnalysisError> {
    fetch_periods(provider, ticker, &Period::ALL, timeout).await
}

/// Issue one fetch per period concurrently and join them.
///
/// Any single failure fails the whole batch; deciding how to degrade is up to the caller.
pub async fn fetch_periods(
    provider: Arc<dyn MarketDataProvider>,
    ticker: &Ticker,
    periods: &[Period],
    timeout: Duration,
) -> Result<HistoricalData, AnalysisError> {
    let fetches = periods.iter().map(|&period| {
        let provider = Arc::clone(&provider);
        let ticker = ticker.clone();
        async move {
            let series = with_timeout(timeout, async move {
                provider.fetch_series(&ticker, period).await
            })
            .await
            .map_err(|e| {
                tracing::warn!("Historical fetch for {} failed: {}", period, e);
                e
            })?;
            Ok::<_, AnalysisError>((period, series))
        }
    });

    let results = try_join_all(fetches).await?;
    tracing::debug!("Joined {} historical periods for {}", results.len(), ticker);
    Ok(results.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockProvider;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_all_periods_present() {
        let provider = Arc::new(MockProvider::new());
        let ticker = Ticker::parse("AAPL").unwrap();

        let data = fetch_all_periods(provider.clone(), &ticker, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(data.len(), 5);
        for period in Period::ALL {
            assert_eq!(data[&period].period, period);
        }
        assert_eq!(provider.series_call_count(), 5);
    }

    #[tokio::test]
    async fn test_fetches_run_concurrently() {
        // Every fetch waits on a barrier sized to the batch; a sequential join would never get past it
        let provider = Arc::new(MockProvider::new().with_series_barrier(Arc::new(Barrier::new(5))));
        let ticker = Ticker::parse("AAPL").unwrap();

        let data = tokio::time::timeout(
            Duration::from_secs(5),
            fetch_all_periods(provider, &ticker, Duration::from_secs(10)),
        )
        .await
        .expect("concurrent join should not stall")
        .unwrap();

        assert_eq!(data.len(), 5);
    }

    #[tokio::test]
    async fn test_single_failure_fails_batch() {
        let provider = Arc::new(MockProvider::new().with_failing_period(Period::OneYear));
        let ticker = Ticker::parse("AAPL").unwrap();

        let result = fetch_all_periods(provider, &ticker, Duration::from_secs(10)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_period_times_out() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(MockProvider::new().with_series_gate(gate));
        let ticker = Ticker::parse("AAPL").unwrap();

        let err = fetch_periods(provider, &ticker, &[Period::OneMonth], Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Timeout(_)));
    }
}
