use async_trait::async_trait;
use crate::{AnalysisError, AnalysisResult, Period, PriceSeries, StockSnapshot, Ticker, UserProfile};

/// Upstream market data transport.
///
/// Implementations must be idempotent: the orchestrator may call either
/// method several times for the same request.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_snapshot(&self, ticker: &Ticker) -> Result<StockSnapshot, AnalysisError>;

    async fn fetch_series(&self, ticker: &Ticker, period: Period) -> Result<PriceSeries, AnalysisError>;

    fn provider_name(&self) -> &'static str;
}

/// Profile-aware analysis of a snapshot.
///
/// `Ok(None)` means the analyzer produced nothing; callers treat it the same as an error.
#[async_trait]
pub trait ProfileAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        profile: &UserProfile,
        snapshot: &StockSnapshot,
    ) -> Result<Option<AnalysisResult>, AnalysisError>;
}
