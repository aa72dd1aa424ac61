//! Scriptable collaborators for unit and scenario tests.

use analysis_core::{
    AnalysisError, AnalysisResult, Bar, MarketDataProvider, Period, PriceSeries, ProfileAnalyzer,
    SignalStrength, StockSnapshot, Ticker, UserProfile,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Barrier, Semaphore};

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        // Dropping the permit hands it straight back, so one release opens the gate for good
        let _permit = gate.acquire().await;
    }
}

#[derive(Default)]
pub struct MockProvider {
    snapshot_calls: Mutex<Vec<String>>,
    series_calls: AtomicUsize,
    failing_tickers: HashMap<String, String>,
    failing_period: Option<Period>,
    snapshot_gate: Option<Arc<Semaphore>>,
    series_gate: Option<Arc<Semaphore>>,
    series_barrier: Option<Arc<Barrier>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot fetch for `ticker` fails with `message`
    pub fn with_failing_ticker(mut self, ticker: &str, message: &str) -> Self {
        self.failing_tickers.insert(ticker.to_string(), message.to_string());
        self
    }

    pub fn with_failing_period(mut self, period: Period) -> Self {
        self.failing_period = Some(period);
        self
    }

    pub fn with_snapshot_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.snapshot_gate = Some(gate);
        self
    }

    pub fn with_series_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.series_gate = Some(gate);
        self
    }

    pub fn with_series_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.series_barrier = Some(barrier);
        self
    }

    pub fn snapshot_calls(&self) -> Vec<String> {
        self.snapshot_calls.lock().unwrap().clone()
    }

    pub fn series_call_count(&self) -> usize {
        self.series_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    async fn fetch_snapshot(&self, ticker: &Ticker) -> Result<StockSnapshot, AnalysisError> {
        self.snapshot_calls.lock().unwrap().push(ticker.to_string());
        pass(&self.snapshot_gate).await;

        if let Some(message) = self.failing_tickers.get(ticker.as_str()) {
            return Err(AnalysisError::ApiError(message.clone()));
        }

        Ok(StockSnapshot {
            ticker: ticker.clone(),
            name: Some(format!("{} Inc", ticker)),
            price: 100.0,
            previous_close: Some(98.0),
            change_percent: Some(2.04),
            volume: Some(1_000_000.0),
            as_of: Utc::now(),
        })
    }

    async fn fetch_series(&self, ticker: &Ticker, period: Period) -> Result<PriceSeries, AnalysisError> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.series_barrier {
            barrier.wait().await;
        }
        pass(&self.series_gate).await;

        if self.failing_period == Some(period) {
            return Err(AnalysisError::ApiError(format!("connection reset fetching {}", period)));
        }

        Ok(PriceSeries {
            ticker: ticker.clone(),
            period,
            bars: vec![Bar {
                timestamp: Utc::now(),
                open: 99.0,
                high: 101.0,
                low: 98.0,
                close: 100.0,
                volume: 1_000.0,
            }],
        })
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Default)]
pub enum AnalyzerBehavior {
    #[default]
    Succeed,
    ReturnNothing,
    Fail(String),
}

#[derive(Default)]
pub struct MockAnalyzer {
    behavior: AnalyzerBehavior,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl MockAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, behavior: AnalyzerBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileAnalyzer for MockAnalyzer {
    async fn analyze(
        &self,
        profile: &UserProfile,
        snapshot: &StockSnapshot,
    ) -> Result<Option<AnalysisResult>, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.gate).await;

        match &self.behavior {
            AnalyzerBehavior::Succeed => Ok(Some(AnalysisResult {
                symbol: snapshot.ticker.to_string(),
                timestamp: Utc::now(),
                signal: SignalStrength::Buy,
                confidence: 0.7,
                reason: format!("Fits a {} profile", profile.risk_tolerance.as_str()),
                metrics: serde_json::json!({ "price": snapshot.price }),
            })),
            AnalyzerBehavior::ReturnNothing => Ok(None),
            AnalyzerBehavior::Fail(message) => Err(AnalysisError::AnalysisFailed(message.clone())),
        }
    }
}
