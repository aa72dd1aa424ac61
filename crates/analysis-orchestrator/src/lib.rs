pub mod cache;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod historical;
pub mod orchestrator;
pub mod progress;
pub mod retry;
#[cfg(test)]
mod test_support;

pub use cache::{cache_key, cache_notice, format_age, AnalysisCache, CacheKey, CachedRecord};
pub use cancel::CancellationFlag;
pub use classifier::{classify, classify_message, CANCELLED_MESSAGE, CANCELLED_SUGGESTION};
pub use config::OrchestratorConfig;
pub use historical::{fetch_all_periods, fetch_periods, HistoricalData};
pub use orchestrator::{
    AnalysisOutcome, AnalysisReport, AnalysisRequest, EventStream, Orchestrator, OrchestratorEvent,
    RequestId,
};
pub use progress::{LoadingStage, ProgressGuard, ProgressState, ProgressTracker};
pub use retry::{execute_with_retry, with_timeout, PipelineError, RetryPolicy};
