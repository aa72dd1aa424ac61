use std::time::Duration;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RETRIES: u32 = 2;
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);
pub const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
pub const MAX_CACHE_ENTRIES: usize = 5;
pub const MAX_QUEUE_LEN: usize = 5;

/// Orchestration limits. `Default` yields the fixed production values.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Per-attempt timeout for every upstream call
    pub fetch_timeout: Duration,
    /// Extra attempts after the first failure
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    pub max_queue_len: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: FETCH_TIMEOUT,
            max_retries: MAX_RETRIES,
            base_backoff: BASE_BACKOFF,
            cache_ttl: CACHE_TTL,
            max_cache_entries: MAX_CACHE_ENTRIES,
            max_queue_len: MAX_QUEUE_LEN,
        }
    }
}
