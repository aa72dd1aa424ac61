//! Single-flight request orchestration.
//!
//! One run-loop task owns the cache, the pending queue and the pipeline. Callers talk
//! to it through a cloneable [`Orchestrator`] handle and observe it through an event
//! stream plus a progress watch channel. At most one pipeline executes at any time;
//! everything else waits in a bounded FIFO queue.

use analysis_core::{
    AnalysisResult, ErrorCategory, MarketDataProvider, ProfileAnalyzer, StockSnapshot,
    Ticker, UserFriendlyError, UserProfile,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::cache::{cache_key, cache_notice, AnalysisCache, CacheKey, CachedRecord};
use crate::cancel::CancellationFlag;
use crate::classifier::{self, classify};
use crate::config::OrchestratorConfig;
use crate::historical::{fetch_all_periods, HistoricalData};
use crate::progress::{LoadingStage, ProgressState, ProgressTracker};
use crate::retry::{execute_with_retry, with_timeout, PipelineError, RetryPolicy};

pub type RequestId = u64;

pub type EventStream = mpsc::UnboundedReceiver<OrchestratorEvent>;

/// A cache miss waiting for, or undergoing, execution
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: RequestId,
    pub ticker: Ticker,
    pub profile: UserProfile,
    pub cache_key: CacheKey,
    pub enqueued_at: DateTime<Utc>,
    /// Cancel generation at submission; any later cancel abandons this request
    pub cancel_generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub request_id: RequestId,
    pub ticker: Ticker,
    pub cache_key: CacheKey,
    pub snapshot: StockSnapshot,
    pub analysis: AnalysisResult,
    /// Absent when the historical join failed or the cached record had none
    pub history: Option<HistoricalData>,
    pub history_error: Option<UserFriendlyError>,
    pub from_cache: bool,
    pub notice: Option<String>,
}

/// Terminal result of one submission
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    Completed(Box<AnalysisReport>),
    Failed(UserFriendlyError),
    Cancelled,
}

impl AnalysisOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalysisOutcome::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Served straight from the cache; a `Finished` event follows immediately
    CacheHit {
        request_id: RequestId,
        ticker: String,
        notice: String,
    },
    Queued {
        request_id: RequestId,
        ticker: String,
        /// 1-based position in the pending queue
        position: usize,
        queue_len: usize,
    },
    Started {
        request_id: RequestId,
        ticker: String,
    },
    Finished {
        request_id: RequestId,
        ticker: String,
        outcome: AnalysisOutcome,
    },
    /// Nothing executing and nothing waiting
    Idle,
}

struct Submission {
    id: RequestId,
    ticker: String,
    profile: UserProfile,
    cancel_generation: u64,
}

enum Command {
    Submit(Submission),
    Cancel,
}

/// Handle to a running orchestrator. Cheap to clone; the run loop exits once every handle is dropped.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    progress: watch::Receiver<ProgressState>,
    cancel: CancellationFlag,
    next_id: Arc<AtomicU64>,
}

impl Orchestrator {
    /// Start the run loop on the current tokio runtime.
    pub fn spawn(
        provider: Arc<dyn MarketDataProvider>,
        analyzer: Arc<dyn ProfileAnalyzer>,
        config: OrchestratorConfig,
    ) -> (Self, EventStream) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let progress = ProgressTracker::new();
        let cancel = CancellationFlag::new();

        tracing::info!(
            "Starting analysis orchestrator (provider: {}, queue limit: {}, cache: {} entries / {}s)",
            provider.provider_name(),
            config.max_queue_len,
            config.max_cache_entries,
            config.cache_ttl.as_secs()
        );

        let run_loop = RunLoop {
            pipeline: Pipeline {
                provider,
                analyzer,
                retry: RetryPolicy::from_config(&config),
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
            cache: AnalysisCache::new(config.cache_ttl, config.max_cache_entries),
            queue: VecDeque::with_capacity(config.max_queue_len),
            max_queue_len: config.max_queue_len,
            commands: command_rx,
            commands_open: true,
            events: event_tx,
        };
        tokio::spawn(run_loop.run());

        let handle = Self {
            commands: command_tx,
            progress: progress.subscribe(),
            cancel,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, event_rx)
    }

    /// Submit `ticker` for analysis under `profile`. Never blocks; the outcome arrives as a
    /// `Finished` event carrying the returned id.
    pub fn submit(&self, ticker: &str, profile: UserProfile) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::Submit(Submission {
            id,
            ticker: ticker.to_string(),
            profile,
            cancel_generation: self.cancel.generation(),
        });
        if self.commands.send(command).is_err() {
            tracing::warn!("Orchestrator run loop has stopped; dropping request {}", id);
        }
        id
    }

    /// Abandon the executing request and everything waiting behind it.
    pub fn cancel(&self) {
        // Bumping the generation here marks every earlier submission cancelled before the run loop wakes
        self.cancel.cancel();
        if self.commands.send(Command::Cancel).is_err() {
            tracing::warn!("Orchestrator run loop has stopped; cancel ignored");
        }
    }

    pub fn progress(&self) -> watch::Receiver<ProgressState> {
        self.progress.clone()
    }
}

/// What a successful pipeline run hands back to the run loop
struct PipelineOutput {
    snapshot: StockSnapshot,
    analysis: AnalysisResult,
    history: Result<HistoricalData, UserFriendlyError>,
}

/// Everything one execution needs, owned so its future never borrows the run loop
#[derive(Clone)]
struct Pipeline {
    provider: Arc<dyn MarketDataProvider>,
    analyzer: Arc<dyn ProfileAnalyzer>,
    retry: RetryPolicy,
    cancel: CancellationFlag,
    progress: ProgressTracker,
}

impl Pipeline {
    async fn run(self, request: AnalysisRequest) -> Result<PipelineOutput, PipelineError> {
        let _progress = self.progress.guard();

        self.progress.advance(LoadingStage::Fetching);
        let snapshot = self.fetch_snapshot(&request.ticker).await?;
        self.checkpoint()?;

        self.progress.advance(LoadingStage::Analyzing);
        let analysis = self.analyze(request.profile, snapshot.clone()).await?;
        self.checkpoint()?;

        self.progress.advance(LoadingStage::Presenting);
        let history = fetch_all_periods(Arc::clone(&self.provider), &request.ticker, self.retry.timeout)
            .await
            .map_err(|e| classify(&e, Some(ErrorCategory::Network)));
        self.checkpoint()?;

        self.progress.complete();
        Ok(PipelineOutput {
            snapshot,
            analysis,
            history,
        })
    }

    fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn fetch_snapshot(&self, ticker: &Ticker) -> Result<StockSnapshot, PipelineError> {
        let label = format!("snapshot fetch for {}", ticker);
        execute_with_retry(&self.retry, &self.cancel, &label, || {
            let provider = Arc::clone(&self.provider);
            let ticker = ticker.clone();
            async move { provider.fetch_snapshot(&ticker).await }
        })
        .await
    }

    async fn analyze(
        &self,
        profile: UserProfile,
        snapshot: StockSnapshot,
    ) -> Result<AnalysisResult, PipelineError> {
        let analyzer = Arc::clone(&self.analyzer);
        let symbol = snapshot.ticker.clone();
        let result = with_timeout(self.retry.timeout, async move {
            analyzer.analyze(&profile, &snapshot).await
        })
        .await;

        match result {
            Ok(Some(analysis)) => Ok(analysis),
            Ok(None) => {
                tracing::warn!("Analysis for {} returned no result", symbol);
                Err(PipelineError::Failed(classifier::empty_analysis()))
            }
            Err(e) => {
                tracing::warn!("Analysis for {} failed: {}", symbol, e);
                Err(PipelineError::Failed(classifier::analysis_failed(&e)))
            }
        }
    }
}

struct RunLoop {
    pipeline: Pipeline,
    cache: AnalysisCache,
    queue: VecDeque<AnalysisRequest>,
    max_queue_len: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl RunLoop {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            let first = match command {
                Command::Submit(submission) => self.admit(submission, false),
                Command::Cancel => {
                    self.cancel_waiting();
                    None
                }
            };
            if let Some(first) = first {
                self.drain(first).await;
            }
        }
        tracing::debug!("All orchestrator handles dropped, run loop exiting");
    }

    /// Execute `first`, then keep pulling from the queue until it is empty.
    async fn drain(&mut self, first: AnalysisRequest) {
        let mut next = Some(first);
        while let Some(request) = next {
            self.execute(request).await;
            next = self.next_queued();
        }
        tracing::debug!("Queue drained");
        self.emit(OrchestratorEvent::Idle);
    }

    async fn execute(&mut self, request: AnalysisRequest) {
        let waited = Utc::now() - request.enqueued_at;
        tracing::info!(
            "Starting analysis {} for {} (waited {}ms)",
            request.id,
            request.ticker,
            waited.num_milliseconds().max(0)
        );
        self.emit(OrchestratorEvent::Started {
            request_id: request.id,
            ticker: request.ticker.to_string(),
        });

        let mut pipeline = self.pipeline.clone();
        pipeline.cancel = self.pipeline.cancel.pinned_at(request.cancel_generation);
        let run = pipeline.run(request.clone());
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Submit(submission)) => {
                        // Busy: admit only ever queues, rejects or serves from cache
                        let _ = self.admit(submission, true);
                    }
                    Some(Command::Cancel) => {
                        if self.is_stale(request.cancel_generation) {
                            tracing::info!("Cancelling analysis {} for {}", request.id, request.ticker);
                        }
                        self.cancel_waiting();
                    }
                    None => self.commands_open = false,
                },
            }
        };

        self.finish(request, result);
    }

    /// Route a submission. Returns the request only when it should start right away.
    fn admit(&mut self, submission: Submission, busy: bool) -> Option<AnalysisRequest> {
        let Submission {
            id,
            ticker: raw_ticker,
            profile,
            cancel_generation,
        } = submission;
        let ticker = match Ticker::parse(&raw_ticker) {
            Ok(ticker) => ticker,
            Err(e) => {
                tracing::debug!("Rejecting request {}: {}", id, e);
                self.emit(OrchestratorEvent::Finished {
                    request_id: id,
                    ticker: raw_ticker.trim().to_string(),
                    outcome: AnalysisOutcome::Failed(classify(&e, Some(ErrorCategory::Data))),
                });
                return None;
            }
        };

        if self.is_stale(cancel_generation) {
            tracing::debug!("Request {} for {} was cancelled before admission", id, ticker);
            self.emit(OrchestratorEvent::Finished {
                request_id: id,
                ticker: ticker.to_string(),
                outcome: AnalysisOutcome::Cancelled,
            });
            return None;
        }

        let key = cache_key(&ticker, &profile);

        if self.serve_from_cache(id, &key) {
            if !busy {
                self.pipeline.progress.reset();
            }
            return None;
        }

        let request = AnalysisRequest {
            id,
            ticker,
            profile,
            cache_key: key,
            enqueued_at: Utc::now(),
            cancel_generation,
        };

        if !busy {
            return Some(request);
        }

        if self.queue.len() >= self.max_queue_len {
            tracing::warn!(
                "Queue full ({} waiting), rejecting {} for {}",
                self.queue.len(),
                id,
                request.ticker
            );
            self.emit(OrchestratorEvent::Finished {
                request_id: id,
                ticker: request.ticker.to_string(),
                outcome: AnalysisOutcome::Failed(classifier::queue_full(self.max_queue_len)),
            });
            return None;
        }

        let ticker = request.ticker.to_string();
        self.queue.push_back(request);
        let queue_len = self.queue.len();
        tracing::debug!("Queued request {} for {} at position {}", id, ticker, queue_len);
        self.emit(OrchestratorEvent::Queued {
            request_id: id,
            ticker,
            position: queue_len,
            queue_len,
        });
        None
    }

    /// Pop the queue head, answering from cache any entry a finished run has since covered.
    fn next_queued(&mut self) -> Option<AnalysisRequest> {
        // A cancel may have landed after the last run settled but before its command arrived
        self.cancel_waiting();
        while let Some(request) = self.queue.pop_front() {
            if !self.serve_from_cache(request.id, &request.cache_key) {
                return Some(request);
            }
        }
        None
    }

    fn serve_from_cache(&mut self, id: RequestId, key: &CacheKey) -> bool {
        let Some(record) = self.cache.get(key).cloned() else {
            return false;
        };

        let notice = cache_notice(record.age_at(Utc::now()));
        let ticker = record.snapshot.ticker.clone();
        tracing::debug!("Cache hit for {} (request {})", key, id);

        self.emit(OrchestratorEvent::CacheHit {
            request_id: id,
            ticker: ticker.to_string(),
            notice: notice.clone(),
        });
        let report = AnalysisReport {
            request_id: id,
            ticker: ticker.clone(),
            cache_key: key.clone(),
            snapshot: record.snapshot,
            analysis: record.analysis,
            history: record.history,
            history_error: record.history_error,
            from_cache: true,
            notice: Some(notice),
        };
        self.emit(OrchestratorEvent::Finished {
            request_id: id,
            ticker: ticker.to_string(),
            outcome: AnalysisOutcome::Completed(Box::new(report)),
        });
        true
    }

    fn is_stale(&self, cancel_generation: u64) -> bool {
        cancel_generation < self.pipeline.cancel.generation()
    }

    /// Finish every queued request submitted before the latest cancel as cancelled.
    fn cancel_waiting(&mut self) {
        let current = self.pipeline.cancel.generation();
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|request| request.cancel_generation < current);
        self.queue = kept;
        if cancelled.is_empty() {
            return;
        }
        tracing::info!("Clearing {} queued request(s)", cancelled.len());
        for request in cancelled {
            self.emit(OrchestratorEvent::Finished {
                request_id: request.id,
                ticker: request.ticker.to_string(),
                outcome: AnalysisOutcome::Cancelled,
            });
        }
    }

    fn finish(&mut self, request: AnalysisRequest, result: Result<PipelineOutput, PipelineError>) {
        let outcome = match result {
            Ok(output) => {
                let (history, history_error) = match output.history {
                    Ok(history) => (Some(history), None),
                    Err(err) => {
                        tracing::warn!(
                            "Historical data unavailable for {}, reporting without it: {}",
                            request.ticker,
                            err
                        );
                        (None, Some(err))
                    }
                };

                let record = CachedRecord {
                    snapshot: output.snapshot.clone(),
                    analysis: output.analysis.clone(),
                    history: history.clone(),
                    history_error: history_error.clone(),
                    cached_at: Utc::now(),
                };
                if let Some(evicted) = self.cache.put(request.cache_key.clone(), record) {
                    tracing::debug!("Evicted {} to cache {}", evicted, request.cache_key);
                }

                tracing::info!("Analysis {} for {} complete", request.id, request.ticker);
                AnalysisOutcome::Completed(Box::new(AnalysisReport {
                    request_id: request.id,
                    ticker: request.ticker.clone(),
                    cache_key: request.cache_key.clone(),
                    snapshot: output.snapshot,
                    analysis: output.analysis,
                    history,
                    history_error,
                    from_cache: false,
                    notice: None,
                }))
            }
            Err(PipelineError::Cancelled) => {
                tracing::info!("Analysis {} for {} cancelled", request.id, request.ticker);
                AnalysisOutcome::Cancelled
            }
            Err(PipelineError::Failed(err)) => {
                tracing::warn!("Analysis {} for {} failed: {}", request.id, request.ticker, err);
                AnalysisOutcome::Failed(err)
            }
        };

        self.emit(OrchestratorEvent::Finished {
            request_id: request.id,
            ticker: request.ticker.to_string(),
            outcome,
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        // Nobody listening is not an error; the run loop keeps serving handles
        let _ = self.events.send(event);
    }
}
