//! User-facing loading stages. Purely informational: nothing here gates control flow.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStage {
    Idle,
    Fetching,
    Analyzing,
    Presenting,
}

impl LoadingStage {
    pub fn label(&self) -> &'static str {
        match self {
            LoadingStage::Idle => "Ready",
            LoadingStage::Fetching => "Fetching market data",
            LoadingStage::Analyzing => "Analyzing against your profile",
            LoadingStage::Presenting => "Preparing results",
        }
    }

    pub fn helper_text(&self) -> &'static str {
        match self {
            LoadingStage::Idle => "Enter a ticker to start an analysis.",
            LoadingStage::Fetching => "Retrieving the latest quote from the data provider.",
            LoadingStage::Analyzing => "Scoring the stock for your risk tolerance, horizon and objective.",
            LoadingStage::Presenting => "Loading price history and assembling the report.",
        }
    }

    /// Nominal percentage shown while the stage is current
    pub fn progress_percent(&self) -> u8 {
        match self {
            LoadingStage::Idle => 0,
            LoadingStage::Fetching => 30,
            LoadingStage::Analyzing => 65,
            LoadingStage::Presenting => 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub stage: LoadingStage,
    pub percent: u8,
}

impl ProgressState {
    pub fn idle() -> Self {
        Self::at(LoadingStage::Idle)
    }

    fn at(stage: LoadingStage) -> Self {
        Self {
            stage,
            percent: stage.progress_percent(),
        }
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Publishes the current stage to any number of watchers.
#[derive(Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<ProgressState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressState::idle());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ProgressState {
        *self.tx.borrow()
    }

    /// Move to `stage` if it lies ahead of the current one. Returns whether the stage changed.
    pub fn advance(&self, stage: LoadingStage) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if stage > state.stage {
                *state = ProgressState::at(stage);
                true
            } else {
                false
            }
        });
        if !moved {
            tracing::debug!("Ignoring backward progress transition to {:?}", stage);
        }
        moved
    }

    /// Final success: display 100% while still in the presenting stage.
    pub fn complete(&self) {
        self.tx.send_modify(|state| state.percent = 100);
    }

    pub fn reset(&self) {
        self.tx.send_replace(ProgressState::idle());
    }

    /// Reset to idle when the returned guard drops, whatever path the request takes.
    pub fn guard(&self) -> ProgressGuard {
        ProgressGuard {
            tracker: self.clone(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard {
    tracker: ProgressTracker,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.tracker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_percentages() {
        assert_eq!(LoadingStage::Idle.progress_percent(), 0);
        assert_eq!(LoadingStage::Fetching.progress_percent(), 30);
        assert_eq!(LoadingStage::Analyzing.progress_percent(), 65);
        assert_eq!(LoadingStage::Presenting.progress_percent(), 90);
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let tracker = ProgressTracker::new();
        assert!(tracker.advance(LoadingStage::Fetching));
        assert!(tracker.advance(LoadingStage::Analyzing));
        assert!(!tracker.advance(LoadingStage::Fetching));
        assert_eq!(tracker.current().stage, LoadingStage::Analyzing);
        assert_eq!(tracker.current().percent, 65);
    }

    #[test]
    fn test_complete_shows_full_bar_then_guard_resets() {
        let tracker = ProgressTracker::new();
        let rx = tracker.subscribe();
        {
            let _guard = tracker.guard();
            tracker.advance(LoadingStage::Fetching);
            tracker.advance(LoadingStage::Analyzing);
            tracker.advance(LoadingStage::Presenting);
            tracker.complete();
            assert_eq!(
                *rx.borrow(),
                ProgressState { stage: LoadingStage::Presenting, percent: 100 }
            );
        }
        assert_eq!(*rx.borrow(), ProgressState::idle());
    }

    #[test]
    fn test_guard_resets_on_early_exit() {
        let tracker = ProgressTracker::new();

        let failing_step = |tracker: &ProgressTracker| -> Result<(), &'static str> {
            let _guard = tracker.guard();
            tracker.advance(LoadingStage::Fetching);
            Err("upstream down")?;
            tracker.advance(LoadingStage::Analyzing);
            Ok(())
        };

        assert!(failing_step(&tracker).is_err());
        assert_eq!(tracker.current(), ProgressState::idle());
    }
}
