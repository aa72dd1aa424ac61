use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared cooperative cancellation signal.
///
/// Every `cancel` bumps a shared generation. A flag reports cancelled once the generation
/// has moved past the one it was pinned to, so work pinned before a cancel stays cancelled
/// while work pinned after it runs normally. Long-running steps poll it at fixed
/// checkpoints; nothing is interrupted forcibly.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    generation: Arc<AtomicU64>,
    pinned: u64,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// A flag sharing this signal that counts as cancelled once any cancel lands after `generation`.
    pub fn pinned_at(&self, generation: u64) -> Self {
        Self {
            generation: Arc::clone(&self.generation),
            pinned: generation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.generation() != self.pinned
    }
}
