use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag used to cancel a build in flight.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag before the next build starts.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
