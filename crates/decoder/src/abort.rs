//! Cooperative cancellation for in-flight finder work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked by a finder at every yield point. Once triggered the
/// finder discards whatever its decoder still produces and reports `Closed`.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let signal = AbortSignal::new();
        let remote = signal.clone();
        assert!(!signal.is_aborted());
        remote.trigger();
        assert!(signal.is_aborted());
    }
}
