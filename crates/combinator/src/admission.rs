//! Cross-session admission control.
//!
//! Every running combinator registers with a shared [`AdmissionRegistry`]
//! and publishes its encode-queue depth through its [`AdmissionHandle`].
//! The registry only keeps atomic sums, so reading the global depth never
//! blocks. A session backs off while either its own queue or the global total
//! is above its threshold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Summed encode-queue depth of all registered sessions.
#[derive(Debug, Default)]
pub struct AdmissionRegistry {
    total: AtomicUsize,
    instances: AtomicUsize,
}

impl AdmissionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session. The handle unregisters on drop.
    pub fn register(self: &Arc<Self>) -> AdmissionHandle {
        let instances = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(instances, "Admission: session registered");
        AdmissionHandle {
            registry: Arc::clone(self),
            depth: 0,
        }
    }

    pub fn total_depth(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

/// One session's share of the registry.
#[derive(Debug)]
pub struct AdmissionHandle {
    registry: Arc<AdmissionRegistry>,
    depth: usize,
}

impl AdmissionHandle {
    /// Publish this session's current queue depth.
    pub fn update(&mut self, depth: usize) {
        if depth > self.depth {
            self.registry
                .total
                .fetch_add(depth - self.depth, Ordering::SeqCst);
        } else if depth < self.depth {
            self.registry
                .total
                .fetch_sub(self.depth - depth, Ordering::SeqCst);
        }
        self.depth = depth;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn total_depth(&self) -> usize {
        self.registry.total_depth()
    }

    /// Whether this session should pause before its next tick.
    pub fn should_wait(&self, instance_threshold: usize, global_threshold: usize) -> bool {
        self.total_depth() > global_threshold || self.depth > instance_threshold
    }
}

impl Drop for AdmissionHandle {
    fn drop(&mut self) {
        self.update(0);
        self.registry.instances.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depths_sum_across_sessions() {
        let registry = AdmissionRegistry::new();
        let mut a = registry.register();
        let mut b = registry.register();
        a.update(40);
        b.update(30);
        assert_eq!(registry.total_depth(), 70);
        a.update(10);
        assert_eq!(registry.total_depth(), 40);
        assert_eq!(registry.instances(), 2);

        drop(b);
        assert_eq!(registry.total_depth(), 10);
        assert_eq!(registry.instances(), 1);
        assert_eq!(a.depth(), 10);
    }

    #[test]
    fn waits_when_either_threshold_exceeded() {
        let registry = AdmissionRegistry::new();
        let mut busy = registry.register();
        let mut other = registry.register();

        busy.update(50);
        assert!(!busy.should_wait(50, 150));
        busy.update(60);
        assert!(busy.should_wait(50, 150));
        assert!(!other.should_wait(50, 150));

        other.update(100);
        // Idle sessions pause too once the process is over its limit.
        assert!(other.should_wait(150, 150));

        busy.update(50);
        assert!(!busy.should_wait(50, 150));
        assert!(!other.should_wait(150, 150));
    }

    #[test]
    fn global_limit_holds_sessions_under_their_own_limit() {
        let registry = AdmissionRegistry::new();
        let mut handles: Vec<_> = (0..4).map(|_| registry.register()).collect();
        for handle in &mut handles {
            handle.update(50);
        }
        assert_eq!(registry.total_depth(), 200);
        assert!(handles.iter().all(|h| h.should_wait(50, 150)));

        handles[0].update(0);
        assert_eq!(registry.total_depth(), 150);
        assert!(handles.iter().all(|h| !h.should_wait(50, 150)));
    }
}
