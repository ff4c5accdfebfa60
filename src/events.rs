//! Listener contract (§6): callers implement whichever hooks they care
//! about, default bodies do nothing. `dispatch` fans a single event out to
//! every registered listener, catching panics per-listener so one bad
//! implementation can never take down a session (§7).

use std::sync::Arc;

use crate::error::call_listener;
use crate::progress::Progress;
use crate::request::Handle;

/// Tagged terminal/failure error surfaced through `onFailed`. Mirrors
/// `EngineError` but owns its data so it can be cloned into every listener
/// call without fighting the error type's `Error` trait object rules.
#[derive(Debug, Clone)]
pub enum DownloadError {
    Network { message: String },
    Integrity { errors: Vec<String> },
    Storage { message: String },
    Permanent { message: String },
}

impl From<&crate::error::EngineError> for DownloadError {
    fn from(e: &crate::error::EngineError) -> Self {
        use crate::error::EngineError;
        match e {
            EngineError::Network(m) => Self::Network { message: m.clone() },
            EngineError::Integrity(errors) => Self::Integrity { errors: errors.clone() },
            EngineError::Storage(m) => Self::Storage { message: m.clone() },
            EngineError::Permanent(m) => Self::Permanent { message: m.clone() },
            EngineError::Cancelled => Self::Permanent { message: "cancelled".to_string() },
        }
    }
}

/// Implement any subset; unimplemented hooks are no-ops.
pub trait Listener: Send + Sync {
    fn on_queued(&self, _handle: &Handle) {}
    fn on_started(&self, _handle: &Handle) {}
    fn on_progress(&self, _handle: &Handle, _progress: Progress) {}
    fn on_paused(&self, _handle: &Handle) {}
    fn on_resumed(&self, _handle: &Handle) {}
    fn on_retry(&self, _handle: &Handle, _attempt: u32) {}
    fn on_completed(&self, _handle: &Handle) {}
    fn on_failed(&self, _handle: &Handle, _error: &DownloadError) {}
    fn on_cancelled(&self, _handle: &Handle) {}
}

/// Fans events out to every registered listener, isolating panics so the
/// session's own task loop is never at risk (§7).
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn Listener>>,
}

impl ListenerSet {
    pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Self {
        Self { listeners }
    }

    pub fn queued(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_queued(handle)));
        }
    }

    pub fn started(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_started(handle)));
        }
    }

    pub fn progress(&self, handle: &Handle, progress: Progress) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_progress(handle, progress)));
        }
    }

    pub fn paused(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_paused(handle)));
        }
    }

    pub fn resumed(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_resumed(handle)));
        }
    }

    pub fn retry(&self, handle: &Handle, attempt: u32) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_retry(handle, attempt)));
        }
    }

    pub fn completed(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_completed(handle)));
        }
    }

    pub fn failed(&self, handle: &Handle, error: &DownloadError) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_failed(handle, error)));
        }
    }

    pub fn cancelled(&self, handle: &Handle) {
        for l in &self.listeners {
            call_listener(std::panic::AssertUnwindSafe(|| l.on_cancelled(handle)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        completed: AtomicUsize,
    }

    impl Listener for CountingListener {
        fn on_completed(&self, _handle: &Handle) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;
    impl Listener for PanickingListener {
        fn on_completed(&self, _handle: &Handle) {
            panic!("boom");
        }
    }

    #[test]
    fn dispatch_reaches_every_listener() {
        let counter = Arc::new(CountingListener { completed: AtomicUsize::new(0) });
        let set = ListenerSet::new(vec![counter.clone()]);
        let handle = Handle::new("h1", "http://example.com/a");

        set.completed(&handle);
        set.completed(&handle);

        assert_eq!(counter.completed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_listener_does_not_block_the_rest() {
        let counter = Arc::new(CountingListener { completed: AtomicUsize::new(0) });
        let set = ListenerSet::new(vec![Arc::new(PanickingListener), counter.clone()]);
        let handle = Handle::new("h1", "http://example.com/a");

        set.completed(&handle);

        assert_eq!(counter.completed.load(Ordering::SeqCst), 1);
    }
}
