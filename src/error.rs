use thiserror::Error;

/// The five-way error taxonomy the session manager's retry driver switches
/// on: each kind carries its own retry policy (see `session::run_with_retry`).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("integrity check failed: {0:?}")]
    Integrity(Vec<String>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn integrity(errors: Vec<String>) -> Self {
        Self::Integrity(errors)
    }

    /// True when the retry driver should retry-with-resume (keep file,
    /// replay checkpoints) rather than restart from zero or give up.
    pub fn is_retryable_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_retryable_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Classify an HTTP status code per §7: 4xx except 408/429 is permanent,
    /// everything else retryable as a network error.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 429 => Self::Network(format!("HTTP {status}")),
            400..=499 => Self::Permanent(format!("HTTP {status}")),
            _ => Self::Network(format!("HTTP {status}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Invoke a listener callback, catching panics so a misbehaving listener can
/// never unwind into the engine's task loop (§7: "Listeners that raise
/// exceptions must not propagate to the engine").
pub fn call_listener<F: FnOnce() + std::panic::UnwindSafe>(f: F) {
    if let Err(panic) = std::panic::catch_unwind(f) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!("listener callback panicked: {msg}");
    }
}
