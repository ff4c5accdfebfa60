//! Progress aggregator (§4.F): folds byte deltas from every in-flight
//! chunk into a single smoothed-rate, throttled progress stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

const MIN_INTERVAL_MS: u64 = 200;
const MIN_BYTES_STEP: u64 = 24 * 1024;
const EWMA_ALPHA: f64 = 0.6;

/// A single progress observation, handed to the `onProgress` listener hook.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Progress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<u8>,
    pub bytes_per_second: f64,
}

/// Thread-safe accumulator shared by every chunk's fetch task. `downloaded`
/// starts at the bytes already on disk from a prior attempt.
pub struct ProgressAggregator {
    downloaded: AtomicU64,
    total_bytes: AtomicU64,
    total_known: AtomicBool,
    state: std::sync::Mutex<EmitState>,
}

struct EmitState {
    last_emission: Instant,
    last_emitted_bytes: u64,
    last_rate_timestamp: Instant,
    last_rate_bytes: u64,
    smoothed_rate: Option<f64>,
}

impl ProgressAggregator {
    pub fn new(start_offset: u64, total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            downloaded: AtomicU64::new(start_offset),
            total_bytes: AtomicU64::new(total_bytes.unwrap_or(0)),
            total_known: AtomicBool::new(total_bytes.is_some()),
            state: std::sync::Mutex::new(EmitState {
                last_emission: now,
                last_emitted_bytes: start_offset,
                last_rate_timestamp: now,
                last_rate_bytes: start_offset,
                smoothed_rate: None,
            }),
        }
    }

    /// Publish the total length exactly once, from whichever chunk response
    /// discovers it first (double-checked so late/duplicate arrivals are
    /// dropped silently).
    pub fn set_total_bytes_once(&self, total_bytes: u64) {
        if self
            .total_known
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.total_bytes.store(total_bytes, Ordering::Release);
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_known.load(Ordering::Acquire).then(|| self.total_bytes.load(Ordering::Acquire))
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Record `delta` freshly written bytes and decide whether this delta
    /// should surface as a `Progress` emission.
    pub fn record(&self, delta: u64) -> Option<Progress> {
        let downloaded = self.downloaded.fetch_add(delta, Ordering::AcqRel) + delta;
        let total = self.total_bytes();
        let percent = total.map(|t| percent_of(downloaded, t));

        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_rate_timestamp).as_secs_f64();
        if elapsed > 0.0 {
            let raw_rate = (downloaded - state.last_rate_bytes) as f64 / elapsed;
            state.smoothed_rate = Some(match state.smoothed_rate {
                Some(prev) => EWMA_ALPHA * raw_rate + (1.0 - EWMA_ALPHA) * prev,
                None => raw_rate,
            });
            state.last_rate_timestamp = now;
            state.last_rate_bytes = downloaded;
        }

        let since_last_emit_ms = now.duration_since(state.last_emission).as_millis() as u64;
        let bytes_since_emit = downloaded.saturating_sub(state.last_emitted_bytes);

        let should_emit = total.is_none()
            || since_last_emit_ms >= MIN_INTERVAL_MS
            || bytes_since_emit >= MIN_BYTES_STEP
            || percent == Some(100);

        if !should_emit {
            return None;
        }

        state.last_emission = now;
        state.last_emitted_bytes = downloaded;

        Some(Progress {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent,
            bytes_per_second: state.smoothed_rate.unwrap_or(0.0),
        })
    }

    pub fn remaining_bytes(&self) -> Option<u64> {
        self.total_bytes().map(|t| t.saturating_sub(self.downloaded_bytes()))
    }
}

fn percent_of(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (downloaded.saturating_mul(100) / total).min(100);
    pct as u8
}
