//! Session manager (§4.G): the orchestrator. Owns every in-flight handle,
//! drives the retry loop, and is the only module that touches both the
//! checkpoint store and the listener set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{instrument, warn};

use crate::checkpoint::{CheckpointStore, PausedSnapshot};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{DownloadError, ListenerSet};
use crate::fetcher::{fetch_chunk, ChunkStateSink, FetchChunkArgs, ProgressSink, SharedFile};
use crate::integrity::IntegrityVerifier;
use crate::planner::{ChunkPlan, ChunkPlanner, ChunkState};
use crate::progress::{Progress, ProgressAggregator};
use crate::request::{Handle, Request};
use crate::storage::{StorageResolution, StorageResolver};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    None,
    Pause,
    Stop,
}

/// Bookkeeping kept for the lifetime of one active attempt chain. Dropped
/// (and its task aborted) once the handle reaches a terminal state or is
/// paused.
struct RunningSession {
    handle: Handle,
    request: Request,
    resolution: StorageResolution,
    cancel: watch::Sender<CancelReason>,
    chunk_states: StdMutex<Vec<ChunkState>>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RunningSession {
    fn completed_bytes(&self) -> u64 {
        self.chunk_states
            .lock()
            .unwrap()
            .iter()
            .map(ChunkState::completed_bytes)
            .sum()
    }
}

pub struct SessionManager {
    config: StdMutex<EngineConfig>,
    listeners: ListenerSet,
    transport: Arc<dyn Transport>,
    checkpoints: CheckpointStore,
    resolver: StorageResolver,
    sessions: StdMutex<HashMap<String, Arc<RunningSession>>>,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        listeners: ListenerSet,
        transport: Arc<dyn Transport>,
        checkpoints: CheckpointStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: StdMutex::new(config.normalized()),
            listeners,
            transport,
            checkpoints,
            resolver: StorageResolver::new(),
            sessions: StdMutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.config.lock().unwrap().clone()
    }

    /// Clamped exactly like construction time (§4.A) — a config loaded from
    /// disk or built by hand is never trusted unnormalized.
    pub fn set_config(&self, config: EngineConfig) {
        *self.config.lock().unwrap() = config.normalized();
    }

    pub fn persist_config(&self) -> bool {
        self.checkpoints.save_config(&self.config())
    }

    pub fn preview_destination(&self, request: &Request) -> Result<StorageResolution> {
        self.resolver.resolve(&self.config().storage, request, true)
    }

    #[instrument(skip_all, fields(id = %request.id))]
    pub fn enqueue(self: &Arc<Self>, request: Request) -> Result<Handle> {
        let handle = Handle::new(request.id.clone(), request.url.clone());
        self.listeners.queued(&handle);

        let resolution = match self.resolver.resolve(&self.config().storage, &request, false) {
            Ok(r) => r,
            Err(e) => {
                self.listeners.failed(&handle, &DownloadError::from(&e));
                return Err(e);
            }
        };

        let snapshot = self.checkpoints.load_paused_snapshot(&handle.id);
        let (start_offset, prior_states) = snapshot
            .map(|s| (s.completed_bytes, s.chunk_states))
            .unwrap_or((0, Vec::new()));

        self.spawn_attempt(handle.clone(), request, resolution, start_offset, prior_states);
        Ok(handle)
    }

    /// `pause` snapshots whatever the fetch tasks have written so far and
    /// signals them to stop; it does not wait for the task to finish.
    pub fn pause(&self, id: &str) -> bool {
        let session = match self.sessions.lock().unwrap().remove(id) {
            Some(s) => s,
            None => return false,
        };

        let _ = session.cancel.send(CancelReason::Pause);
        if let Some(task) = session.task.lock().unwrap().take() {
            task.abort();
        }

        let snapshot = PausedSnapshot {
            handle_id: id.to_string(),
            request: session.request.clone(),
            resolution: session.resolution.clone(),
            completed_bytes: session.completed_bytes(),
            chunk_states: session.chunk_states.lock().unwrap().clone(),
        };
        self.checkpoints.save_paused_snapshot(&snapshot);
        self.listeners.paused(&session.handle);
        true
    }

    pub fn resume(self: &Arc<Self>, id: &str) -> Result<Handle> {
        let Some(snapshot) = self.checkpoints.load_paused_snapshot(id) else {
            return Err(EngineError::storage("no paused snapshot for handle"));
        };

        let handle = Handle::new(snapshot.handle_id.clone(), snapshot.request.url.clone());
        self.spawn_attempt(
            handle.clone(),
            snapshot.request,
            snapshot.resolution,
            snapshot.completed_bytes,
            snapshot.chunk_states,
        );
        self.listeners.resumed(&handle);
        Ok(handle)
    }

    pub fn stop(&self, id: &str) -> bool {
        let session = self.sessions.lock().unwrap().remove(id);
        if let Some(session) = &session {
            let _ = session.cancel.send(CancelReason::Stop);
            if let Some(task) = session.task.lock().unwrap().take() {
                task.abort();
            }
        }
        self.checkpoints.remove_paused_snapshot(id);

        let handle = session
            .map(|s| s.handle.clone())
            .unwrap_or_else(|| Handle::new(id.to_string(), String::new()));
        self.listeners.cancelled(&handle);
        true
    }

    /// Cancel every in-flight session without persisting a `PausedSnapshot`
    /// for any of them — a clean-process-exit path, distinct from
    /// `pause`/`stop`, which this never touches the checkpoint store for.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<RunningSession>> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.cancel.send(CancelReason::Stop);
            if let Some(task) = session.task.lock().unwrap().take() {
                task.abort();
            }
            self.listeners.cancelled(&session.handle);
        }
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        handle: Handle,
        request: Request,
        resolution: StorageResolution,
        start_offset: u64,
        prior_states: Vec<ChunkState>,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(CancelReason::None);
        let running = Arc::new(RunningSession {
            handle: handle.clone(),
            request,
            resolution,
            cancel: cancel_tx,
            chunk_states: StdMutex::new(prior_states.clone()),
            task: StdMutex::new(None),
        });

        self.sessions.lock().unwrap().insert(handle.id.clone(), running.clone());

        let manager = self.clone();
        let running_for_task = running.clone();
        let task = tokio::spawn(async move {
            manager
                .run_with_retry(running_for_task, cancel_rx, start_offset, prior_states)
                .await;
        });
        *running.task.lock().unwrap() = Some(task);
    }

    #[instrument(skip_all, fields(id = %running.handle.id))]
    async fn run_with_retry(
        self: Arc<Self>,
        running: Arc<RunningSession>,
        mut cancel_rx: watch::Receiver<CancelReason>,
        mut start_offset: u64,
        mut prior_states: Vec<ChunkState>,
    ) {
        let config = self.config();
        let mut attempt: u32 = 1;
        let mut delay_ms = config.retry.initial_delay_ms;
        let mut started_emitted = false;

        loop {
            if !started_emitted {
                self.listeners.started(&running.handle);
                started_emitted = true;
            }

            let outcome = self
                .run_one_attempt(&running, &config, start_offset, prior_states.clone(), &mut cancel_rx)
                .await;

            match outcome {
                Ok(()) => {
                    self.checkpoints.remove_paused_snapshot(&running.handle.id);
                    self.sessions.lock().unwrap().remove(&running.handle.id);
                    self.listeners.completed(&running.handle);
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    // Cancellation is only ever observed here after the
                    // caller has already recorded why (pause vs stop);
                    // `pause`/`stop` emit their own terminal events.
                    return;
                }
                Err(AttemptError::Integrity(errors)) => {
                    let _ = std::fs::remove_file(&running.resolution.file);
                    prior_states = Vec::new();
                    start_offset = 0;
                    *running.chunk_states.lock().unwrap() = Vec::new();

                    if attempt >= config.retry.max_attempts {
                        self.finish_failed(&running, DownloadError::Integrity { errors });
                        return;
                    }
                }
                Err(AttemptError::Network(message)) => {
                    prior_states = running.chunk_states.lock().unwrap().clone();
                    start_offset = running.completed_bytes();

                    if attempt >= config.retry.max_attempts {
                        self.finish_failed(&running, DownloadError::Network { message });
                        return;
                    }
                }
                Err(AttemptError::Permanent(message)) => {
                    self.finish_failed(&running, DownloadError::Permanent { message });
                    return;
                }
            }

            self.listeners.retry(&running.handle, attempt);
            sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms as f64 * config.retry.backoff_multiplier).max(1000.0) as u64;
            attempt += 1;
        }
    }

    fn finish_failed(&self, running: &RunningSession, error: DownloadError) {
        self.sessions.lock().unwrap().remove(&running.handle.id);
        self.listeners.failed(&running.handle, &error);
    }

    async fn run_one_attempt(
        &self,
        running: &Arc<RunningSession>,
        config: &EngineConfig,
        start_offset: u64,
        prior_states: Vec<ChunkState>,
        cancel_rx: &mut watch::Receiver<CancelReason>,
    ) -> std::result::Result<(), AttemptError> {
        let total_bytes = probe_total_bytes(&*self.transport, &running.request).await;

        let file = match SharedFile::open(&running.resolution.file) {
            Ok(f) => f,
            Err(e) => return Err(AttemptError::Network(format!("failed to open target file: {e}"))),
        };

        // A file shorter than the recorded progress — truncated or replaced
        // externally between runs — is never trusted past its real length
        // (§8): clamp every chunk's resume point, and the scalar fallback
        // offset, down to what is actually on disk before planning.
        let file_len = file.len().unwrap_or(0);
        let mut prior_states = prior_states;
        let start_offset = clamp_to_file_length(file_len, start_offset, &mut prior_states);

        let plans = ChunkPlanner::plan(total_bytes, &config.chunking, start_offset, &prior_states);
        // An empty plan means every chunk was already complete (e.g.
        // re-planning after a race) — nothing to fetch, go straight to
        // verification with the prior states as-is.
        if !plans.is_empty() {
            *running.chunk_states.lock().unwrap() = if prior_states.is_empty() {
                ChunkPlanner::initial_states(&plans)
            } else {
                prior_states.clone()
            };
        }

        let progress = ProgressAggregator::new(start_offset, total_bytes);
        let permits = if config.chunking.prefer_parallel && plans.len() > 1 {
            plans.len().min(config.chunking.chunk_count as usize).max(1)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let running_clone = running.clone();
        let on_chunk_state: ChunkStateSink = Arc::new(move |state: ChunkState| {
            let mut states = running_clone.chunk_states.lock().unwrap();
            if let Some(existing) = states.iter_mut().find(|s| s.index == state.index) {
                *existing = state;
            } else {
                states.push(state);
            }
        });

        let listeners = self.listeners.clone();
        let handle_for_progress = running.handle.clone();
        let on_progress: ProgressSink = Arc::new(move |update: Progress| {
            listeners.progress(&handle_for_progress, update);
        });

        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            let transport = self.transport.clone();
            let file_ref = &file;
            let url = running.request.url.clone();
            let headers = running.request.headers.clone();
            let session_id = running.handle.id.clone();
            let on_chunk_state = on_chunk_state.clone();
            let on_progress = on_progress.clone();
            let semaphore = semaphore.clone();
            let progress_ref = &progress;

            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                fetch_one(
                    plan,
                    url,
                    headers,
                    file_ref,
                    transport.as_ref(),
                    session_id,
                    progress_ref,
                    on_chunk_state,
                    on_progress,
                )
                .await
            });
        }

        let results = run_cancelable(tasks, cancel_rx).await;
        match results {
            CancelOrResults::Cancelled => return Err(AttemptError::Cancelled),
            CancelOrResults::Results(results) => {
                for result in results {
                    result.map_err(classify_fetch_error)?;
                }
            }
        }

        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &config.integrity,
            &running.request,
            &running.resolution.file,
            progress.total_bytes(),
            None,
        );

        if report.ok {
            Ok(())
        } else {
            Err(AttemptError::Integrity(report.errors))
        }
    }
}

enum AttemptError {
    Network(String),
    Integrity(Vec<String>),
    Permanent(String),
    Cancelled,
}

fn classify_fetch_error(e: EngineError) -> AttemptError {
    match e {
        EngineError::Network(m) => AttemptError::Network(m),
        EngineError::Permanent(m) => AttemptError::Permanent(m),
        EngineError::Storage(m) => AttemptError::Network(m),
        EngineError::Integrity(errors) => AttemptError::Integrity(errors),
        EngineError::Cancelled => AttemptError::Cancelled,
    }
}

enum CancelOrResults<T> {
    Cancelled,
    Results(Vec<T>),
}

/// Drive every fetch task to completion, but bail out early (without
/// waiting on the rest) if a pause/stop arrives on `cancel_rx` first.
async fn run_cancelable<F>(
    tasks: Vec<F>,
    cancel_rx: &mut watch::Receiver<CancelReason>,
) -> CancelOrResults<Result<()>>
where
    F: std::future::Future<Output = Result<()>>,
{
    let joined = futures::future::join_all(tasks);
    tokio::pin!(joined);

    tokio::select! {
        results = &mut joined => CancelOrResults::Results(results),
        _ = cancel_rx.changed() => {
            if *cancel_rx.borrow() == CancelReason::None {
                // Spurious wakeup (initial value); keep waiting for real work.
                CancelOrResults::Results(joined.await)
            } else {
                CancelOrResults::Cancelled
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one(
    plan: ChunkPlan,
    url: String,
    headers: std::collections::HashMap<String, String>,
    file: &SharedFile,
    transport: &dyn Transport,
    session_id: String,
    progress: &ProgressAggregator,
    on_chunk_state: ChunkStateSink,
    on_progress: ProgressSink,
) -> Result<()> {
    fetch_chunk(FetchChunkArgs {
        plan,
        url: &url,
        headers: &headers,
        file,
        transport,
        session_id: &session_id,
        progress,
        on_chunk_state: &on_chunk_state,
        on_progress: &on_progress,
    })
    .await
}

/// Clamp a resume baseline against the target file's actual on-disk length
/// (§8): a file shorter than what was recorded — truncated or replaced
/// externally between runs — must never be trusted past its real length.
/// Returns the clamped scalar `start_offset`; `chunk_states` is adjusted
/// in place.
fn clamp_to_file_length(file_len: u64, start_offset: u64, chunk_states: &mut [ChunkState]) -> u64 {
    for state in chunk_states.iter_mut() {
        let written = file_len
            .saturating_sub(state.start)
            .min(state.next_offset.saturating_sub(state.start));
        state.next_offset = state.start + written;
    }

    start_offset.min(file_len)
}

async fn probe_total_bytes(transport: &dyn Transport, request: &Request) -> Option<u64> {
    match transport.head(&request.url, &request.headers).await {
        Ok(info) => info.length,
        Err(e) => {
            warn!(error = %e, "HEAD probe failed; falling back to unknown length");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_drops_progress_past_a_truncated_file() {
        let mut states = vec![
            ChunkState { index: 0, start: 0, end_inclusive: Some(999), next_offset: 1000 },
            ChunkState { index: 1, start: 1000, end_inclusive: Some(1999), next_offset: 1500 },
        ];

        // File on disk is only 1200 bytes: chunk 0 still fully holds up,
        // chunk 1's recorded progress (500 bytes in) shrinks to 200.
        let clamped = clamp_to_file_length(1200, 1500, &mut states);

        assert_eq!(clamped, 1200);
        assert_eq!(states[0].next_offset, 1000);
        assert_eq!(states[1].next_offset, 1200);
    }

    #[test]
    fn clamp_resets_a_chunk_the_file_never_reached() {
        let mut states = vec![ChunkState { index: 0, start: 1000, end_inclusive: Some(1999), next_offset: 1500 }];

        // File is shorter than this chunk's own start: no bytes of it exist.
        let clamped = clamp_to_file_length(500, 1500, &mut states);

        assert_eq!(clamped, 500);
        assert_eq!(states[0].next_offset, 1000);
    }

    #[test]
    fn clamp_is_a_no_op_when_file_covers_all_recorded_progress() {
        let mut states = vec![ChunkState { index: 0, start: 0, end_inclusive: Some(999), next_offset: 500 }];
        let clamped = clamp_to_file_length(10_000, 500, &mut states);

        assert_eq!(clamped, 500);
        assert_eq!(states[0].next_offset, 500);
    }
}
