//! A resumable, chunked HTTP download engine with persistent session state,
//! integrity verification, retry/backoff, and a small lifecycle-callback
//! surface (see `spec.md` at the repository root for the full contract).
//!
//! This crate never installs a global `tracing` subscriber — that is the
//! embedding binary's job (see `src/main.rs`).

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod integrity;
pub mod planner;
pub mod progress;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use std::time::SystemTime;

pub use checkpoint::CheckpointStore;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{DownloadError, Listener};
pub use progress::Progress;
pub use request::{ChecksumAlgorithm, Destination, Handle, Request};
pub use storage::StorageResolution;

use events::ListenerSet;
use scheduler::Scheduler;
use session::SessionManager;
use transport::{ReqwestTransport, Transport};

/// Top-level handle to a running engine. Construct with [`Engine::new`] or
/// [`Engine::builder`]; everything else goes through its methods.
pub struct Engine {
    sessions: Arc<SessionManager>,
    scheduler: Scheduler,
}

impl Engine {
    /// Build an engine with the default `reqwest`-backed transport. The
    /// checkpoint store defaults to the platform data-local directory;
    /// pass an explicit one via [`Engine::with_checkpoint_store`] in tests.
    pub fn new(config: EngineConfig, listeners: Vec<Arc<dyn Listener>>) -> Arc<Self> {
        let checkpoints = CheckpointStore::default_location()
            .unwrap_or_else(|| CheckpointStore::new(std::env::temp_dir().join("downlink-state")));
        Self::with_checkpoint_store(config, listeners, checkpoints)
    }

    pub fn with_checkpoint_store(
        config: EngineConfig,
        listeners: Vec<Arc<dyn Listener>>,
        checkpoints: CheckpointStore,
    ) -> Arc<Self> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new());
        Self::with_transport(config, listeners, checkpoints, transport)
    }

    /// Build an engine over a custom transport — the seam tests use to
    /// substitute an in-memory double for `reqwest`.
    pub fn with_transport(
        config: EngineConfig,
        listeners: Vec<Arc<dyn Listener>>,
        checkpoints: CheckpointStore,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let sessions = SessionManager::new(config, ListenerSet::new(listeners), transport, checkpoints);
        Arc::new(Self { sessions, scheduler: Scheduler::new() })
    }

    pub fn enqueue(self: &Arc<Self>, request: Request) -> Result<Handle> {
        self.sessions.enqueue(request)
    }

    pub fn pause(&self, id: &str) -> bool {
        self.sessions.pause(id)
    }

    pub fn resume(self: &Arc<Self>, id: &str) -> Result<Handle> {
        self.sessions.resume(id)
    }

    pub fn stop(&self, id: &str) -> bool {
        self.sessions.stop(id)
    }

    /// Cancel every in-flight session without persisting a `PausedSnapshot`
    /// for any of them — a clean-process-exit path, distinct from
    /// `pause`/`stop`. Only covers this process's own tokio runtime
    /// teardown; scheduling and process-lifecycle concerns beyond that are
    /// out of scope.
    pub fn shutdown(&self) {
        self.sessions.shutdown()
    }

    /// Delegates to the scheduler collaborator (§4.G): `enqueue` runs once
    /// `when` has elapsed, unless cancelled first via `cancel_scheduled`.
    pub fn schedule(self: &Arc<Self>, request: Request, when: SystemTime) -> String {
        let engine = self.clone();
        self.scheduler.schedule(request, when, move |request| {
            let _ = engine.enqueue(request);
        })
    }

    pub fn cancel_scheduled(&self, id: &str) -> bool {
        self.scheduler.cancel(id)
    }

    /// Dry-run storage resolution: performs every check the real resolver
    /// would, but skips destructive steps (deleting an existing file,
    /// creating the empty target).
    pub fn preview_destination(&self, request: &Request) -> Result<StorageResolution> {
        self.sessions.preview_destination(request)
    }

    pub fn config(&self) -> EngineConfig {
        self.sessions.config()
    }

    pub fn set_config(&self, config: EngineConfig) {
        self.sessions.set_config(config)
    }

    /// Flush the engine's own configuration to the checkpoint store so an
    /// external scheduler can recreate it after process death (§4.C).
    pub fn persist_config(&self) -> bool {
        // Routed through the session manager's own checkpoint store so the
        // persisted value always matches what `config()` returns.
        self.sessions.persist_config()
    }
}
