//! Checkpoint store (§4.C): durable per-handle snapshots and the engine's
//! own configuration, so an external scheduler can recreate the core after
//! process death. All writes are best-effort — an I/O error here degrades
//! to "not saved" rather than propagating into the download path.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::planner::ChunkState;
use crate::request::Request;
use crate::storage::StorageResolution;

const CONFIG_FILE: &str = "config.json";
const PAUSED_DIR: &str = "paused_states";

/// Everything needed to resume a paused or interrupted download without
/// re-resolving storage or re-issuing a HEAD request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedSnapshot {
    pub handle_id: String,
    pub request: Request,
    pub resolution: StorageResolution,
    pub completed_bytes: u64,
    pub chunk_states: Vec<ChunkState>,
}

/// Reads and writes `config.json` and `paused_states/<handleId>.json` under
/// a single state directory, the way the donor codebase's disk cache keeps
/// its index next to the blobs it describes.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: `<data-local-dir>/downlink/downloads-state`.
    pub fn default_location() -> Option<Self> {
        dirs::data_local_dir().map(|base| Self::new(base.join("downlink").join("downloads-state")))
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    fn paused_dir(&self) -> PathBuf {
        self.root.join(PAUSED_DIR)
    }

    fn paused_path(&self, handle_id: &str) -> PathBuf {
        self.paused_dir().join(format!("{handle_id}.json"))
    }

    /// Best-effort, atomic-replace write. Returns whether the save
    /// succeeded; callers never treat failure as fatal.
    pub fn save_config(&self, config: &EngineConfig) -> bool {
        write_json_atomic(&self.config_path(), config)
    }

    /// Returns `None` on a missing or corrupt file — never an error. The
    /// loaded value is re-clamped (§4.A): a hand-edited or stale config.json
    /// is never trusted past construction-time invariants just because it
    /// parsed.
    pub fn load_config(&self) -> Option<EngineConfig> {
        read_json::<EngineConfig>(&self.config_path()).map(EngineConfig::normalized)
    }

    pub fn save_paused_snapshot(&self, snapshot: &PausedSnapshot) -> bool {
        write_json_atomic(&self.paused_path(&snapshot.handle_id), snapshot)
    }

    pub fn load_paused_snapshot(&self, handle_id: &str) -> Option<PausedSnapshot> {
        read_json(&self.paused_path(handle_id))
    }

    /// Scans `paused_states/` and loads every snapshot that parses.
    /// Unreadable directory entries and corrupt files are skipped, not
    /// propagated.
    pub fn load_all_paused_snapshots(&self) -> Vec<PausedSnapshot> {
        let dir = self.paused_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|entry| read_json(&entry.path()))
            .collect()
    }

    pub fn remove_paused_snapshot(&self, handle_id: &str) -> bool {
        match std::fs::remove_file(self.paused_path(handle_id)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(handle_id, error = %e, "failed to remove paused snapshot");
                false
            }
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> bool {
    let Some(parent) = path.parent() else { return false };
    if std::fs::create_dir_all(parent).is_err() {
        return false;
    }

    let bytes = match serde_json::to_vec_pretty(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(?path, error = %e, "failed to serialize checkpoint");
            return false;
        }
    };

    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp_path, &bytes) {
        warn!(?path, error = %e, "failed to write checkpoint temp file");
        return false;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!(?path, error = %e, "failed to finalize checkpoint");
        let _ = std::fs::remove_file(&tmp_path);
        return false;
    }

    debug!(?path, "wrote checkpoint");
    true
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(?path, error = %e, "ignoring corrupt checkpoint file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Destination, Request};
    use tempfile::TempDir;

    fn snapshot(handle_id: &str) -> PausedSnapshot {
        let request = Request::new("http://example.com/a.bin", "a.bin").with_id(handle_id);
        PausedSnapshot {
            handle_id: handle_id.to_string(),
            request,
            resolution: StorageResolution {
                directory: PathBuf::from("/tmp/downlink"),
                file: PathBuf::from("/tmp/downlink/a.bin"),
                overwrote_existing: false,
            },
            completed_bytes: 512,
            chunk_states: vec![ChunkState {
                index: 0,
                start: 0,
                end_inclusive: Some(1023),
                next_offset: 512,
            }],
        }
    }

    #[test]
    fn round_trips_config() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let config = EngineConfig::default().normalized();

        assert!(store.save_config(&config));
        let loaded = store.load_config().unwrap();
        assert_eq!(loaded.chunking.chunk_count, config.chunking.chunk_count);
    }

    #[test]
    fn missing_config_yields_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load_config().is_none());
    }

    #[test]
    fn corrupt_config_yields_none_not_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), b"{ not json").unwrap();

        let store = CheckpointStore::new(dir.path());
        assert!(store.load_config().is_none());
    }

    #[test]
    fn round_trips_paused_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let snap = snapshot("handle-1");

        assert!(store.save_paused_snapshot(&snap));
        let loaded = store.load_paused_snapshot("handle-1").unwrap();
        assert_eq!(loaded.completed_bytes, 512);
        assert_eq!(loaded.chunk_states.len(), 1);
    }

    #[test]
    fn loads_all_paused_snapshots_skipping_corrupt_entries() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());

        store.save_paused_snapshot(&snapshot("handle-1"));
        store.save_paused_snapshot(&snapshot("handle-2"));
        std::fs::create_dir_all(store.paused_dir()).unwrap();
        std::fs::write(store.paused_dir().join("garbage.json"), b"not json").unwrap();

        let mut loaded = store.load_all_paused_snapshots();
        loaded.sort_by(|a, b| a.handle_id.cmp(&b.handle_id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].handle_id, "handle-1");
        assert_eq!(loaded[1].handle_id, "handle-2");
    }

    #[test]
    fn removing_paused_snapshot_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save_paused_snapshot(&snapshot("handle-1"));

        assert!(store.remove_paused_snapshot("handle-1"));
        assert!(store.load_paused_snapshot("handle-1").is_none());
        // Removing again (file already gone) is still a success.
        assert!(store.remove_paused_snapshot("handle-1"));
    }
}
