use serde::{Deserialize, Serialize};

use crate::request::Destination;

const MIN_CHUNK_SIZE_FLOOR: u64 = 64 * 1024;

/// Controls how a download is split into parallel range jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Chunking {
    pub chunk_count: u32,
    pub min_chunk_size_bytes: u64,
    pub prefer_parallel: bool,
}

impl Default for Chunking {
    fn default() -> Self {
        Self {
            chunk_count: 3,
            min_chunk_size_bytes: 512 * 1024,
            prefer_parallel: true,
        }
    }
}

impl Chunking {
    /// Clamp to the invariants in §4.A: chunk count at least one, minimum
    /// chunk size at least 64 KiB.
    fn normalize(mut self) -> Self {
        self.chunk_count = self.chunk_count.max(1);
        self.min_chunk_size_bytes = self.min_chunk_size_bytes.max(MIN_CHUNK_SIZE_FLOOR);
        self
    }
}

/// Retry/backoff parameters for the session manager's retry driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn normalize(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.backoff_multiplier = self.backoff_multiplier.max(1.0);
        self
    }
}

/// Storage placement and overwrite/free-space policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub destinations: Vec<Destination>,
    pub overwrite_existing: bool,
    pub validate_free_space: bool,
    pub min_free_space_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            destinations: vec![Destination::Auto],
            overwrite_existing: true,
            validate_free_space: true,
            min_free_space_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Which post-download checks the integrity verifier runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub verify_file_size: bool,
    pub verify_checksum: bool,
    pub verify_archive_structure: bool,
    pub verify_content_type: bool,
    pub verify_signature: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            verify_file_size: true,
            verify_checksum: true,
            verify_archive_structure: true,
            verify_content_type: false,
            verify_signature: false,
        }
    }
}

/// Immutable configuration record consumed by the engine. Construct with
/// `EngineConfig::default()` or `EngineConfig::builder()`, the way the donor
/// codebase's `FileCacheConfig` is built up field-by-field before use.
///
/// `listeners` is intentionally not a field here — the engine takes those
/// separately at construction time (see `Engine::new`), so there is nothing
/// to strip when persisting this type to `config.json` (§4.C).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: Chunking,
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub integrity: IntegrityConfig,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Apply the construction-time clamps documented in §4.A.
    pub fn normalized(mut self) -> Self {
        self.chunking = self.chunking.normalize();
        self.retry = self.retry.normalize();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn chunking(mut self, chunking: Chunking) -> Self {
        self.config.chunking = chunking;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn integrity(mut self, integrity: IntegrityConfig) -> Self {
        self.config.integrity = integrity;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default().normalized();
        assert_eq!(cfg.chunking.chunk_count, 3);
        assert_eq!(cfg.chunking.min_chunk_size_bytes, 512 * 1024);
        assert!(cfg.chunking.prefer_parallel);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_delay_ms, 2000);
        assert_eq!(cfg.retry.backoff_multiplier, 2.0);
        assert!(cfg.integrity.verify_file_size);
        assert!(cfg.integrity.verify_checksum);
        assert!(cfg.integrity.verify_archive_structure);
        assert!(!cfg.integrity.verify_content_type);
        assert!(!cfg.integrity.verify_signature);
    }

    #[test]
    fn chunking_is_clamped() {
        let chunking = Chunking {
            chunk_count: 0,
            min_chunk_size_bytes: 10,
            prefer_parallel: true,
        }
        .normalize();
        assert_eq!(chunking.chunk_count, 1);
        assert_eq!(chunking.min_chunk_size_bytes, MIN_CHUNK_SIZE_FLOOR);
    }

    #[test]
    fn backoff_multiplier_is_clamped() {
        let retry = RetryPolicy {
            max_attempts: 0,
            initial_delay_ms: 0,
            backoff_multiplier: 0.2,
        }
        .normalize();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.backoff_multiplier, 1.0);
    }
}
