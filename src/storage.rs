//! Storage pre-resolution (§4.B): picks a writable directory, applies the
//! overwrite policy, and checks free space before any network I/O happens.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::request::{Destination, Request};

/// Result of resolving a request's storage placement. Carried in the
/// session and persisted as part of `PausedSnapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageResolution {
    pub directory: PathBuf,
    pub file: PathBuf,
    pub overwrote_existing: bool,
}

/// Picks a writable destination directory and validates it against the
/// configured overwrite/free-space policy.
#[derive(Debug, Clone, Default)]
pub struct StorageResolver;

impl StorageResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a request's target file. `dry_run` performs every check but
    /// skips destructive steps (deleting an existing file, creating the
    /// empty target file) — used by `Engine::preview_destination`.
    pub fn resolve(
        &self,
        config: &StorageConfig,
        request: &Request,
        dry_run: bool,
    ) -> Result<StorageResolution> {
        let directory = self.pick_directory(config)?;
        let file = directory.join(&request.file_name);

        let exists = file.exists();
        let mut overwrote_existing = false;

        if exists {
            if !config.overwrite_existing {
                return Err(EngineError::storage("exists & overwrite disabled"));
            }
            overwrote_existing = true;
            if !dry_run {
                std::fs::remove_file(&file)
                    .map_err(|e| EngineError::storage(format!("failed to remove existing file: {e}")))?;
            }
        }

        if config.validate_free_space {
            let available = available_space(&directory)?;
            if available < config.min_free_space_bytes {
                return Err(EngineError::storage("insufficient space"));
            }
        }

        if !dry_run {
            std::fs::File::create(&file)
                .map_err(|e| EngineError::storage(format!("failed to create target file: {e}")))?;
        }

        info!(?directory, ?file, overwrote_existing, dry_run, "resolved storage");

        Ok(StorageResolution {
            directory,
            file,
            overwrote_existing,
        })
    }

    fn pick_directory(&self, config: &StorageConfig) -> Result<PathBuf> {
        let candidates = self.candidate_directories(config);

        for candidate in candidates {
            if is_writable(&candidate) {
                return Ok(candidate);
            }
            if std::fs::create_dir_all(&candidate).is_ok() {
                debug!(?candidate, "created candidate destination directory");
                return Ok(candidate);
            }
            warn!(?candidate, "candidate destination directory unusable");
        }

        Err(EngineError::storage("no writable directory"))
    }

    fn candidate_directories(&self, config: &StorageConfig) -> Vec<PathBuf> {
        config
            .destinations
            .iter()
            .flat_map(|destination| match destination {
                Destination::Auto => vec![
                    dirs::download_dir(),
                    dirs::document_dir(),
                    dirs::data_local_dir().map(|d| d.join("downlink").join("downloads")),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>(),
                Destination::Custom(path) => vec![path.clone()],
                Destination::Scoped(rel) => dirs::data_local_dir()
                    .map(|base| vec![base.join(rel)])
                    .unwrap_or_default(),
            })
            .collect()
    }
}

fn is_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(format!(".downlink-write-probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn available_space(dir: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let path = CString::new(dir.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| EngineError::storage(format!("invalid path: {e}")))?;

    unsafe {
        let mut stat = MaybeUninit::<libc::statvfs>::zeroed();
        if libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return Err(EngineError::storage("statvfs failed"));
        }
        let stat = stat.assume_init();
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Result<u64> {
    // Conservative: report "plenty of space" on platforms without a statvfs
    // equivalent wired up; validate_free_space is opt-in and the caller can
    // disable it where this matters.
    Ok(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            destinations: vec![Destination::Custom(dir.to_path_buf())],
            overwrite_existing: true,
            validate_free_space: false,
            min_free_space_bytes: 0,
        }
    }

    #[test]
    fn resolves_into_custom_directory() {
        let dir = TempDir::new().unwrap();
        let request = Request::new("http://example.com/a.bin", "a.bin");
        let resolver = StorageResolver::new();
        let resolution = resolver
            .resolve(&storage_config(dir.path()), &request, false)
            .unwrap();
        assert_eq!(resolution.directory, dir.path());
        assert!(resolution.file.exists());
        assert!(!resolution.overwrote_existing);
    }

    #[test]
    fn refuses_overwrite_when_disabled() {
        let dir = TempDir::new().unwrap();
        let request = Request::new("http://example.com/a.bin", "a.bin");
        std::fs::write(dir.path().join("a.bin"), b"existing").unwrap();

        let mut config = storage_config(dir.path());
        config.overwrite_existing = false;

        let resolver = StorageResolver::new();
        let err = resolver.resolve(&config, &request, false).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn dry_run_skips_destructive_steps() {
        let dir = TempDir::new().unwrap();
        let request = Request::new("http://example.com/a.bin", "a.bin");
        std::fs::write(dir.path().join("a.bin"), b"existing").unwrap();

        let config = storage_config(dir.path());
        let resolver = StorageResolver::new();
        let resolution = resolver.resolve(&config, &request, true).unwrap();

        assert!(resolution.overwrote_existing);
        // File was not actually deleted/recreated in dry-run mode.
        assert_eq!(std::fs::read(&resolution.file).unwrap(), b"existing");
    }

    #[test]
    fn insufficient_space_fails_before_any_file_touch() {
        let dir = TempDir::new().unwrap();
        let request = Request::new("http://example.com/a.bin", "a.bin");
        let mut config = storage_config(dir.path());
        config.validate_free_space = true;
        config.min_free_space_bytes = u64::MAX;

        let resolver = StorageResolver::new();
        let err = resolver.resolve(&config, &request, false).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(!dir.path().join("a.bin").exists());
    }
}
