use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the downloaded file should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "camelCase")]
pub enum Destination {
    /// Platform external-downloads-like directory, falling back to
    /// documents-like, falling back to an app-internal `downloads`
    /// subfolder — see `storage::StorageResolver`.
    Auto,
    /// An absolute directory chosen by the caller.
    Custom(PathBuf),
    /// A path relative to the app-external base directory.
    Scoped(PathBuf),
}

/// Digest algorithm used to verify the downloaded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

/// Immutable description of a single download, as submitted to
/// `Engine::enqueue`. `id` is the handle key through the rest of the
/// system and is stable across pause/resume and process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub url: String,
    pub file_name: String,
    pub destination: Destination,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl Request {
    /// Build a request, generating a UUID handle id if none was supplied.
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            file_name: file_name.into(),
            destination: Destination::Auto,
            headers: HashMap::new(),
            expected_checksum: None,
            checksum_algorithm: ChecksumAlgorithm::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        self.expected_checksum = Some(checksum.into());
        self.checksum_algorithm = algorithm;
        self
    }
}

/// Opaque identifier callers use to pause/resume/stop an enqueued download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: String,
    pub source_url: String,
}

impl Handle {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
        }
    }
}
