//! Integrity verifier (§4.H): runs the configured post-download checks in a
//! fixed order and collects every failure rather than short-circuiting on
//! the first one, so a caller sees the whole picture.

use std::io::Read;
use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest, Sha256, Sha512};
use tracing::warn;

use crate::config::IntegrityConfig;
use crate::request::{ChecksumAlgorithm, Request};

const ARCHIVE_EXTENSIONS: &[&str] = &["apk", "apks"];
const READ_CHUNK: usize = 64 * 1024;

/// Delegate for the one check this crate cannot perform on its own:
/// cryptographic signature verification is inherently platform/scheme
/// specific (APK v2 signing, code signing, PGP, ...).
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, file: &Path) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub ok: bool,
    pub errors: Vec<String>,
}

pub struct IntegrityVerifier<'a> {
    pub signature_verifier: Option<&'a dyn SignatureVerifier>,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(signature_verifier: Option<&'a dyn SignatureVerifier>) -> Self {
        Self { signature_verifier }
    }

    pub fn verify(
        &self,
        config: &IntegrityConfig,
        request: &Request,
        file: &Path,
        expected_size: Option<u64>,
        response_content_type: Option<&str>,
    ) -> VerificationReport {
        let mut errors = Vec::new();

        if config.verify_file_size {
            self.check_size(file, expected_size, &mut errors);
        }

        if config.verify_checksum {
            self.check_digest(file, request, &mut errors);
        }

        if config.verify_content_type {
            self.check_content_type(file, response_content_type, &mut errors);
        }

        if config.verify_archive_structure {
            self.check_archive_shape(file, &mut errors);
        }

        if config.verify_signature {
            self.check_signature(file, &mut errors);
        }

        VerificationReport { ok: errors.is_empty(), errors }
    }

    fn check_size(&self, file: &Path, expected_size: Option<u64>, errors: &mut Vec<String>) {
        let Some(expected) = expected_size else { return };
        match std::fs::metadata(file) {
            Ok(meta) if meta.len() == expected => {}
            Ok(meta) => errors.push(format!(
                "size mismatch: expected {expected} bytes, found {}",
                meta.len()
            )),
            Err(e) => errors.push(format!("failed to stat downloaded file: {e}")),
        }
    }

    fn check_digest(&self, file: &Path, request: &Request, errors: &mut Vec<String>) {
        let Some(expected) = &request.expected_checksum else { return };
        let expected = expected.trim().to_lowercase();

        let actual = match digest_file(file, request.checksum_algorithm) {
            Ok(digest) => digest,
            Err(e) => {
                errors.push(format!("failed to read file for digest: {e}"));
                return;
            }
        };

        if actual != expected {
            errors.push(format!(
                "checksum mismatch: expected {expected}, computed {actual}"
            ));
        }
    }

    fn check_content_type(&self, file: &Path, response_content_type: Option<&str>, errors: &mut Vec<String>) {
        let Some(actual) = response_content_type else {
            errors.push("content-type check enabled but response carried none".to_string());
            return;
        };
        let actual_media_type = actual.split(';').next().unwrap_or(actual).trim().to_lowercase();

        let Some(expected_media_type) = expected_media_type_for_extension(file) else {
            return;
        };

        if actual_media_type != expected_media_type {
            errors.push(format!(
                "content-type mismatch: expected {expected_media_type}, got {actual_media_type}"
            ));
        }
    }

    fn check_archive_shape(&self, file: &Path, errors: &mut Vec<String>) {
        let Some(ext) = file.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) else {
            return;
        };
        if !ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
            return;
        }

        let mut magic = [0u8; 2];
        match std::fs::File::open(file).and_then(|mut f| f.read_exact(&mut magic)) {
            Ok(()) if &magic == b"PK" => {}
            Ok(()) => {
                errors.push("archive magic bytes missing (expected PK)".to_string());
                return;
            }
            Err(e) => {
                errors.push(format!("failed to read archive header: {e}"));
                return;
            }
        }

        let archive = std::fs::File::open(file).and_then(|f| {
            zip::ZipArchive::new(f).map_err(|e| std::io::Error::other(e.to_string()))
        });

        match archive {
            Ok(archive) => {
                if archive.len() == 0 {
                    errors.push("archive contains no entries".to_string());
                } else if !(0..archive.len()).any(|i| {
                    archive
                        .name_for_index(i)
                        .map(|n| n.contains("MANIFEST") || n.contains("AndroidManifest.xml"))
                        .unwrap_or(false)
                }) {
                    warn!(?file, "archive has no manifest entry");
                }
            }
            Err(e) => errors.push(format!("failed to open archive: {e}")),
        }
    }

    fn check_signature(&self, file: &Path, errors: &mut Vec<String>) {
        match self.signature_verifier {
            Some(verifier) => {
                if !verifier.verify(file) {
                    errors.push("signature verification failed".to_string());
                }
            }
            None => errors.push("signature verification enabled but no verifier was provided".to_string()),
        }
    }
}

fn digest_file(file: &Path, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    let mut reader = std::fs::File::open(file)?;
    let mut buf = vec![0u8; READ_CHUNK];

    match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        ChecksumAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

fn expected_media_type_for_extension(file: &Path) -> Option<&'static str> {
    match file.extension().and_then(|e| e.to_str())?.to_lowercase().as_str() {
        "apk" | "apks" | "zip" => Some("application/vnd.android.package-archive"),
        "pdf" => Some("application/pdf"),
        "json" => Some("application/json"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPasses;
    impl SignatureVerifier for AlwaysPasses {
        fn verify(&self, _file: &Path) -> bool {
            true
        }
    }

    struct AlwaysFails;
    impl SignatureVerifier for AlwaysFails {
        fn verify(&self, _file: &Path) -> bool {
            false
        }
    }

    fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("download.bin");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn size_mismatch_is_reported() {
        let (_dir, path) = write_temp(b"hello");
        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: true, verify_checksum: false, verify_archive_structure: false, verify_content_type: false, verify_signature: false },
            &Request::new("http://example.com/a", "a"),
            &path,
            Some(100),
            None,
        );
        assert!(!report.ok);
        assert!(report.errors[0].contains("size mismatch"));
    }

    #[test]
    fn digest_match_passes() {
        let (_dir, path) = write_temp(b"hello world");
        let expected = hex::encode(Sha256::digest(b"hello world"));
        let request = Request::new("http://example.com/a", "a").with_checksum(expected, ChecksumAlgorithm::Sha256);

        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: true, verify_archive_structure: false, verify_content_type: false, verify_signature: false },
            &request,
            &path,
            None,
            None,
        );
        assert!(report.ok);
    }

    #[test]
    fn digest_mismatch_is_case_and_whitespace_tolerant_but_still_fails_on_wrong_value() {
        let (_dir, path) = write_temp(b"hello world");
        let request = Request::new("http://example.com/a", "a")
            .with_checksum("  DEADBEEF  ".to_string(), ChecksumAlgorithm::Sha256);

        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: true, verify_archive_structure: false, verify_content_type: false, verify_signature: false },
            &request,
            &path,
            None,
            None,
        );
        assert!(!report.ok);
    }

    #[test]
    fn signature_check_fails_closed_without_a_verifier() {
        let (_dir, path) = write_temp(b"data");
        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: false, verify_archive_structure: false, verify_content_type: false, verify_signature: true },
            &Request::new("http://example.com/a", "a"),
            &path,
            None,
            None,
        );
        assert!(!report.ok);
    }

    #[test]
    fn signature_check_delegates_to_host_verifier() {
        let (_dir, path) = write_temp(b"data");
        let pass = AlwaysPasses;
        let verifier = IntegrityVerifier::new(Some(&pass));
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: false, verify_archive_structure: false, verify_content_type: false, verify_signature: true },
            &Request::new("http://example.com/a", "a"),
            &path,
            None,
            None,
        );
        assert!(report.ok);

        let fail = AlwaysFails;
        let verifier = IntegrityVerifier::new(Some(&fail));
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: false, verify_archive_structure: false, verify_content_type: false, verify_signature: true },
            &Request::new("http://example.com/a", "a"),
            &path,
            None,
            None,
        );
        assert!(!report.ok);
    }

    #[test]
    fn non_archive_extension_skips_archive_shape_check() {
        let (_dir, path) = write_temp(b"not a zip");
        let verifier = IntegrityVerifier::new(None);
        let report = verifier.verify(
            &IntegrityConfig { verify_file_size: false, verify_checksum: false, verify_archive_structure: true, verify_content_type: false, verify_signature: false },
            &Request::new("http://example.com/a", "a"),
            &path,
            None,
            None,
        );
        assert!(report.ok);
    }
}
