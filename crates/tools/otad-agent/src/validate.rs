//! Streaming validation of uploaded bundles.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::Sha256;
use thiserror::Error;

use otad_common::stream_hasher::StreamHasher;

/// Chunk size for streaming reads.
///
/// Images are hundreds of megabytes; they are never loaded into memory as a
/// whole.
const CHUNK_SIZE: usize = 64 * 1024;

/// Declared properties an uploaded image must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedImage {
    /// Raw SHA-256 digest the image must hash to.
    pub digest: Vec<u8>,
    /// Size in bytes the image must have.
    pub size: u64,
}

impl ExpectedImage {
    /// Parse a `sha256:<hex>` digest declaration.
    pub fn parse(digest: &str, size: u64) -> Result<Self, InvalidDigest> {
        let Some((algorithm, hash)) = digest.split_once(':') else {
            return Err(InvalidDigest("missing `:` delimiter"));
        };
        if algorithm != "sha256" {
            return Err(InvalidDigest("algorithm must be sha256"));
        }
        let digest = hex::decode(hash).map_err(|_| InvalidDigest("digest is not a hex string"))?;
        if digest.len() != 32 {
            return Err(InvalidDigest("invalid digest size"));
        }
        Ok(Self { digest, size })
    }
}

/// Invalid digest declaration.
#[derive(Debug, Error)]
#[error("invalid digest declaration: {0}")]
pub struct InvalidDigest(&'static str);

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub expected_digest: Vec<u8>,
    pub observed_digest: Vec<u8>,
    pub expected_size: u64,
    pub observed_size: u64,
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("update bundle {path:?} does not exist")]
    FileMissing { path: PathBuf },
    #[error("size mismatch: expected {expected} bytes, found {observed}")]
    SizeMismatch { expected: u64, observed: u64 },
    #[error(
        "digest mismatch: expected sha256:{}, found sha256:{}",
        hex::encode(.expected),
        hex::encode(.observed)
    )]
    DigestMismatch { expected: Vec<u8>, observed: Vec<u8> },
    #[error("unable to read update bundle")]
    Io(#[from] std::io::Error),
}

/// Validate the bundle at `path` against the declared digest and size.
///
/// The fraction of bytes consumed is reported through `progress` after every
/// chunk. Any mismatch is an error; there is no partial acceptance.
pub fn validate(
    path: &Path,
    expected: &ExpectedImage,
    mut progress: impl FnMut(f64),
) -> Result<ValidationResult, ValidateError> {
    if !path.exists() {
        return Err(ValidateError::FileMissing {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path)?;
    let mut hasher = StreamHasher::<_, Sha256>::new(file);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = hasher.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        if expected.size > 0 {
            progress((hasher.bytes_read() as f64 / expected.size as f64).min(1.0));
        }
    }
    let observed_size = hasher.bytes_read();
    let observed_digest = hasher.finalize().to_vec();
    if observed_size != expected.size {
        return Err(ValidateError::SizeMismatch {
            expected: expected.size,
            observed: observed_size,
        });
    }
    if observed_digest != expected.digest {
        return Err(ValidateError::DigestMismatch {
            expected: expected.digest.clone(),
            observed: observed_digest,
        });
    }
    progress(1.0);
    Ok(ValidationResult {
        expected_digest: expected.digest.clone(),
        observed_digest,
        expected_size: expected.size,
        observed_size,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sha2::Digest;

    use super::*;

    fn expected_for(data: &[u8]) -> ExpectedImage {
        ExpectedImage {
            digest: Sha256::digest(data).to_vec(),
            size: data.len() as u64,
        }
    }

    #[test]
    fn test_parse_digest_declaration() {
        let digest = "sha256:dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
        let expected = ExpectedImage::parse(digest, 13).unwrap();
        assert_eq!(expected.size, 13);
        assert_eq!(hex::encode(&expected.digest[..2]), "dffd");
        assert!(ExpectedImage::parse("md5:abcd", 1).is_err());
        assert!(ExpectedImage::parse("sha256:zz", 1).is_err());
        assert!(ExpectedImage::parse("sha256:dffd", 1).is_err());
    }

    #[test]
    fn test_validate_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.img");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let mut reports = Vec::new();
        let result = validate(&path, &expected_for(&data), |p| reports.push(p)).unwrap();
        assert_eq!(result.observed_size, data.len() as u64);
        assert_eq!(result.observed_digest, result.expected_digest);
        assert!(reports.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*reports.last().unwrap(), 1.0);
    }

    #[test]
    fn test_validate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.img");
        let error = validate(&path, &expected_for(b"data"), |_| {}).unwrap_err();
        assert!(matches!(error, ValidateError::FileMissing { .. }));
    }

    #[test]
    fn test_validate_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.img");
        fs::write(&path, b"short").unwrap();
        let mut expected = expected_for(b"short");
        expected.size += 1;
        let error = validate(&path, &expected, |_| {}).unwrap_err();
        assert!(matches!(
            error,
            ValidateError::SizeMismatch {
                expected: 6,
                observed: 5
            }
        ));
    }

    #[test]
    fn test_validate_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.img");
        let mut data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = expected_for(&data);
        // Corrupt a single byte somewhere in the middle.
        data[50_000] ^= 0xff;
        fs::write(&path, &data).unwrap();
        let error = validate(&path, &expected, |_| {}).unwrap_err();
        assert!(matches!(error, ValidateError::DigestMismatch { .. }));
    }
}
