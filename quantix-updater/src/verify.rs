//! Package integrity verification.
//!
//! Streams a local file through MD5, SHA-256 and/or SHA-512 and compares the
//! result against reference digests supplied by the resolver. Independent of
//! the rest of the pipeline, so it can be pointed at any file.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, error, info};

const BUFFER_SIZE: usize = 64 * 1024; // 64KB buffer

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Md5,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Md5, Algorithm::Sha256, Algorithm::Sha512];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Md5 => 32,
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Algorithm::Md5),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(format!("Unknown digest algorithm '{}'. Must be md5, sha256 or sha512", other)),
        }
    }
}

/// Reference digests published alongside a package, as hex strings.
///
/// Each one is optional and checked independently. Blank strings count as
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDigests {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

impl ReferenceDigests {
    /// Only a SHA-256 reference.
    pub fn sha256(hex: impl Into<String>) -> Self {
        Self {
            sha256: Some(hex.into()),
            ..Default::default()
        }
    }

    /// The supplied (non-blank) references, in a fixed algorithm order.
    pub fn expected(&self) -> Vec<(Algorithm, &str)> {
        Algorithm::ALL
            .iter()
            .filter_map(|&algorithm| {
                let value = match algorithm {
                    Algorithm::Md5 => self.md5.as_deref(),
                    Algorithm::Sha256 => self.sha256.as_deref(),
                    Algorithm::Sha512 => self.sha512.as_deref(),
                };
                value
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| (algorithm, v))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.expected().is_empty()
    }
}

/// Outcome of checking one algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCheck {
    pub algorithm: Algorithm,
    pub expected: String,
    /// Hex digest of the file, if it could be computed
    pub actual: Option<String>,
    /// Why the digest could not be computed
    pub error: Option<String>,
    pub matched: bool,
}

/// Outcome of verifying a file against all supplied references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub checks: Vec<DigestCheck>,
}

impl Verification {
    /// True iff every supplied digest matched. Vacuously true when none
    /// were supplied.
    pub fn is_verified(&self) -> bool {
        self.checks.iter().all(|c| c.matched)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DigestCheck> {
        self.checks.iter().filter(|c| !c.matched)
    }

    /// One-line description of the failed checks
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|c| match (&c.actual, &c.error) {
                (_, Some(err)) => format!("{}: {}", c.algorithm, err),
                (Some(actual), None) => format!(
                    "{}: expected {}, got {}",
                    c.algorithm, c.expected, actual
                ),
                (None, None) => format!("{}: no digest computed", c.algorithm),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Compare two hex digests ignoring case. Different lengths never match.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    let expected = expected.trim();
    actual.len() == expected.len() && actual.eq_ignore_ascii_case(expected)
}

/// Compute the hex digest of a file by streaming it.
pub fn compute_digest(path: &Path, algorithm: Algorithm) -> io::Result<String> {
    match algorithm {
        Algorithm::Md5 => {
            let mut context = md5::Context::new();
            stream_file(path, |chunk| context.consume(chunk))?;
            Ok(hex::encode(context.compute().0))
        }
        Algorithm::Sha256 => {
            let mut hasher = Sha256::new();
            stream_file(path, |chunk| hasher.update(chunk))?;
            Ok(hex::encode(hasher.finalize()))
        }
        Algorithm::Sha512 => {
            let mut hasher = Sha512::new();
            stream_file(path, |chunk| hasher.update(chunk))?;
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

fn stream_file<F: FnMut(&[u8])>(path: &Path, mut sink: F) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sink(&buffer[..n]);
    }

    Ok(())
}

/// Verify `path` against every supplied reference digest.
///
/// Blocking; run it on a blocking worker from async code. An I/O error while
/// hashing fails only that algorithm's check.
pub fn verify_file(path: &Path, digests: &ReferenceDigests) -> Verification {
    let mut verification = Verification::default();

    for (algorithm, expected) in digests.expected() {
        let check = if expected.len() != algorithm.hex_len() {
            DigestCheck {
                algorithm,
                expected: expected.to_string(),
                actual: None,
                error: Some(format!(
                    "reference digest has {} hex digits, expected {}",
                    expected.len(),
                    algorithm.hex_len()
                )),
                matched: false,
            }
        } else {
            match compute_digest(path, algorithm) {
                Ok(actual) => {
                    let matched = digests_match(&actual, expected);
                    DigestCheck {
                        algorithm,
                        expected: expected.to_string(),
                        actual: Some(actual),
                        error: None,
                        matched,
                    }
                }
                Err(e) => DigestCheck {
                    algorithm,
                    expected: expected.to_string(),
                    actual: None,
                    error: Some(e.to_string()),
                    matched: false,
                },
            }
        };

        if check.matched {
            debug!(algorithm = %algorithm, path = %path.display(), "Digest matched");
        } else {
            error!(
                algorithm = %algorithm,
                expected = %check.expected,
                actual = ?check.actual,
                error = ?check.error,
                path = %path.display(),
                "Digest mismatch"
            );
        }
        verification.checks.push(check);
    }

    if verification.is_verified() {
        info!(
            path = %path.display(),
            checks = verification.checks.len(),
            "Package verified"
        );
    }

    verification
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_SHA512: &str = "9b71d224bd62f3785d96d46ad3ea3d73319bfbc2890caadae2dff72519673ca72323c3d99ba5c11d7c7acc6e14b8c5da0c4663475c2e5c3adef46f73bcdec043";

    fn hello_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_compute_known_digests() {
        let file = hello_file();
        assert_eq!(compute_digest(file.path(), Algorithm::Md5).unwrap(), HELLO_MD5);
        assert_eq!(compute_digest(file.path(), Algorithm::Sha256).unwrap(), HELLO_SHA256);
        assert_eq!(compute_digest(file.path(), Algorithm::Sha512).unwrap(), HELLO_SHA512);
    }

    #[test]
    fn test_all_digests_match_case_insensitively() {
        let file = hello_file();
        let digests = ReferenceDigests {
            md5: Some(HELLO_MD5.to_uppercase()),
            sha256: Some(HELLO_SHA256.to_string()),
            sha512: Some(format!(" {} ", HELLO_SHA512.to_uppercase())),
        };

        let verification = verify_file(file.path(), &digests);
        assert_eq!(verification.checks.len(), 3);
        assert!(verification.is_verified());
    }

    #[test]
    fn test_single_mismatch_fails_verification() {
        let file = hello_file();
        let mut wrong = HELLO_SHA256.to_string();
        wrong.replace_range(0..1, "3");
        let digests = ReferenceDigests {
            md5: Some(HELLO_MD5.to_string()),
            sha256: Some(wrong),
            sha512: None,
        };

        let verification = verify_file(file.path(), &digests);
        assert!(!verification.is_verified());
        assert_eq!(verification.failures().count(), 1);
        assert!(verification.failure_summary().starts_with("sha256: expected"));
    }

    #[test]
    fn test_no_references_is_vacuously_verified() {
        let file = hello_file();
        let digests = ReferenceDigests {
            md5: Some("   ".into()),
            ..Default::default()
        };
        assert!(digests.is_empty());
        assert!(verify_file(file.path(), &digests).is_verified());
    }

    #[test]
    fn test_length_mismatch_rejected_without_hashing() {
        let digests = ReferenceDigests::sha256(&HELLO_SHA256[..63]);
        let verification = verify_file(Path::new("/nonexistent/package.zip"), &digests);
        assert!(!verification.is_verified());
        assert!(verification.checks[0].actual.is_none());
        assert!(verification.checks[0].error.as_ref().unwrap().contains("63 hex digits"));

        assert!(!digests_match(HELLO_MD5, &HELLO_MD5[..31]));
    }

    #[test]
    fn test_io_error_fails_only_that_check() {
        let digests = ReferenceDigests::sha256(HELLO_SHA256);
        let verification = verify_file(Path::new("/nonexistent/package.zip"), &digests);
        assert!(!verification.is_verified());
        assert!(verification.checks[0].error.is_some());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("SHA-256".parse::<Algorithm>(), Ok(Algorithm::Sha256));
        assert_eq!("md5".parse::<Algorithm>(), Ok(Algorithm::Md5));
        assert!("crc32".parse::<Algorithm>().is_err());
    }
}
