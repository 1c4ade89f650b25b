//! Package manifest parsing and checksum verification.
//!
//! A manifest lists one checksum per package member:
//!
//! ```text
//! SHA256(appliance.ovf)= 3f2a...
//! SHA1(disk.vmdk)= 9c1d...
//! ```
//!
//! Blank and malformed lines are ignored. After each upload the pipeline
//! compares the manifest entry against the checksum the platform computed
//! over the received bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};
use crate::package::Archive;

/// Buffer size used when hashing members locally.
const DIGEST_BUFFER_SIZE: usize = 256 * 1024;

/// Whether a missing manifest stops the import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestPolicy {
    /// A missing manifest is fatal.
    Require,
    /// A missing manifest is logged and verification is disabled for the run.
    #[default]
    Warn,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// Algorithm name as written in the manifest (e.g. `SHA256`).
    pub algorithm: String,
    /// Hex digest.
    pub checksum: String,
}

impl Checksum {
    pub fn new(algorithm: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            checksum: checksum.into(),
        }
    }

    /// Returns true if the algorithm is SHA1, in any casing.
    pub fn is_sha1(&self) -> bool {
        self.algorithm.eq_ignore_ascii_case("SHA1")
    }
}

/// Name → checksum mapping parsed from a manifest file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, Checksum>,
}

impl Manifest {
    /// Parse a manifest, skipping blank, malformed and non-UTF-8 lines.
    ///
    /// # Errors
    ///
    /// Only I/O errors from the underlying reader are reported.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for line in BufReader::new(reader).split(b'\n') {
            let Ok(line) = String::from_utf8(line?) else {
                continue;
            };
            if let Some((name, sum)) = parse_line(line.trim_end_matches('\r')) {
                entries.insert(name, sum);
            }
        }

        Ok(Self { entries })
    }

    /// Look up the checksum recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&Checksum> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, checksum: Checksum) {
        self.entries.insert(name.into(), checksum);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Checksum)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, sum) in &self.entries {
            writeln!(f, "{}({})= {}", sum.algorithm, name, sum.checksum)?;
        }
        Ok(())
    }
}

/// Split `ALG(NAME)= HEX` into its parts.
fn parse_line(line: &str) -> Option<(String, Checksum)> {
    let (head, digest) = line.split_once(")=")?;
    let (algorithm, name) = head.split_once('(')?;

    let algorithm = algorithm.trim();
    let digest = digest.trim();
    if algorithm.is_empty() || name.is_empty() || digest.is_empty() {
        return None;
    }

    Some((name.to_string(), Checksum::new(algorithm, digest)))
}

/// A checksum the platform computed over an uploaded file.
///
/// Older platforms only fill in `sha1`; newer ones report the algorithm in
/// `checksum_type` alongside `checksum`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerChecksum {
    /// Device key the entry belongs to.
    pub key: String,
    pub sha1: String,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub size: u64,
}

/// Compare a manifest entry against the platform-computed checksums.
///
/// `key` selects the server entry for the uploaded file. When the manifest
/// uses SHA1 the legacy `sha1` field decides; otherwise the
/// (`checksum_type`, `checksum`) pair must match.
///
/// # Errors
///
/// [`Error::ChecksumMismatch`] on any disagreement, [`Error::Manifest`] when
/// the server has no entry for `key`.
pub fn verify_server_checksum(
    server: &[ServerChecksum],
    local: &Checksum,
    file: &str,
    key: &str,
) -> Result<()> {
    let entry = server.iter().find(|m| m.key == key).ok_or_else(|| {
        Error::manifest(format!(
            "missing manifest entry on server for uploaded file {file} (key {key})"
        ))
    })?;

    if local.is_sha1() {
        if !local.checksum.eq_ignore_ascii_case(&entry.sha1) {
            return Err(Error::ChecksumMismatch {
                file: file.to_string(),
                expected: local.checksum.clone(),
                actual: entry.sha1.clone(),
            });
        }
        return Ok(());
    }

    let server_type = entry.checksum_type.as_deref().unwrap_or_default();
    if !local.algorithm.eq_ignore_ascii_case(server_type) {
        return Err(Error::ChecksumMismatch {
            file: file.to_string(),
            expected: format!("{} checksum", local.algorithm),
            actual: format!("{server_type} checksum"),
        });
    }

    let server_sum = entry.checksum.as_deref().unwrap_or_default();
    if !local.checksum.eq_ignore_ascii_case(server_sum) {
        return Err(Error::ChecksumMismatch {
            file: file.to_string(),
            expected: local.checksum.clone(),
            actual: server_sum.to_string(),
        });
    }

    Ok(())
}

/// Compute the hex digest of a stream.
///
/// Returns `Ok(None)` for algorithms that cannot be computed locally.
pub fn digest<R: Read>(mut reader: R, algorithm: &str) -> Result<Option<String>> {
    fn run<D: Digest, R: Read>(mut hasher: D, reader: &mut R) -> Result<String> {
        let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    match algorithm.to_ascii_uppercase().as_str() {
        "SHA1" => run(Sha1::new(), &mut reader).map(Some),
        "SHA256" => run(Sha256::new(), &mut reader).map(Some),
        "SHA512" => run(Sha512::new(), &mut reader).map(Some),
        _ => Ok(None),
    }
}

/// Outcome of checking one manifest entry against the local package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCheck {
    /// Digest matches.
    Ok,
    /// Digest differs.
    Mismatch { actual: String },
    /// The algorithm cannot be computed locally.
    Unsupported,
    /// The member is absent from the package.
    Missing,
}

/// Verify every manifest entry against the members of `archive`.
///
/// Members are opened in manifest order, one at a time.
pub fn verify_package(archive: &mut dyn Archive, manifest: &Manifest) -> Result<Vec<(String, LocalCheck)>> {
    let mut results = Vec::with_capacity(manifest.len());

    for (name, sum) in manifest.iter() {
        let member = match archive.open(name) {
            Ok(member) => member,
            Err(e) if e.is_member_not_found() => {
                results.push((name.to_string(), LocalCheck::Missing));
                continue;
            }
            Err(e) => return Err(e),
        };

        let check = match digest(member, &sum.algorithm)? {
            None => LocalCheck::Unsupported,
            Some(actual) if actual.eq_ignore_ascii_case(&sum.checksum) => LocalCheck::Ok,
            Some(actual) => LocalCheck::Mismatch { actual },
        };
        results.push((name.to_string(), check));
    }

    Ok(results)
}
