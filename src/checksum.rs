//! Versioned changeset checksums.
//!
//! A checksum is rendered `<version>:<sha256 hex>`. Values written before
//! versioning existed carry no prefix and are read as version 1.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::change::Change;

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// Every version this build can recompute.
const SUPPORTED_VERSIONS: &[u32] = &[1, 2];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckSum {
    pub version: u32,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid checksum '{value}'")]
pub struct InvalidCheckSum {
    pub value: String,
}

impl CheckSum {
    /// Checksum of a change list under [`CURRENT_VERSION`].
    pub fn compute(changes: &[Box<dyn Change>]) -> Self {
        Self::compute_version(changes, CURRENT_VERSION)
    }

    /// Checksum under a specific algorithm version. Unknown versions fall
    /// back to the current algorithm, so callers check
    /// [`is_supported`](Self::is_supported) first.
    pub fn compute_version(changes: &[Box<dyn Change>], version: u32) -> Self {
        let mut hasher = Sha256::new();
        match version {
            1 => {
                for change in changes {
                    hasher.update(change.checksum_payload().as_bytes());
                }
            }
            _ => {
                // Framing keeps `[a, bc]` and `[ab, c]` apart.
                for change in changes {
                    let payload = change.checksum_payload();
                    hasher.update(change.name().as_bytes());
                    hasher.update(b":");
                    hasher.update(payload.len().to_string().as_bytes());
                    hasher.update(b":");
                    hasher.update(payload.as_bytes());
                    hasher.update(b";");
                }
            }
        }
        let version = if SUPPORTED_VERSIONS.contains(&version) {
            version
        } else {
            CURRENT_VERSION
        };
        Self {
            version,
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_VERSIONS.contains(&self.version)
    }

    pub fn is_current(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl fmt::Display for CheckSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.digest)
    }
}

impl FromStr for CheckSum {
    type Err = InvalidCheckSum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let invalid = || InvalidCheckSum {
            value: s.to_string(),
        };

        let (version, digest) = match value.split_once(':') {
            Some((version, digest)) => (version.parse::<u32>().map_err(|_| invalid())?, digest),
            None => (1, value),
        };
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self {
            version,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl Serialize for CheckSum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of comparing a stored checksum with the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Stored value equals the current checksum.
    Unchanged,
    /// Stored value matches under its older version; the ledger should be
    /// rewritten with `current`.
    Upgrade { current: CheckSum },
    /// Accepted through a `<validCheckSum>` entry.
    Accepted,
    Changed { current: CheckSum },
}

/// Compare a stored checksum against `changes`, recomputing under the
/// stored value's version when it is older than [`CURRENT_VERSION`].
pub fn verify(
    changes: &[Box<dyn Change>],
    stored: &CheckSum,
    valid: &[ValidCheckSum],
) -> Verification {
    let current = CheckSum::compute(changes);
    if &current == stored {
        return Verification::Unchanged;
    }
    if stored.is_supported() && !stored.is_current() {
        let recomputed = CheckSum::compute_version(changes, stored.version);
        if &recomputed == stored {
            return Verification::Upgrade { current };
        }
    }
    if valid.iter().any(|v| v.accepts(stored)) {
        return Verification::Accepted;
    }
    Verification::Changed { current }
}

/// A `<validCheckSum>` entry on a changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidCheckSum {
    Any,
    Exact(CheckSum),
}

impl ValidCheckSum {
    pub fn accepts(&self, stored: &CheckSum) -> bool {
        match self {
            ValidCheckSum::Any => true,
            ValidCheckSum::Exact(expected) => expected == stored,
        }
    }
}

impl FromStr for ValidCheckSum {
    type Err = InvalidCheckSum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("any") {
            Ok(ValidCheckSum::Any)
        } else {
            s.parse().map(ValidCheckSum::Exact)
        }
    }
}
