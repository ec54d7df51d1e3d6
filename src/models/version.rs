use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Weight of the major component in a packed version.
const MAJOR_WEIGHT: u32 = 1024;

/// Weight of the minor component in a packed version.
const MINOR_WEIGHT: u32 = 16;

/// Largest minor component that fits the packed layout.
pub const MAX_MINOR: u32 = 63;

/// Largest patch component that fits the packed layout.
pub const MAX_PATCH: u32 = 15;

/// Packed version for a base release (`v1.0`).
pub const BASE_VERSION: VersionCode = VersionCode(MAJOR_WEIGHT);

/// Bump applied to update mappings so the rebuilt title does not report itself as stale.
pub const UPDATE_BUMP: u32 = MINOR_WEIGHT;

static VERSION_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+)\.(\d+)(?:\.(\d+))?$").expect("Invalid version regex"));

/// Errors produced while reading a version number
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Not a valid version: '{0}'")]
    InvalidVersion(String),
}

/// A three-part title version packed into a single integer.
///
/// The layout is `major * 1024 + minor * 16 + patch` with `minor <= 63` and
/// `patch <= 15`, which is the form container metadata stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionCode(u32);

impl VersionCode {
    /// Pack a version from its parts.
    ///
    /// # Errors
    /// Returns [`VersionError::InvalidVersion`] if `minor` or `patch` overflow their fields.
    pub fn encode(major: u32, minor: u32, patch: u32) -> Result<Self, VersionError> {
        if minor > MAX_MINOR || patch > MAX_PATCH {
            return Err(VersionError::InvalidVersion(format!(
                "v{}.{}.{}",
                major, minor, patch
            )));
        }

        major
            .checked_mul(MAJOR_WEIGHT)
            .and_then(|v| v.checked_add(minor * MINOR_WEIGHT + patch))
            .map(Self)
            .ok_or_else(|| VersionError::InvalidVersion(format!("v{}.{}.{}", major, minor, patch)))
    }

    /// Unpack into `(major, minor, patch)`.
    pub fn decode(self) -> (u32, u32, u32) {
        let rest = self.0 % MAJOR_WEIGHT;
        (self.0 / MAJOR_WEIGHT, rest / MINOR_WEIGHT, rest % MINOR_WEIGHT)
    }

    /// Wrap an already packed integer without interpreting it.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The packed integer.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Add `amount` to the packed value.
    pub fn bumped(self, amount: u32) -> Self {
        Self(self.0.saturating_add(amount))
    }

    /// Parse `vMAJOR.MINOR`, `vMAJOR.MINOR.PATCH` or a plain non-negative integer.
    ///
    /// A missing patch component defaults to 0. A plain integer is taken as an
    /// already packed value and is not re-encoded.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();

        if let Some(caps) = VERSION_STRING.captures(s) {
            let part = |i: usize| -> Result<u32, VersionError> {
                caps.get(i)
                    .map_or(Ok(0), |m| m.as_str().parse::<u32>())
                    .map_err(|_| VersionError::InvalidVersion(s.to_string()))
            };
            return Self::encode(part(1)?, part(2)?, part(3)?)
                .map_err(|_| VersionError::InvalidVersion(s.to_string()));
        }

        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u32>()
                .map(Self)
                .map_err(|_| VersionError::InvalidVersion(s.to_string()));
        }

        Err(VersionError::InvalidVersion(s.to_string()))
    }
}

impl fmt::Display for VersionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor, patch) = self.decode();
        write!(f, "v{}.{}.{}", major, minor, patch)
    }
}

impl std::str::FromStr for VersionCode {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
