//! Protocol versioning for Callway.
//!
//! Clients may name the version they speak when upgrading (`major` or
//! `major.minor`). Any minor version of the server's major is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Version negotiation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Not `major` or `major.minor`.
    #[error("Malformed protocol version {0:?}")]
    Malformed(String),

    /// A major version this server does not speak.
    #[error("Protocol version {requested} is not supported, server speaks {supported}")]
    Unsupported { requested: Version, supported: Version },
}

/// Wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Bumped on breaking frame changes.
    pub major: u8,
    /// Bumped when frames or fields are added.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Resolve the version for a connection. No request means the current
    /// version.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is malformed or names another major.
    pub fn negotiate(requested: Option<&str>) -> Result<Version, VersionError> {
        let Some(requested) = requested else {
            return Ok(PROTOCOL_VERSION);
        };
        let requested: Version = requested.parse()?;
        if requested.is_compatible_with(&PROTOCOL_VERSION) {
            Ok(requested)
        } else {
            Err(VersionError::Unsupported {
                requested,
                supported: PROTOCOL_VERSION,
            })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionError::Malformed(s.to_string());
        let (major, minor) = match s.trim().split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (s.trim(), None),
        };
        let major = major.parse().map_err(|_| malformed())?;
        let minor = match minor {
            Some(minor) => minor.parse().map_err(|_| malformed())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
