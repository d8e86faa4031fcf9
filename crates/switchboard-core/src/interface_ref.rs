//! Named, optionally versioned references.
//!
//! Format: `name` or `name@version`. The split happens at the last `@`, so
//! names may themselves contain `@` (e.g. scoped package names).
//!
//! In a handshake the reference names an application and the version is a
//! semver range; elsewhere it names an interface and carries no version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::version::VersionRange;

/// A reference to an application or interface, with an optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceRef {
    name: String,
    version: Option<String>,
}

impl InterfaceRef {
    /// Create an unversioned reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Create a reference pinned to a version or version range.
    pub fn versioned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// The referenced name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The requested version or range, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Parse the version as a semver range.
    ///
    /// Returns `Ok(None)` when no version was given.
    pub fn version_range(&self) -> Result<Option<VersionRange>, InterfaceRefParseError> {
        match &self.version {
            None => Ok(None),
            Some(v) => v
                .parse::<VersionRange>()
                .map(Some)
                .map_err(|_| InterfaceRefParseError::InvalidRange(v.clone())),
        }
    }
}

impl From<&str> for InterfaceRef {
    /// Lenient conversion: anything that fails to parse is taken as a bare name.
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Self::new(s))
    }
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for InterfaceRef {
    type Err = InterfaceRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.rsplit_once('@') {
            Some((name, version)) => {
                if version.is_empty() {
                    return Err(InterfaceRefParseError::EmptyVersion(s.to_string()));
                }
                (name, Some(version.to_string()))
            }
            None => (s, None),
        };

        if name.is_empty() {
            return Err(InterfaceRefParseError::EmptyName);
        }

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

impl TryFrom<String> for InterfaceRef {
    type Error = InterfaceRefParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InterfaceRef> for String {
    fn from(r: InterfaceRef) -> Self {
        r.to_string()
    }
}

/// Error parsing a `name@version` reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceRefParseError {
    #[error("reference name cannot be empty")]
    EmptyName,
    #[error("version after '@' cannot be empty, got: {0}")]
    EmptyVersion(String),
    #[error("invalid semver version range: {0}")]
    InvalidRange(String),
}
