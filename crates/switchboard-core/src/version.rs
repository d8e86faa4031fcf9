//! Semver versions and npm-style ranges for versioned application lookup.
//!
//! Ranges accept the grammar peers send in handshakes (`^1.2.0`, `1.x`,
//! `>=1.0.0 <2`, `1.2 || 3`, `1.0.0 - 1.2.0`). Parsing is delegated to
//! `deno_semver`; dist-tags such as `latest` are not ranges here.

use deno_semver::VersionReq;
use std::fmt;
use std::str::FromStr;

pub use deno_semver::Version;

/// Parse an exact `major.minor.patch[-pre][+build]` version.
pub fn parse_version(text: &str) -> Option<Version> {
    Version::parse_standard(text).ok()
}

/// A parsed semver range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    source: String,
    req: VersionReq,
}

impl VersionRange {
    /// Whether `version` satisfies this range.
    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for VersionRange {
    type Err = VersionRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        let req = VersionReq::parse_from_npm(source).map_err(|e| VersionRangeError {
            range: source.to_string(),
            reason: e.to_string(),
        })?;
        if req.tag().is_some() {
            return Err(VersionRangeError {
                range: source.to_string(),
                reason: "not a version range".to_string(),
            });
        }

        Ok(Self {
            source: source.to_string(),
            req,
        })
    }
}

/// Error parsing a semver range.
#[derive(Debug, thiserror::Error)]
#[error("invalid semver range '{range}': {reason}")]
pub struct VersionRangeError {
    range: String,
    reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn range(s: &str) -> VersionRange {
        s.parse().unwrap()
    }

    #[test]
    fn caret_range() {
        let r = range("^1.2.0");
        assert!(r.matches(&v("1.2.5")));
        assert!(r.matches(&v("1.3.0")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("1.1.0")));
    }

    #[test]
    fn space_separated_comparators_are_anded() {
        let r = range(">=1.0.0 <1.3.0");
        assert!(r.matches(&v("1.2.9")));
        assert!(!r.matches(&v("1.3.0")));
    }

    #[test]
    fn alternatives_and_partials() {
        let r = range("1.2 || 3");
        assert!(r.matches(&v("1.2.7")));
        assert!(!r.matches(&v("1.3.0")));
        assert!(r.matches(&v("3.9.1")));
        assert!(range("1.x").matches(&v("1.9.0")));
    }

    #[test]
    fn bare_full_version_is_exact() {
        let r = range("1.2.3 || 2.0.0");
        assert!(r.matches(&v("1.2.3")));
        assert!(!r.matches(&v("1.2.4")));
    }

    #[test]
    fn hyphen_range_is_inclusive() {
        let r = range("1.0.0 - 1.2.0");
        assert!(r.matches(&v("1.2.0")));
        assert!(!r.matches(&v("1.2.1")));
    }

    #[test]
    fn tags_and_garbage_are_rejected() {
        assert!("latest".parse::<VersionRange>().is_err());
        assert!(">=banana".parse::<VersionRange>().is_err());
    }

    #[test]
    fn exact_versions() {
        assert_eq!(v("1.2.3").to_string(), "1.2.3");
        assert!(parse_version("1.2").is_none());
        assert!(parse_version("^1.2.3").is_none());
    }
}
