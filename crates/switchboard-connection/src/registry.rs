//! Versioned application index and its swappable registry.
//!
//! Each application name maps to a set of version keys: exact semver strings
//! plus the sentinel [`LATEST`]. An application registered without a version
//! occupies `latest`; when every version is explicit, the greatest one is
//! mirrored there. Range lookups walk a list of explicit versions kept in
//! descending order, so the highest compatible version wins.

use crate::application::{Application, RegistryError};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{Version, VersionRange, parse_version};

/// Version key for the default application of a name.
pub const LATEST: &str = "latest";

#[derive(Debug, Default)]
struct AppVersions {
    keyed: HashMap<String, Arc<Application>>,
    descending: Vec<(Version, Arc<Application>)>,
}

impl AppVersions {
    fn finish(&mut self, name: &str) -> Result<(), RegistryError> {
        let mut explicit = Vec::new();
        for (key, app) in &self.keyed {
            if key == LATEST {
                continue;
            }
            let version = parse_version(key).ok_or_else(|| RegistryError::InvalidVersion {
                name: name.to_string(),
                version: key.clone(),
            })?;
            explicit.push((version, app.clone()));
        }
        explicit.sort_by(|a, b| b.0.cmp(&a.0));

        if !self.keyed.contains_key(LATEST) {
            if let Some((_, greatest)) = explicit.first() {
                self.keyed.insert(LATEST.to_string(), greatest.clone());
            }
        }
        self.descending = explicit;
        Ok(())
    }
}

/// Immutable application index.
#[derive(Debug, Default)]
pub struct AppIndex {
    apps: HashMap<String, AppVersions>,
}

impl AppIndex {
    /// Build an index from a list of applications.
    pub fn new(applications: impl IntoIterator<Item = Application>) -> Result<Self, RegistryError> {
        let mut apps: HashMap<String, AppVersions> = HashMap::new();

        for app in applications {
            let name = app.name().to_string();
            let key = app
                .version()
                .map(ToString::to_string)
                .unwrap_or_else(|| LATEST.to_string());
            let versions = apps.entry(name.clone()).or_default();
            if versions.keyed.contains_key(&key) {
                return Err(if key == LATEST {
                    RegistryError::DuplicateLatest(name)
                } else {
                    RegistryError::DuplicateVersion { name, version: key }
                });
            }
            versions.keyed.insert(key, Arc::new(app));
        }

        Self::finish(apps)
    }

    /// Normalize a pre-built `name -> version key -> application` index.
    ///
    /// Keys other than [`LATEST`] must be exact versions.
    pub fn from_index(
        index: HashMap<String, HashMap<String, Arc<Application>>>,
    ) -> Result<Self, RegistryError> {
        let apps = index
            .into_iter()
            .map(|(name, keyed)| {
                (
                    name,
                    AppVersions {
                        keyed,
                        descending: Vec::new(),
                    },
                )
            })
            .collect();
        Self::finish(apps)
    }

    fn finish(mut apps: HashMap<String, AppVersions>) -> Result<Self, RegistryError> {
        for (name, versions) in &mut apps {
            versions.finish(name)?;
        }
        Ok(Self { apps })
    }

    /// Resolve an application by name and optional exact version or range.
    ///
    /// Malformed ranges resolve to `None`.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>> {
        let versions = self.apps.get(name)?;
        let Some(requested) = version else {
            return versions.keyed.get(LATEST).cloned();
        };

        if let Some(exact) = parse_version(requested) {
            return versions.keyed.get(&exact.to_string()).cloned();
        }

        let range: VersionRange = requested.parse().ok()?;
        versions
            .descending
            .iter()
            .find(|(version, _)| range.matches(version))
            .map(|(_, app)| app.clone())
    }

    /// Registered application names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }

    /// Explicit versions of an application, greatest first.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.apps
            .get(name)
            .map(|versions| versions.descending.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }
}

/// Shared, atomically replaceable [`AppIndex`].
///
/// Readers take a snapshot; an update swaps in a whole new index.
#[derive(Debug)]
pub struct Registry {
    index: ArcSwap<AppIndex>,
}

impl Registry {
    pub fn new(index: AppIndex) -> Self {
        Self {
            index: ArcSwap::from_pointee(index),
        }
    }

    pub fn snapshot(&self) -> Arc<AppIndex> {
        self.index.load_full()
    }

    pub fn replace(&self, index: AppIndex) {
        self.index.store(Arc::new(index));
    }

    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>> {
        self.index.load().resolve(name, version)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(AppIndex::default())
    }
}
