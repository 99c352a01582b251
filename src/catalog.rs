//! Release catalog of embedded manifest bundles
//!
//! Upstream manifests are vendored under `upstream/<component>/<version>/`
//! and embedded at compile time, one bundle per release. The catalog resolves
//! a requested version (or the latest supported one) to its bundle and
//! enumerates available versions for the `list-releases` query surface.
//!
//! Provider (CPI) and storage (CSI) bundles are versioned independently.

use std::fmt;

use crate::Error;

/// The two independently versioned manifest components
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// The vSphere cloud provider integration (cloud-controller-manager)
    Provider,
    /// The vSphere CSI storage driver
    Storage,
}

impl Component {
    /// All components, in reconciliation order
    pub const ALL: [Component; 2] = [Component::Provider, Component::Storage];

    /// Stable scope name used for state files and log fields
    pub fn scope(&self) -> &'static str {
        match self {
            Component::Provider => "provider",
            Component::Storage => "storage",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scope())
    }
}

/// A versioned, immutable set of manifest templates for one component
#[derive(Clone, Debug)]
pub struct ReleaseBundle {
    /// Component this bundle deploys
    pub component: Component,
    /// Release version identifier (e.g., "v1.22")
    pub version: &'static str,
    /// Raw multi-document YAML manifests, in upstream order
    pub manifests: &'static [&'static str],
}

const PROVIDER_V1_2: &[&str] =
    &[include_str!("../upstream/cloud_provider/v1.2/vsphere-cloud-controller-manager.yaml")];
const PROVIDER_V1_22: &[&str] =
    &[include_str!("../upstream/cloud_provider/v1.22/vsphere-cloud-controller-manager.yaml")];
const STORAGE_V2_5_1: &[&str] =
    &[include_str!("../upstream/cloud_storage/v2.5.1/vsphere-csi-driver.yaml")];
const STORAGE_V2_6_2: &[&str] =
    &[include_str!("../upstream/cloud_storage/v2.6.2/vsphere-csi-driver.yaml")];

/// Ordered catalog entries, oldest first; the last entry is the latest
/// supported release for its component.
const RELEASES: &[ReleaseBundle] = &[
    ReleaseBundle {
        component: Component::Provider,
        version: "v1.2",
        manifests: PROVIDER_V1_2,
    },
    ReleaseBundle {
        component: Component::Provider,
        version: "v1.22",
        manifests: PROVIDER_V1_22,
    },
    ReleaseBundle {
        component: Component::Storage,
        version: "v2.5.1",
        manifests: STORAGE_V2_5_1,
    },
    ReleaseBundle {
        component: Component::Storage,
        version: "v2.6.2",
        manifests: STORAGE_V2_6_2,
    },
];

/// Catalog of all releases this operator ships
#[derive(Clone, Copy, Debug, Default)]
pub struct ReleaseCatalog;

impl ReleaseCatalog {
    /// Ordered version identifiers available for a component
    pub fn list(&self, component: Component) -> Vec<&'static str> {
        RELEASES
            .iter()
            .filter(|r| r.component == component)
            .map(|r| r.version)
            .collect()
    }

    /// The latest supported release version for a component
    pub fn latest(&self, component: Component) -> &'static str {
        RELEASES
            .iter()
            .filter(|r| r.component == component)
            .next_back()
            .map(|r| r.version)
            .unwrap_or_default()
    }

    /// Resolve a requested version (or the latest, when `None`) to a bundle
    ///
    /// An unknown version fails with [`Error::UnknownRelease`]; the caller
    /// reports it and leaves applied state untouched.
    pub fn resolve(
        &self,
        component: Component,
        requested: Option<&str>,
    ) -> Result<&'static ReleaseBundle, Error> {
        let version = requested.unwrap_or_else(|| self.latest(component));
        RELEASES
            .iter()
            .find(|r| r.component == component && r.version == version)
            .ok_or_else(|| Error::UnknownRelease {
                component: component.to_string(),
                requested: version.to_string(),
                available: self.list(component).iter().map(|v| v.to_string()).collect(),
            })
    }

    /// Whether this operator's catalog owns the given release version
    ///
    /// Deletion safety: applied records carrying a version outside the
    /// catalog were written by some other actor and are never deleted.
    pub fn owns(&self, component: Component, version: &str) -> bool {
        RELEASES
            .iter()
            .any(|r| r.component == component && r.version == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_is_ordered() {
        let catalog = ReleaseCatalog;
        assert_eq!(catalog.list(Component::Provider), vec!["v1.2", "v1.22"]);
        assert_eq!(catalog.list(Component::Storage), vec!["v2.5.1", "v2.6.2"]);
    }

    #[test]
    fn test_latest_supported() {
        let catalog = ReleaseCatalog;
        assert_eq!(catalog.latest(Component::Provider), "v1.22");
        assert_eq!(catalog.latest(Component::Storage), "v2.6.2");
    }

    #[test]
    fn test_resolve_default_is_latest() {
        let catalog = ReleaseCatalog;
        let bundle = catalog.resolve(Component::Provider, None).unwrap();
        assert_eq!(bundle.version, "v1.22");
    }

    #[test]
    fn test_resolve_explicit_version() {
        let catalog = ReleaseCatalog;
        let bundle = catalog.resolve(Component::Provider, Some("v1.2")).unwrap();
        assert_eq!(bundle.version, "v1.2");
        assert!(!bundle.manifests.is_empty());
    }

    #[test]
    fn test_unknown_release() {
        let catalog = ReleaseCatalog;
        let err = catalog
            .resolve(Component::Provider, Some("v9.9"))
            .unwrap_err();
        match err {
            Error::UnknownRelease {
                component,
                requested,
                available,
            } => {
                assert_eq!(component, "provider");
                assert_eq!(requested, "v9.9");
                assert_eq!(available, vec!["v1.2", "v1.22"]);
            }
            other => panic!("expected UnknownRelease, got {other}"),
        }
    }

    #[test]
    fn test_ownership() {
        let catalog = ReleaseCatalog;
        assert!(catalog.owns(Component::Provider, "v1.2"));
        assert!(!catalog.owns(Component::Provider, "v2.5.1"));
        assert!(!catalog.owns(Component::Storage, "v0.9-external"));
    }
}
