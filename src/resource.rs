//! Resource objects, identities, and content fingerprints
//!
//! A [`ResourceObject`] is one rendered cluster resource: its identity
//! (kind, namespace, name) plus the full JSON body. Identity addresses the
//! resource for apply/delete; the fingerprint detects content drift without
//! relying on field ordering.
//!
//! Also provides `ApiResource` construction from a manifest's
//! apiVersion/kind, so rendered objects can be applied through
//! `Api<DynamicObject>` without compile-time type knowledge.

use std::fmt;

use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Error;

/// The (kind, namespace, name) tuple uniquely addressing a cluster resource
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Kubernetes kind (e.g., "DaemonSet")
    pub kind: String,
    /// Namespace, or `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceIdentity {
    /// Create an identity for a namespaced resource
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Create an identity for a cluster-scoped resource
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    /// Formats as `Kind/namespace/name`, omitting the namespace segment for
    /// cluster-scoped resources.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A single rendered cluster resource
///
/// Produced fresh on every render and never mutated afterwards: a changed
/// resource is a new object replacing the old one by identity.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceObject {
    /// The resource's identity
    pub identity: ResourceIdentity,
    /// apiVersion from the manifest (e.g., "apps/v1")
    pub api_version: String,
    /// The full resource body
    pub body: Value,
}

impl ResourceObject {
    /// Build a resource object from a parsed manifest document
    ///
    /// Requires `apiVersion`, `kind`, and `metadata.name` to be present.
    pub fn from_value(body: Value) -> Result<Self, Error> {
        let api_version = body
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::render("unknown", "manifest missing apiVersion"))?
            .to_string();
        let kind = body
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::render("unknown", "manifest missing kind"))?
            .to_string();
        let name = body
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::render(&kind, "manifest missing metadata.name"))?
            .to_string();
        let namespace = body
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            identity: ResourceIdentity {
                kind,
                namespace,
                name,
            },
            api_version,
            body,
        })
    }

    /// Deterministic hash of the resource body
    ///
    /// SHA-256 over a canonical (recursively key-sorted) JSON encoding, so
    /// equal content always fingerprints equally regardless of map ordering.
    /// `DefaultHasher` is NOT guaranteed stable across Rust releases; this
    /// fingerprint is persisted, so it must be.
    pub fn fingerprint(&self) -> String {
        let canonical = canonical_json(&self.body);
        let hash = Sha256::digest(canonical.as_bytes());
        hash.iter().fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }

    /// Build the `ApiResource` addressing this object's API endpoint
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(&self.api_version, &self.identity.kind)
    }
}

/// Serialize a JSON value with object keys in sorted order at every level
fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::with_capacity(map.len());
                for key in keys {
                    out.insert(key.clone(), canonicalize(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    // serde_json preserves insertion order, so sorted insertion serializes sorted
    canonicalize(value).to_string()
}

/// Parse a multi-document YAML manifest into JSON values
///
/// Empty documents (e.g., a trailing `---`) are skipped.
pub fn parse_manifest_documents(input: &str) -> Result<Vec<Value>, Error> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(input) {
        let value: Value = Value::deserialize(doc)
            .map_err(|e| Error::serialization(format!("invalid manifest YAML: {}", e)))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind for its REST path
///
/// Simple pluralization rules cover every kind this operator renders
/// (workloads, RBAC, storage objects).
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The version from the manifest is used exactly; rendered bundles pin
/// their own API versions so no discovery round-trip is needed.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}
