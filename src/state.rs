//! Applied-state persistence
//!
//! The reconciler records, per resource identity, the content fingerprint
//! and release version it last successfully applied. That record set is the
//! only memory the engine keeps between invocations, and it is what makes
//! the diff-apply-cleanup loop resumable: a crash mid-batch loses nothing
//! that was already committed.
//!
//! Corrupt or unreadable state degrades to an empty state plus a warning;
//! the reconciler then runs apply-only (never deleting) until a healthy
//! pass rebuilds the bookkeeping.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::Component;
use crate::resource::ResourceIdentity;
use crate::Error;

/// What the engine last successfully applied for one resource identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    /// Content fingerprint of the applied body
    pub fingerprint: String,
    /// Release version whose bundle produced the body
    pub release: String,
    /// apiVersion the body was applied under, kept so a later cleanup can
    /// address the API endpoint without re-rendering the old release
    pub api_version: String,
}

/// The complete applied-state for one scope
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppliedState {
    /// Record per applied resource identity
    pub records: BTreeMap<ResourceIdentity, AppliedRecord>,
    /// Whether the persisted state could not be read and was treated as
    /// empty; a degraded state must never drive deletions
    pub degraded: bool,
}

/// Durable per-scope storage for applied records
///
/// Exactly one logical reconciliation owner writes a scope at a time; the
/// engine serializes attempts, so implementations only need crash safety,
/// not cross-writer locking.
pub trait StateStore: Send + Sync {
    /// Load the applied state for a scope
    fn load(&self, scope: Component) -> AppliedState;

    /// Persist one record after a confirmed successful apply
    fn commit(
        &self,
        scope: Component,
        identity: &ResourceIdentity,
        record: AppliedRecord,
    ) -> Result<(), Error>;

    /// Drop one record after a confirmed successful delete
    fn remove(&self, scope: Component, identity: &ResourceIdentity) -> Result<(), Error>;
}

/// On-disk serialization shape, keyed by the identity's display form
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    records: BTreeMap<String, StoredRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    name: String,
    fingerprint: String,
    release: String,
    api_version: String,
}

/// JSON-file-backed state store, one file per scope
///
/// Writes go through a temp file and an atomic rename so a crash mid-write
/// leaves the previous state intact rather than a truncated file.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::state("store", format!("failed to create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path(&self, scope: Component) -> PathBuf {
        self.dir.join(format!("{}.json", scope.scope()))
    }

    fn read_file(&self, scope: Component) -> Result<StateFile, Error> {
        let path = self.path(scope);
        if !path.exists() {
            return Ok(StateFile::default());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::state(scope.scope(), format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::state(scope.scope(), format!("parse {}: {e}", path.display())))
    }

    fn write_file(&self, scope: Component, file: &StateFile) -> Result<(), Error> {
        let path = self.path(scope);
        let raw = serde_json::to_string_pretty(file)
            .map_err(|e| Error::state(scope.scope(), format!("serialize state: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| Error::state(scope.scope(), format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::state(scope.scope(), format!("rename {}: {e}", path.display())))
    }

    fn mutate(
        &self,
        scope: Component,
        f: impl FnOnce(&mut StateFile),
    ) -> Result<(), Error> {
        // A corrupt file is replaced wholesale; commits after a degraded
        // load rebuild it record by record.
        let mut file = self.read_file(scope).unwrap_or_default();
        f(&mut file);
        self.write_file(scope, &file)
    }
}

fn stored_key(identity: &ResourceIdentity) -> String {
    identity.to_string()
}

impl StateStore for FileStateStore {
    fn load(&self, scope: Component) -> AppliedState {
        let file = match self.read_file(scope) {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    scope = %scope,
                    error = %e,
                    "applied state unreadable, treating as empty (deletes suspended)"
                );
                return AppliedState {
                    records: BTreeMap::new(),
                    degraded: true,
                };
            }
        };
        let records = file
            .records
            .into_values()
            .map(|r| {
                (
                    ResourceIdentity {
                        kind: r.kind,
                        namespace: r.namespace,
                        name: r.name,
                    },
                    AppliedRecord {
                        fingerprint: r.fingerprint,
                        release: r.release,
                        api_version: r.api_version,
                    },
                )
            })
            .collect();
        AppliedState {
            records,
            degraded: false,
        }
    }

    fn commit(
        &self,
        scope: Component,
        identity: &ResourceIdentity,
        record: AppliedRecord,
    ) -> Result<(), Error> {
        self.mutate(scope, |file| {
            file.records.insert(
                stored_key(identity),
                StoredRecord {
                    kind: identity.kind.clone(),
                    namespace: identity.namespace.clone(),
                    name: identity.name.clone(),
                    fingerprint: record.fingerprint,
                    release: record.release,
                    api_version: record.api_version,
                },
            );
        })
    }

    fn remove(&self, scope: Component, identity: &ResourceIdentity) -> Result<(), Error> {
        self.mutate(scope, |file| {
            file.records.remove(&stored_key(identity));
        })
    }
}

type MemoryRecords = BTreeMap<Component, BTreeMap<ResourceIdentity, AppliedRecord>>;

/// In-memory state store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: std::sync::Mutex<MemoryRecords>,
}

impl MemoryStateStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MemoryRecords> {
        // A poisoned lock only means a panicking test thread; the data is
        // still coherent for plain map operations.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of records held for a scope
    pub fn len(&self, scope: Component) -> usize {
        self.locked().get(&scope).map_or(0, BTreeMap::len)
    }

    /// Whether a scope holds no records
    pub fn is_empty(&self, scope: Component) -> bool {
        self.len(scope) == 0
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, scope: Component) -> AppliedState {
        AppliedState {
            records: self.locked().get(&scope).cloned().unwrap_or_default(),
            degraded: false,
        }
    }

    fn commit(
        &self,
        scope: Component,
        identity: &ResourceIdentity,
        record: AppliedRecord,
    ) -> Result<(), Error> {
        self.locked()
            .entry(scope)
            .or_default()
            .insert(identity.clone(), record);
        Ok(())
    }

    fn remove(&self, scope: Component, identity: &ResourceIdentity) -> Result<(), Error> {
        self.locked().entry(scope).or_default().remove(identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(release: &str) -> AppliedRecord {
        AppliedRecord {
            fingerprint: "abc123".to_string(),
            release: release.to_string(),
            api_version: "v1".to_string(),
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        let identity = ResourceIdentity::namespaced("Secret", "kube-system", "vsphere-cloud-secret");

        store
            .commit(Component::Provider, &identity, record("v1.22"))
            .unwrap();

        let state = store.load(Component::Provider);
        assert!(!state.degraded);
        assert_eq!(state.records[&identity], record("v1.22"));

        // Scopes are independent files
        assert!(store.load(Component::Storage).records.is_empty());

        store.remove(Component::Provider, &identity).unwrap();
        assert!(store.load(Component::Provider).records.is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ResourceIdentity::cluster_scoped("StorageClass", "csi-vsphere-default");
        {
            let store = FileStateStore::new(dir.path()).unwrap();
            store
                .commit(Component::Storage, &identity, record("v2.5.1"))
                .unwrap();
        }
        let store = FileStateStore::new(dir.path()).unwrap();
        let state = store.load(Component::Storage);
        assert_eq!(state.records[&identity].release, "v2.5.1");
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("provider.json"), "{not json").unwrap();

        let state = store.load(Component::Provider);
        assert!(state.degraded);
        assert!(state.records.is_empty());

        // A commit after the degraded load starts a fresh file
        let identity = ResourceIdentity::namespaced("Secret", "kube-system", "s");
        store
            .commit(Component::Provider, &identity, record("v1.22"))
            .unwrap();
        let state = store.load(Component::Provider);
        assert!(!state.degraded);
        assert_eq!(state.records.len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        let identity = ResourceIdentity::namespaced("ConfigMap", "kube-system", "c");
        store
            .commit(Component::Provider, &identity, record("v1.2"))
            .unwrap();
        assert_eq!(store.len(Component::Provider), 1);
        assert!(store.is_empty(Component::Storage));
        store.remove(Component::Provider, &identity).unwrap();
        assert!(store.is_empty(Component::Provider));
    }
}
