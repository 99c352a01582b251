//! The reconciliation engine
//!
//! One reconcile pass takes a rendered desired set, diffs it against the
//! persisted applied state, and converges the cluster: apply what is new
//! or changed, delete what this operator applied before but no longer
//! renders, leave everything else alone. Every operation is committed to
//! the state store individually, so an interrupted pass resumes from the
//! last confirmed operation instead of starting over.
//!
//! Ordering policy: stale resources whose kind matches an identity being
//! created are deleted first (a renamed object of the same kind may
//! collide with its replacement, e.g. on label selectors); stale resources
//! whose kind is merely being updated, or not touched at all, are deleted
//! after the applies, so the old release keeps serving until its
//! replacement is in place.

pub mod cluster;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{Component, ReleaseCatalog};
use crate::config::ParameterSet;
use crate::render::render;
use crate::resource::{ResourceIdentity, ResourceObject};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::{AppliedRecord, AppliedState, StateStore};
use crate::Error;
use self::cluster::ClusterApi;

/// A previously applied resource the current render no longer produces
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleResource {
    /// Identity recorded at apply time
    pub identity: ResourceIdentity,
    /// apiVersion recorded at apply time, addressing the delete endpoint
    pub api_version: String,
}

/// The operations one reconcile pass will perform, in execution order
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Stale resources deleted before the applies (kind collision risk)
    pub pre_deletes: Vec<StaleResource>,
    /// Resources to create or update, in manifest order
    pub applies: Vec<ResourceObject>,
    /// Stale resources deleted after the applies
    pub post_deletes: Vec<StaleResource>,
    /// Desired resources whose recorded fingerprint already matches
    pub unchanged: usize,
    /// Stale records skipped because their release is not in the catalog
    pub skipped_unowned: usize,
}

impl ReconcilePlan {
    /// Whether the pass has no cluster operations to perform
    pub fn is_noop(&self) -> bool {
        self.pre_deletes.is_empty() && self.applies.is_empty() && self.post_deletes.is_empty()
    }
}

/// What one completed reconcile pass did
#[derive(Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Release version the pass converged to
    pub release: String,
    /// Resources applied
    pub applied: usize,
    /// Stale resources deleted
    pub deleted: usize,
    /// Resources already converged
    pub unchanged: usize,
}

/// Diff a desired set against the applied state
///
/// Pure: performs no cluster or store operations. Deletes are planned only
/// for records whose release the catalog owns, and never from a degraded
/// state (an unreadable state file must not turn into deletions).
pub fn plan(
    component: Component,
    catalog: &ReleaseCatalog,
    desired: &[ResourceObject],
    state: &AppliedState,
) -> ReconcilePlan {
    let desired_ids: BTreeSet<&ResourceIdentity> = desired.iter().map(|o| &o.identity).collect();

    let mut applies = Vec::new();
    let mut unchanged = 0;
    for obj in desired {
        match state.records.get(&obj.identity) {
            Some(record) if record.fingerprint == obj.fingerprint() => unchanged += 1,
            _ => applies.push(obj.clone()),
        }
    }

    // Only identities being created can collide with a renamed predecessor
    // of the same kind; updates keep their object in place, so their stale
    // siblings wait until after the applies.
    let created_kinds: BTreeSet<&str> = applies
        .iter()
        .filter(|o| !state.records.contains_key(&o.identity))
        .map(|o| o.identity.kind.as_str())
        .collect();

    let mut pre_deletes = Vec::new();
    let mut post_deletes = Vec::new();
    let mut skipped_unowned = 0;
    if !state.degraded {
        for (identity, record) in &state.records {
            if desired_ids.contains(identity) {
                continue;
            }
            if !catalog.owns(component, &record.release) {
                warn!(
                    resource = %identity,
                    release = %record.release,
                    "stale record carries a release outside the catalog, not deleting"
                );
                skipped_unowned += 1;
                continue;
            }
            let stale = StaleResource {
                identity: identity.clone(),
                api_version: record.api_version.clone(),
            };
            if created_kinds.contains(identity.kind.as_str()) {
                pre_deletes.push(stale);
            } else {
                post_deletes.push(stale);
            }
        }
    }

    ReconcilePlan {
        pre_deletes,
        applies,
        post_deletes,
        unchanged,
        skipped_unowned,
    }
}

/// Serializes and supersedes attempts for one scope
#[derive(Default)]
struct ScopeGuard {
    serial: AsyncMutex<()>,
    active: AsyncMutex<Option<CancellationToken>>,
}

/// The reconciliation engine
///
/// Holds the cluster seam, the state store, and per-scope serialization.
/// A new attempt on a scope cancels the in-flight one: the superseded
/// attempt stops at its next operation boundary with [`Error::Superseded`],
/// keeping everything it already committed.
pub struct Engine {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn StateStore>,
    catalog: ReleaseCatalog,
    retry: RetryConfig,
    provider: ScopeGuard,
    storage: ScopeGuard,
}

impl Engine {
    /// Create an engine with the default retry policy
    pub fn new(cluster: Arc<dyn ClusterApi>, store: Arc<dyn StateStore>) -> Self {
        Self {
            cluster,
            store,
            catalog: ReleaseCatalog::default(),
            retry: RetryConfig::default(),
            provider: ScopeGuard::default(),
            storage: ScopeGuard::default(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn guard(&self, component: Component) -> &ScopeGuard {
        match component {
            Component::Provider => &self.provider,
            Component::Storage => &self.storage,
        }
    }

    /// Render the resolved release for `component` and converge the cluster
    pub async fn reconcile(
        &self,
        component: Component,
        params: &ParameterSet,
    ) -> Result<ReconcileOutcome, Error> {
        let bundle = self.catalog.resolve(component, params.release(component))?;
        let desired = render(bundle, params)?;
        self.reconcile_objects(component, bundle.version, desired)
            .await
    }

    /// Converge the cluster to an already-rendered desired set
    pub async fn reconcile_objects(
        &self,
        component: Component,
        release: &str,
        desired: Vec<ResourceObject>,
    ) -> Result<ReconcileOutcome, Error> {
        let token = self.supersede(component).await;
        let guard = self.guard(component);
        let _serial = guard.serial.lock().await;
        if token.is_cancelled() {
            return Err(Error::Superseded);
        }

        let state = self.store.load(component);
        if state.degraded {
            warn!(scope = %component, "applied state degraded, running apply-only");
        }
        let plan = plan(component, &self.catalog, &desired, &state);
        info!(
            scope = %component,
            release = %release,
            pre_deletes = plan.pre_deletes.len(),
            applies = plan.applies.len(),
            post_deletes = plan.post_deletes.len(),
            unchanged = plan.unchanged,
            "reconcile plan ready"
        );
        self.execute(component, release, plan, &token).await
    }

    /// Delete every resource this operator's applied state records
    ///
    /// Refuses to run from a degraded state: with the bookkeeping
    /// unreadable there is no safe record of what belongs to us.
    pub async fn cleanup(&self, component: Component) -> Result<usize, Error> {
        let token = self.supersede(component).await;
        let guard = self.guard(component);
        let _serial = guard.serial.lock().await;
        if token.is_cancelled() {
            return Err(Error::Superseded);
        }

        let state = self.store.load(component);
        if state.degraded {
            return Err(Error::state(
                component.scope(),
                "applied state unreadable, refusing cleanup",
            ));
        }

        let mut deleted = 0;
        for (identity, record) in &state.records {
            if !self.catalog.owns(component, &record.release) {
                warn!(
                    resource = %identity,
                    release = %record.release,
                    "record carries a release outside the catalog, not deleting"
                );
                continue;
            }
            let stale = StaleResource {
                identity: identity.clone(),
                api_version: record.api_version.clone(),
            };
            self.delete_one(component, &stale, &token).await?;
            deleted += 1;
        }
        info!(scope = %component, deleted, "cleanup complete");
        Ok(deleted)
    }

    /// Cancel the in-flight attempt for a scope and register a new token
    async fn supersede(&self, component: Component) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.guard(component).active.lock().await;
        if let Some(previous) = active.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn checkpoint(token: &CancellationToken) -> Result<(), Error> {
        if token.is_cancelled() {
            Err(Error::Superseded)
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        component: Component,
        release: &str,
        plan: ReconcilePlan,
        token: &CancellationToken,
    ) -> Result<ReconcileOutcome, Error> {
        let mut deleted = 0;
        let mut applied = 0;

        for stale in &plan.pre_deletes {
            self.delete_one(component, stale, token).await?;
            deleted += 1;
        }

        for obj in &plan.applies {
            Self::checkpoint(token)?;
            let name = format!("apply {}", obj.identity);
            retry_with_backoff(&self.retry, &name, || self.cluster.apply(obj)).await?;
            self.store.commit(
                component,
                &obj.identity,
                AppliedRecord {
                    fingerprint: obj.fingerprint(),
                    release: release.to_string(),
                    api_version: obj.api_version.clone(),
                },
            )?;
            applied += 1;
        }

        for stale in &plan.post_deletes {
            self.delete_one(component, stale, token).await?;
            deleted += 1;
        }

        info!(
            scope = %component,
            release = %release,
            applied,
            deleted,
            unchanged = plan.unchanged,
            "reconcile complete"
        );
        Ok(ReconcileOutcome {
            release: release.to_string(),
            applied,
            deleted,
            unchanged: plan.unchanged,
        })
    }

    async fn delete_one(
        &self,
        component: Component,
        stale: &StaleResource,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        Self::checkpoint(token)?;
        let name = format!("delete {}", stale.identity);
        retry_with_backoff(&self.retry, &name, || {
            self.cluster.delete(&stale.identity, &stale.api_version)
        })
        .await?;
        self.store.remove(component, &stale.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::cluster::MockClusterApi;
    use super::*;
    use crate::state::MemoryStateStore;
    use serde_json::json;

    fn object(kind: &str, name: &str, payload: &str) -> ResourceObject {
        ResourceObject::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {"name": name, "namespace": "kube-system"},
            "data": {"payload": payload}
        }))
        .unwrap()
    }

    fn record_for(obj: &ResourceObject, release: &str) -> AppliedRecord {
        AppliedRecord {
            fingerprint: obj.fingerprint(),
            release: release.to_string(),
            api_version: obj.api_version.clone(),
        }
    }

    fn state_with(records: &[(&ResourceObject, &str)]) -> AppliedState {
        AppliedState {
            records: records
                .iter()
                .map(|(obj, rel)| (obj.identity.clone(), record_for(obj, rel)))
                .collect(),
            degraded: false,
        }
    }

    #[test]
    fn test_plan_first_pass_applies_everything() {
        let desired = vec![object("ConfigMap", "a", "1"), object("Secret", "b", "1")];
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &desired,
            &AppliedState::default(),
        );
        assert_eq!(plan.applies.len(), 2);
        assert_eq!(plan.unchanged, 0);
        assert!(plan.pre_deletes.is_empty());
        assert!(plan.post_deletes.is_empty());
    }

    #[test]
    fn test_plan_converged_is_noop() {
        let desired = vec![object("ConfigMap", "a", "1")];
        let state = state_with(&[(&desired[0], "v1.22")]);
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &desired,
            &state,
        );
        assert!(plan.is_noop());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_plan_partitions_upgrade() {
        // a unchanged, b changed content, c no longer rendered, d new
        let a = object("ConfigMap", "a", "1");
        let b_old = object("ConfigMap", "b", "1");
        let b_new = object("ConfigMap", "b", "2");
        let c = object("Secret", "c", "1");
        let d = object("ServiceAccount", "d", "1");

        let state = state_with(&[(&a, "v1.2"), (&b_old, "v1.2"), (&c, "v1.2")]);
        let desired = vec![a.clone(), b_new.clone(), d.clone()];
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &desired,
            &state,
        );

        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.applies, vec![b_new, d]);
        assert!(plan.pre_deletes.is_empty());
        assert_eq!(plan.post_deletes.len(), 1);
        assert_eq!(plan.post_deletes[0].identity, c.identity);
    }

    #[test]
    fn test_plan_rename_deletes_before_apply() {
        // Same kind, new name: the old object goes first
        let old = object("ConfigMap", "old-name", "1");
        let new = object("ConfigMap", "new-name", "1");
        let state = state_with(&[(&old, "v1.2")]);
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &[new.clone()],
            &state,
        );
        assert_eq!(plan.pre_deletes.len(), 1);
        assert_eq!(plan.pre_deletes[0].identity, old.identity);
        assert!(plan.post_deletes.is_empty());
        assert_eq!(plan.applies, vec![new]);
    }

    #[test]
    fn test_plan_update_of_same_kind_keeps_stale_delete_last() {
        // b is updated in place, not renamed; the stale ConfigMap must not
        // be deleted ahead of the applies
        let b_old = object("ConfigMap", "b", "1");
        let b_new = object("ConfigMap", "b", "2");
        let stale = object("ConfigMap", "old", "1");
        let state = state_with(&[(&b_old, "v1.2"), (&stale, "v1.2")]);
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &[b_new.clone()],
            &state,
        );
        assert!(plan.pre_deletes.is_empty());
        assert_eq!(plan.post_deletes.len(), 1);
        assert_eq!(plan.post_deletes[0].identity, stale.identity);
        assert_eq!(plan.applies, vec![b_new]);
    }

    #[test]
    fn test_plan_never_deletes_unowned_releases() {
        let foreign = object("ConfigMap", "theirs", "1");
        let state = state_with(&[(&foreign, "v9.9-custom")]);
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &[],
            &state,
        );
        assert!(plan.is_noop());
        assert_eq!(plan.skipped_unowned, 1);
    }

    #[test]
    fn test_plan_degraded_state_suspends_deletes() {
        let stale = object("ConfigMap", "stale", "1");
        let mut state = state_with(&[(&stale, "v1.2")]);
        state.degraded = true;
        let fresh = object("Secret", "fresh", "1");
        let plan = plan(
            Component::Provider,
            &ReleaseCatalog::default(),
            &[fresh.clone()],
            &state,
        );
        assert!(plan.pre_deletes.is_empty());
        assert!(plan.post_deletes.is_empty());
        assert_eq!(plan.applies, vec![fresh]);
    }

    #[tokio::test]
    async fn test_execute_commits_per_operation() {
        // Second apply fails terminally; the first stays committed
        let a = object("ConfigMap", "a", "1");
        let b = object("Secret", "b", "1");

        let mut mock = MockClusterApi::new();
        mock.expect_apply()
            .withf(|r: &ResourceObject| r.identity.name == "a")
            .returning(|_| Ok(()));
        mock.expect_apply()
            .withf(|r: &ResourceObject| r.identity.name == "b")
            .returning(|r| {
                Err(Error::cluster_op(r.identity.to_string(), "forbidden", false))
            });

        let store = Arc::new(MemoryStateStore::new());
        let engine = Engine::new(Arc::new(mock), store.clone())
            .with_retry(RetryConfig::with_max_attempts(1));

        let err = engine
            .reconcile_objects(Component::Provider, "v1.22", vec![a.clone(), b])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterOp { .. }));

        let state = store.load(Component::Provider);
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[&a.identity].release, "v1.22");
    }

    #[tokio::test]
    async fn test_reconcile_objects_is_resumable() {
        // Re-running after a partial pass only performs the remainder
        let a = object("ConfigMap", "a", "1");
        let b = object("Secret", "b", "1");
        let store = Arc::new(MemoryStateStore::new());
        store
            .commit(Component::Provider, &a.identity, record_for(&a, "v1.22"))
            .unwrap();

        let mut mock = MockClusterApi::new();
        mock.expect_apply()
            .withf(|r: &ResourceObject| r.identity.name == "b")
            .times(1)
            .returning(|_| Ok(()));

        let engine = Engine::new(Arc::new(mock), store.clone());
        let outcome = engine
            .reconcile_objects(Component::Provider, "v1.22", vec![a, b])
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(store.len(Component::Provider), 2);
    }

    #[tokio::test]
    async fn test_stale_resource_deleted_and_forgotten() {
        let keep = object("ConfigMap", "keep", "1");
        let stale = object("Secret", "stale", "1");
        let store = Arc::new(MemoryStateStore::new());
        store
            .commit(
                Component::Provider,
                &keep.identity,
                record_for(&keep, "v1.22"),
            )
            .unwrap();
        store
            .commit(
                Component::Provider,
                &stale.identity,
                record_for(&stale, "v1.2"),
            )
            .unwrap();

        let mut mock = MockClusterApi::new();
        let stale_identity = stale.identity.clone();
        mock.expect_delete()
            .withf(move |id: &ResourceIdentity, _: &str| *id == stale_identity)
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = Engine::new(Arc::new(mock), store.clone());
        let outcome = engine
            .reconcile_objects(Component::Provider, "v1.22", vec![keep])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(store.len(Component::Provider), 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_all_owned_records() {
        let a = object("ConfigMap", "a", "1");
        let b = object("Secret", "b", "1");
        let foreign = object("ConfigMap", "theirs", "1");
        let store = Arc::new(MemoryStateStore::new());
        store
            .commit(Component::Provider, &a.identity, record_for(&a, "v1.22"))
            .unwrap();
        store
            .commit(Component::Provider, &b.identity, record_for(&b, "v1.2"))
            .unwrap();
        store
            .commit(
                Component::Provider,
                &foreign.identity,
                record_for(&foreign, "not-ours"),
            )
            .unwrap();

        let mut mock = MockClusterApi::new();
        mock.expect_delete().times(2).returning(|_, _| Ok(()));

        let engine = Engine::new(Arc::new(mock), store.clone());
        let deleted = engine.cleanup(Component::Provider).await.unwrap();
        assert_eq!(deleted, 2);
        // The unowned record stays
        assert_eq!(store.len(Component::Provider), 1);
    }

    #[tokio::test]
    async fn test_superseded_attempt_stops_at_checkpoint() {
        let mut mock = MockClusterApi::new();
        mock.expect_apply().returning(|_| Ok(()));
        let engine = Engine::new(Arc::new(mock), Arc::new(MemoryStateStore::new()));

        // Registering a second attempt cancels the first token
        let first = engine.supersede(Component::Provider).await;
        let _second = engine.supersede(Component::Provider).await;
        assert!(first.is_cancelled());
        assert!(matches!(
            Engine::checkpoint(&first),
            Err(Error::Superseded)
        ));
    }

    /// Cluster fake whose first apply registers a newer attempt for the
    /// scope, superseding the one driving it
    #[derive(Default)]
    struct SupersedingCluster {
        engine: std::sync::Mutex<Option<Arc<Engine>>>,
        applies: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClusterApi for SupersedingCluster {
        async fn apply(&self, _resource: &ResourceObject) -> Result<(), Error> {
            self.applies
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let engine = self.engine.lock().unwrap().clone();
            if let Some(engine) = engine {
                engine.supersede(Component::Provider).await;
            }
            Ok(())
        }

        async fn delete(
            &self,
            _identity: &ResourceIdentity,
            _api_version: &str,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_superseded_mid_batch_keeps_committed_records() {
        let cluster = Arc::new(SupersedingCluster::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = Arc::new(Engine::new(cluster.clone(), store.clone()));
        *cluster.engine.lock().unwrap() = Some(engine.clone());

        let a = object("ConfigMap", "a", "1");
        let b = object("Secret", "b", "1");
        let err = engine
            .reconcile_objects(Component::Provider, "v1.22", vec![a.clone(), b])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Superseded));

        // The attempt finished its first operation, committed it, and
        // stopped before the second
        assert_eq!(
            cluster.applies.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        let state = store.load(Component::Provider);
        assert_eq!(state.records.len(), 1);
        assert!(state.records.contains_key(&a.identity));
    }
}
