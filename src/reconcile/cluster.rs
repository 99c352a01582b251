//! Cluster access for the reconciler
//!
//! [`ClusterApi`] is the single seam between the engine and a live
//! cluster: apply one resource, delete one resource. The production
//! implementation drives `Api<DynamicObject>` with server-side apply,
//! which makes apply idempotent and lets one field manager own every
//! rendered field. Tests mock this trait instead of a cluster.

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::kube_error_is_retryable;
use crate::resource::{build_api_resource, ResourceIdentity, ResourceObject};
use crate::Error;

/// Field manager name stamped on every server-side apply
pub const FIELD_MANAGER: &str = "vsphere-cloud-operator";

/// Operations the reconciler performs against a cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update one resource to exactly the rendered content
    async fn apply(&self, resource: &ResourceObject) -> Result<(), Error>;

    /// Delete one resource; succeeds if it is already gone
    async fn delete(&self, identity: &ResourceIdentity, api_version: &str) -> Result<(), Error>;
}

/// `ClusterApi` backed by a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an established kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, identity: &ResourceIdentity, api_version: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, &identity.kind);
        match &identity.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn classify(identity: &ResourceIdentity, err: kube::Error) -> Error {
        Error::cluster_op(
            identity.to_string(),
            err.to_string(),
            kube_error_is_retryable(&err),
        )
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, resource: &ResourceObject) -> Result<(), Error> {
        let api = self.dynamic_api(&resource.identity, &resource.api_version);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        debug!(resource = %resource.identity, "applying resource");
        api.patch(
            &resource.identity.name,
            &params,
            &Patch::Apply(&resource.body),
        )
        .await
        .map_err(|e| Self::classify(&resource.identity, e))?;
        Ok(())
    }

    async fn delete(&self, identity: &ResourceIdentity, api_version: &str) -> Result<(), Error> {
        let api = self.dynamic_api(identity, api_version);
        debug!(resource = %identity, "deleting resource");
        match api.delete(&identity.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is the desired end state
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Self::classify(identity, e)),
        }
    }
}
