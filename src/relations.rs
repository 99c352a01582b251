//! Typed views of peer-relation data
//!
//! Relations deliver connection and placement data from external
//! collaborators: the vsphere-integration peer supplies vCenter credentials,
//! kube-control supplies the cluster's image registry and cluster tag, and
//! the external-cloud-provider peer declares this operator as the cluster's
//! cloud provider (exactly one peer). The wire protocols live outside this
//! engine; here the delivered data is consumed as plain deserialized values.

use serde::Deserialize;

/// Credential and placement data from the vsphere-integration relation
///
/// Field names match the integrator's wire format. Optional placement
/// fields (`datastore`, `folder`, `respool_path`) are carried through for
/// the storage-class parameters even though the engine does not require
/// them.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct VsphereIntegrationData {
    /// vCenter server address
    pub vsphere_ip: Option<String>,
    /// vCenter username
    pub user: Option<String>,
    /// vCenter password
    pub password: Option<String>,
    /// Datacenter the cluster's machines live in
    pub datacenter: Option<String>,
    /// Default datastore for volumes
    pub datastore: Option<String>,
    /// VM folder for the cluster
    pub folder: Option<String>,
    /// Resource pool path
    pub respool_path: Option<String>,
}

impl VsphereIntegrationData {
    /// Whether all credential fields have been delivered
    pub fn is_ready(&self) -> bool {
        self.vsphere_ip.is_some()
            && self.user.is_some()
            && self.password.is_some()
            && self.datacenter.is_some()
    }
}

/// Cluster metadata from the kube-control relation
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct KubeControlData {
    /// Image registry the control plane mirrors upstream images into
    #[serde(rename = "registry-location")]
    pub registry_location: Option<String>,
    /// Unique tag identifying the cluster, used as the CSI cluster-id
    #[serde(rename = "cluster-tag")]
    pub cluster_tag: Option<String>,
}

/// The external-cloud-provider peer declaring this engine as the cluster's
/// cloud provider
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ExternalCloudProvider {
    /// Application name of the control-plane peer; doubles as the default
    /// control-node-selector (`juju-application=<app>`)
    pub app: Option<String>,
}

/// All relation-supplied inputs for one reconciliation event
///
/// Every view is optional: an absent relation simply contributes nothing,
/// and the config resolver decides whether the merged result is complete.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RelationViews {
    /// vsphere-integration relation data, if joined
    #[serde(default)]
    pub integrator: Option<VsphereIntegrationData>,
    /// kube-control relation data, if joined
    #[serde(default)]
    pub kube_control: Option<KubeControlData>,
    /// external-cloud-provider peer, if joined
    #[serde(default)]
    pub external_cloud_provider: Option<ExternalCloudProvider>,
}
