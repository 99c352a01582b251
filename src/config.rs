//! Config resolution: direct options merged with relation data
//!
//! Direct configuration and relation-supplied values are merged under a
//! defined precedence into an immutable [`ParameterSet`] snapshot. Rendering
//! only ever sees the snapshot, never ambient state.
//!
//! Precedence: a relation-supplied value overrides the corresponding direct
//! option field-wise when the relation has delivered that field. A required
//! field missing from both sources is a [`Error::NotReady`] precondition,
//! not a failure.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::catalog::Component;
use crate::relations::RelationViews;
use crate::Error;

/// Directly configured options, as delivered by the operator
///
/// Option names match the charm's configuration surface. Empty strings are
/// treated as unset, matching how the charm strips empty values before
/// evaluation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CharmConfig {
    /// vCenter server address
    pub server: Option<String>,
    /// vCenter username
    pub username: Option<String>,
    /// vCenter password
    pub password: Option<String>,
    /// vCenter datacenter
    pub datacenter: Option<String>,
    /// Space-separated `key=value` tokens selecting control-plane nodes
    #[serde(rename = "control-node-selector")]
    pub control_node_selector: Option<String>,
    /// Registry host override for every container image
    #[serde(rename = "image-registry")]
    pub image_registry: Option<String>,
    /// Provider (CPI) release selector; default is the latest supported
    #[serde(rename = "provider-release")]
    pub provider_release: Option<String>,
    /// Storage (CSI) release selector; default is the latest supported
    #[serde(rename = "storage-release")]
    pub storage_release: Option<String>,
    /// Comma-separated `key=value` pairs for the default storage class
    #[serde(rename = "storage-class-parameters")]
    pub storage_class_parameters: Option<String>,
    /// Boolean-as-string toggling the CSI migration feature gate
    #[serde(rename = "csi-migration")]
    pub csi_migration: Option<String>,
}

impl CharmConfig {
    fn get(field: &Option<String>) -> Option<&str> {
        field.as_deref().filter(|s| !s.is_empty())
    }
}

/// The resolved configuration for one reconciliation event
///
/// Created per event and never persisted: relation and config data remain
/// the source of truth, and the snapshot is rebuilt from them on every
/// trigger.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSet {
    /// vCenter server address
    pub server: String,
    /// vCenter username
    pub username: String,
    /// vCenter password
    pub password: String,
    /// vCenter datacenter
    pub datacenter: String,
    /// Parsed node-selector labels for control-plane placement
    pub control_node_selector: BTreeMap<String, String>,
    /// Registry override, if any
    pub image_registry: Option<String>,
    /// Parsed storage-class parameters
    pub storage_class_parameters: BTreeMap<String, String>,
    /// Whether the CSI migration feature gate is enabled
    pub csi_migration: bool,
    /// Requested provider release, if pinned
    pub provider_release: Option<String>,
    /// Requested storage release, if pinned
    pub storage_release: Option<String>,
    /// Cluster identifier embedded in the CSI config secret
    pub cluster_id: String,
}

/// Cluster id used when neither kube-control nor a control-plane peer
/// supplies one
const DEFAULT_CLUSTER_ID: &str = "kubernetes";

impl ParameterSet {
    /// Merge direct config and relation views into a validated snapshot
    ///
    /// Returns [`Error::NotReady`] when a required field is missing from
    /// both sources and [`Error::InvalidConfig`] when an option value is
    /// malformed.
    pub fn resolve(config: &CharmConfig, relations: &RelationViews) -> Result<Self, Error> {
        let integrator = relations.integrator.clone().unwrap_or_default();
        let kube_control = relations.kube_control.clone().unwrap_or_default();
        let control_plane_app = relations
            .external_cloud_provider
            .as_ref()
            .and_then(|ecp| ecp.app.as_deref());

        // Relation data wins field-wise over direct config.
        let server = integrator
            .vsphere_ip
            .as_deref()
            .or_else(|| CharmConfig::get(&config.server));
        let username = integrator
            .user
            .as_deref()
            .or_else(|| CharmConfig::get(&config.username));
        let password = integrator
            .password
            .as_deref()
            .or_else(|| CharmConfig::get(&config.password));
        let datacenter = integrator
            .datacenter
            .as_deref()
            .or_else(|| CharmConfig::get(&config.datacenter));

        let server = required("server", server)?;
        let username = required("username", username)?;
        let password = required("password", password)?;
        let datacenter = required("datacenter", datacenter)?;

        let control_node_selector = match control_plane_app {
            Some(app) => BTreeMap::from([("juju-application".to_string(), app.to_string())]),
            None => match CharmConfig::get(&config.control_node_selector) {
                Some(raw) => parse_node_selector(raw)?,
                None => {
                    return Err(Error::not_ready(
                        "waiting for definition of control-node-selector",
                    ))
                }
            },
        };

        let image_registry = kube_control
            .registry_location
            .clone()
            .or_else(|| CharmConfig::get(&config.image_registry).map(str::to_string));

        let storage_class_parameters = match CharmConfig::get(&config.storage_class_parameters) {
            Some(raw) => parse_storage_class_parameters(raw)?,
            None => BTreeMap::new(),
        };

        let csi_migration = match CharmConfig::get(&config.csi_migration) {
            Some(raw) => parse_bool_option("csi-migration", raw)?,
            None => false,
        };

        let cluster_id = kube_control
            .cluster_tag
            .clone()
            .or_else(|| control_plane_app.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string());

        Ok(Self {
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            datacenter: datacenter.to_string(),
            control_node_selector,
            image_registry,
            storage_class_parameters,
            csi_migration,
            provider_release: CharmConfig::get(&config.provider_release).map(str::to_string),
            storage_release: CharmConfig::get(&config.storage_release).map(str::to_string),
            cluster_id,
        })
    }

    /// The pinned release for a component, if any
    pub fn release(&self, component: Component) -> Option<&str> {
        match component {
            Component::Provider => self.provider_release.as_deref(),
            Component::Storage => self.storage_release.as_deref(),
        }
    }
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, Error> {
    value.ok_or_else(|| Error::not_ready(format!("waiting for definition of {field}")))
}

/// Parse a `control-node-selector` value
///
/// Space-separated tokens, each `key=value`, `key=` (empty value), or a
/// bare `key`. An empty key is malformed.
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut selector = BTreeMap::new();
    for token in raw.split_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        if key.is_empty() {
            return Err(Error::invalid_config(
                "control-node-selector",
                format!("empty label key in token '{token}'"),
            ));
        }
        selector.insert(key.to_string(), value.to_string());
    }
    Ok(selector)
}

/// Parse a `storage-class-parameters` value
///
/// Comma-separated `key=value` pairs; values may contain spaces. A pair
/// without a `=` separator is malformed.
pub fn parse_storage_class_parameters(raw: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut params = BTreeMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::invalid_config(
                "storage-class-parameters",
                format!("parameter missing '=' separator in '{pair}'"),
            ));
        };
        if key.is_empty() {
            return Err(Error::invalid_config(
                "storage-class-parameters",
                format!("empty parameter key in '{pair}'"),
            ));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

fn parse_bool_option(option: &str, raw: &str) -> Result<bool, Error> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::invalid_config(
            option,
            format!("expected \"true\" or \"false\", got {other:?}"),
        )),
    }
}
