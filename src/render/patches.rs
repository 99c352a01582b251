//! Typed manifest substitutions
//!
//! Each substitution targets a named anchor in the upstream manifests (the
//! credentials secret, the cloud-config map, the CSI controller) or a whole
//! class of objects (workload pod templates, container images). Operating on
//! parsed JSON values with explicit anchors eliminates the malformed-YAML
//! failure mode of string templating.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

use crate::config::ParameterSet;
use crate::{Error, MANAGED_LABEL, PROVIDER_NAMESPACE, STORAGE_NAMESPACE};

/// Name of the provider credentials secret the CPI manifests ship
pub const PROVIDER_SECRET_NAME: &str = "vsphere-cloud-secret";
/// Name of the provider cloud-config map the CPI manifests ship
pub const PROVIDER_CONFIG_MAP_NAME: &str = "vsphere-cloud-config";
/// Name of the CSI config secret this engine adds
pub const STORAGE_SECRET_NAME: &str = "vsphere-config-secret";
/// Key inside the CSI config secret the driver reads
pub const STORAGE_SECRET_DATA_KEY: &str = "csi-vsphere.conf";
/// Name of the CSI controller deployment carrying the feature gate
pub const STORAGE_CONTROLLER_NAME: &str = "vsphere-csi-controller";
/// Name of the default storage class this engine adds
pub const STORAGE_CLASS_NAME: &str = "csi-vsphere-default";
/// Provisioner the default storage class points at
pub const STORAGE_PROVISIONER: &str = "csi.vsphere.vmware.com";

/// Label every rendered object as managed by this operator
pub fn apply_managed_label(obj: &mut Value) {
    let metadata = obj
        .as_object_mut()
        .map(|o| o.entry("metadata").or_insert_with(|| json!({})))
        .and_then(Value::as_object_mut);
    if let Some(metadata) = metadata {
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| json!({}));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(MANAGED_LABEL.to_string(), json!("true"));
        }
    }
}

/// Rewrite the registry/host segment of a container image reference
///
/// The host component (and the organization segment that follows it, when
/// further path segments remain) is replaced by `registry`; the image path
/// and tag are preserved. `gcr.io/cloud-provider-vsphere/cpi/release/manager:v1.2.1`
/// with registry `rocks.example.com:443/cdk` becomes
/// `rocks.example.com:443/cdk/cpi/release/manager:v1.2.1`.
pub fn rewrite_image_registry(image: &str, registry: &str) -> String {
    let mut parts: Vec<&str> = image.split('/').collect();
    if parts.len() > 1 && is_registry_host(parts[0]) {
        parts.remove(0);
    }
    if parts.len() > 1 {
        parts.remove(0);
    }
    format!("{}/{}", registry.trim_end_matches('/'), parts.join("/"))
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Rewrite every container and init-container image in a workload object
pub fn apply_registry(obj: &mut Value, registry: &str) {
    for list in ["containers", "initContainers"] {
        let containers = obj
            .pointer_mut(&format!("/spec/template/spec/{list}"))
            .and_then(Value::as_array_mut);
        let Some(containers) = containers else {
            continue;
        };
        for container in containers {
            if let Some(image) = container.get("image").and_then(Value::as_str) {
                let rewritten = rewrite_image_registry(image, registry);
                container["image"] = json!(rewritten);
            }
        }
    }
}

/// Whether this object is a workload whose pod template takes placement
fn is_workload(obj: &Value) -> bool {
    matches!(
        obj.get("kind").and_then(Value::as_str),
        Some("DaemonSet") | Some("Deployment")
    )
}

/// Inject the control-node-selector into a workload's pod template
///
/// Existing selector keys this engine does not manage are preserved.
pub fn apply_node_selector(obj: &mut Value, params: &ParameterSet) {
    if !is_workload(obj) {
        return;
    }
    let Some(pod_spec) = obj
        .pointer_mut("/spec/template/spec")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    let selector = pod_spec
        .entry("nodeSelector")
        .or_insert_with(|| json!({}));
    if let Some(selector) = selector.as_object_mut() {
        for (key, value) in &params.control_node_selector {
            selector.insert(key.clone(), json!(value));
        }
    }
}

/// Patch the provider credentials secret with the resolved connection data
///
/// The key names (`<server>.username`, `<server>.password`) are what the
/// cloud-controller-manager expects; returns whether the anchor matched.
pub fn apply_provider_secret(obj: &mut Value, params: &ParameterSet) -> bool {
    if obj.get("kind").and_then(Value::as_str) != Some("Secret")
        || obj.pointer("/metadata/name").and_then(Value::as_str) != Some(PROVIDER_SECRET_NAME)
    {
        return false;
    }
    obj["stringData"] = json!({
        format!("{}.username", params.server): params.username,
        format!("{}.password", params.server): params.password,
    });
    true
}

/// Patch the provider cloud-config map with a generated `vsphere.conf`
///
/// Returns whether the anchor matched.
pub fn apply_provider_config_map(obj: &mut Value, params: &ParameterSet) -> Result<bool, Error> {
    if obj.get("kind").and_then(Value::as_str) != Some("ConfigMap")
        || obj.pointer("/metadata/name").and_then(Value::as_str) != Some(PROVIDER_CONFIG_MAP_NAME)
    {
        return Ok(false);
    }
    let conf = json!({
        "global": {
            "port": 443,
            "insecureFlag": true,
            "secretName": PROVIDER_SECRET_NAME,
            "secretNamespace": PROVIDER_NAMESPACE,
        },
        "vcenter": {
            &params.datacenter: {
                "server": params.server,
                "secretName": PROVIDER_SECRET_NAME,
                "secretNamespace": PROVIDER_NAMESPACE,
            }
        }
    });
    let rendered = serde_yaml::to_string(&conf).map_err(|e| {
        Error::render(
            format!("ConfigMap/{PROVIDER_NAMESPACE}/{PROVIDER_CONFIG_MAP_NAME}"),
            format!("failed to serialize vsphere.conf: {e}"),
        )
    })?;
    obj["data"]["vsphere.conf"] = json!(rendered);
    Ok(true)
}

/// Toggle the CSI migration feature gate on the controller's command line
///
/// Replaces an existing `--feature-gates=CSIMigration=...` argument or
/// appends one. Returns whether the anchor container matched.
pub fn apply_csi_feature_gate(obj: &mut Value, enabled: bool) -> bool {
    if obj.get("kind").and_then(Value::as_str) != Some("Deployment")
        || obj.pointer("/metadata/name").and_then(Value::as_str) != Some(STORAGE_CONTROLLER_NAME)
    {
        return false;
    }
    let Some(containers) = obj
        .pointer_mut("/spec/template/spec/containers")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let Some(controller) = containers
        .iter_mut()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(STORAGE_CONTROLLER_NAME))
    else {
        return false;
    };
    let gate = format!("--feature-gates=CSIMigration={enabled}");
    let Some(controller) = controller.as_object_mut() else {
        return false;
    };
    let args = controller.entry("args").or_insert_with(|| json!([]));
    if let Some(args) = args.as_array_mut() {
        match args.iter_mut().find(|a| {
            a.as_str()
                .is_some_and(|s| s.starts_with("--feature-gates=CSIMigration="))
        }) {
            Some(existing) => *existing = json!(gate),
            None => args.push(json!(gate)),
        }
    }
    true
}

/// Build the CSI config secret the storage bundle consumes
///
/// The payload is the INI document the driver parses; key names and quoting
/// match the upstream format exactly.
pub fn storage_secret(params: &ParameterSet) -> Value {
    let conf = format!(
        "[Global]\n\
         cluster-id = \"{}\"\n\
         \n\
         [VirtualCenter \"{}\"]\n\
         insecure-flag = \"true\"\n\
         user = \"{}\"\n\
         password = \"{}\"\n\
         port = \"443\"\n\
         datacenters = \"{}\"\n",
        params.cluster_id, params.server, params.username, params.password, params.datacenter,
    );
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": STORAGE_SECRET_NAME,
            "namespace": STORAGE_NAMESPACE,
        },
        "data": {
            STORAGE_SECRET_DATA_KEY: STANDARD.encode(conf),
        }
    })
}

/// Build the default storage class carrying the configured parameters
pub fn storage_class(params: &ParameterSet) -> Value {
    let parameters: Map<String, Value> = params
        .storage_class_parameters
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "StorageClass",
        "metadata": {
            "name": STORAGE_CLASS_NAME,
            "annotations": {
                "storageclass.kubernetes.io/is-default-class": "true",
            },
        },
        "provisioner": STORAGE_PROVISIONER,
        "parameters": parameters,
    })
}
