//! Manifest rendering: bundle + parameters → desired state
//!
//! Rendering is pure and deterministic: identical (bundle, params) inputs
//! always yield byte-identical resource objects, which is what makes the
//! persisted content fingerprints meaningful. The renderer never reads
//! ambient state; everything it needs arrives in the [`ParameterSet`]
//! snapshot.
//!
//! Substitution anchors are validated after the pass: a bundle missing an
//! object a substitution requires fails the whole render, so a partially
//! substituted manifest is never handed to the reconciler.

pub mod patches;

use tracing::debug;

use crate::catalog::{Component, ReleaseBundle};
use crate::config::ParameterSet;
use crate::resource::{parse_manifest_documents, ResourceObject};
use crate::Error;

use patches::{
    apply_csi_feature_gate, apply_managed_label, apply_node_selector, apply_provider_config_map,
    apply_provider_secret, apply_registry, storage_class, storage_secret,
    PROVIDER_CONFIG_MAP_NAME, PROVIDER_SECRET_NAME, STORAGE_CONTROLLER_NAME,
};

/// Render a release bundle against a parameter snapshot
///
/// Returns the ordered desired state for the bundle's component. Parse
/// failures and missing substitution anchors are [`Error::Render`]; nothing
/// partial escapes.
pub fn render(bundle: &ReleaseBundle, params: &ParameterSet) -> Result<Vec<ResourceObject>, Error> {
    let mut documents = Vec::new();
    for manifest in bundle.manifests {
        documents.extend(parse_manifest_documents(manifest).map_err(|e| {
            Error::render(
                format!("{}/{}", bundle.component, bundle.version),
                e.to_string(),
            )
        })?);
    }

    let mut secret_patched = false;
    let mut config_map_patched = false;
    let mut feature_gate_patched = false;

    for doc in &mut documents {
        apply_managed_label(doc);
        if let Some(registry) = &params.image_registry {
            apply_registry(doc, registry);
        }
        apply_node_selector(doc, params);

        match bundle.component {
            Component::Provider => {
                secret_patched |= apply_provider_secret(doc, params);
                config_map_patched |= apply_provider_config_map(doc, params)?;
            }
            Component::Storage => {
                feature_gate_patched |= apply_csi_feature_gate(doc, params.csi_migration);
            }
        }
    }

    // Anchor validation: a bundle that lost a substitution target would
    // otherwise deploy with placeholder credentials.
    match bundle.component {
        Component::Provider => {
            if !secret_patched {
                return Err(missing_anchor(bundle, "Secret", PROVIDER_SECRET_NAME));
            }
            if !config_map_patched {
                return Err(missing_anchor(bundle, "ConfigMap", PROVIDER_CONFIG_MAP_NAME));
            }
        }
        Component::Storage => {
            if !feature_gate_patched {
                return Err(missing_anchor(bundle, "Deployment", STORAGE_CONTROLLER_NAME));
            }
            let mut secret = storage_secret(params);
            apply_managed_label(&mut secret);
            let mut class = storage_class(params);
            apply_managed_label(&mut class);
            documents.push(secret);
            documents.push(class);
        }
    }

    let objects = documents
        .into_iter()
        .map(ResourceObject::from_value)
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        component = %bundle.component,
        version = bundle.version,
        count = objects.len(),
        "rendered bundle"
    );
    Ok(objects)
}

fn missing_anchor(bundle: &ReleaseBundle, kind: &str, name: &str) -> Error {
    Error::render(
        format!("{}/{}", kind, name),
        format!(
            "bundle {}/{} has no {} named {} to substitute into",
            bundle.component, bundle.version, kind, name
        ),
    )
}
