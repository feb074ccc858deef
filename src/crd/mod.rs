//! # Custom Resource Definitions
//!
//! The `KubeVirt` resource the operator reconciles, plus the third-party
//! resource types it installs.

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use kube::CustomResource;
use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod status;
pub mod thirdparty;

pub use status::*;
pub use thirdparty::*;

/// KubeVirt Custom Resource Definition
///
/// Declares which version of the virtualization control plane is installed
/// and how it is configured. Exactly one may exist, in the operator namespace.
///
/// # Example
///
/// ```yaml
/// apiVersion: kubevirt.io/v1
/// kind: KubeVirt
/// metadata:
///   name: kubevirt
///   namespace: kubevirt
/// spec:
///   imageTag: v1.4.0
///   configuration:
///     developerConfiguration:
///       featureGates: ["VMExport"]
///   infra:
///     replicas: 3
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "KubeVirt",
    group = "kubevirt.io",
    version = "v1",
    namespaced,
    status = "KubeVirtStatus",
    shortname = "kv",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Version", "type":"string", "jsonPath":".status.observedKubeVirtVersion"}, {"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtSpec {
    /// Version to install; defaults to the operator's own version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    /// Registry to pull component images from; defaults to the operator's registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registry: Option<String>,
    /// Value of the `app.kubernetes.io/part-of` label on installed objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Value of the `app.kubernetes.io/version` label on installed objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
    /// Value of the `app.kubernetes.io/component` label on installed objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_component: Option<String>,
    #[serde(default)]
    pub configuration: KubeVirtConfiguration,
    #[serde(default)]
    pub certificate_rotate_strategy: CertificateRotateStrategy,
    /// Placement and scale of the control-plane deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra: Option<ComponentConfig>,
    /// Placement of the node daemonsets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workloads: Option<ComponentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_configuration: Option<DeveloperConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_instancetypes_deployment: Option<CommonInstancetypesDeployment>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperConfiguration {
    #[serde(default)]
    pub feature_gates: Vec<String>,
}

/// Toggles installation of the bundled cluster instancetypes and preferences
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonInstancetypesDeployment {
    /// Defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRotateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedStrategy>,
}

/// Rotation intervals for the self-signed certificate authority and the
/// certificates it issues
///
/// All values are Kubernetes duration strings (e.g. `168h`, `24h`, `30m`).
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedStrategy {
    /// CA certificate lifetime. Default: 168h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_rotate_interval: Option<String>,
    /// How long a replaced CA stays in the bundle, and how early the CA is renewed. Default: 24h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_overlap_interval: Option<String>,
    /// Leaf certificate lifetime. Default: 24h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_rotate_interval: Option<String>,
    /// How long before expiry a leaf certificate is renewed. Default: 18h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_renew_before: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_placement: Option<NodePlacement>,
    /// Replica override for the API and controller deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Scheduling constraints merged into every pod template of a component group
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePlacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserved_object_list")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserved_object")]
    pub affinity: Option<Affinity>,
}

fn preserved_object(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

fn preserved_object_list(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    })
}

impl KubeVirt {
    /// `namespace/name` key used for expectations and the requeue queue
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.spec
            .configuration
            .developer_configuration
            .as_ref()
            .is_some_and(|dev| dev.feature_gates.iter().any(|g| g == gate))
    }

    pub fn common_instancetypes_enabled(&self) -> bool {
        self.spec
            .configuration
            .common_instancetypes_deployment
            .as_ref()
            .and_then(|c| c.enabled)
            .unwrap_or(true)
    }

    pub fn infra_replicas(&self) -> Option<i32> {
        self.spec.infra.as_ref().and_then(|c| c.replicas)
    }

    pub fn infra_placement(&self) -> Option<&NodePlacement> {
        self.spec.infra.as_ref().and_then(|c| c.node_placement.as_ref())
    }

    pub fn workloads_placement(&self) -> Option<&NodePlacement> {
        self.spec
            .workloads
            .as_ref()
            .and_then(|c| c.node_placement.as_ref())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
