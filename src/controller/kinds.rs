//! # Managed Kinds
//!
//! Per-kind policy for the generic object syncer: how bodies compare, which
//! fields cannot change in place, how updates are written, and where the
//! kind lives in the [`Cluster`].

use crate::controller::cluster::{Cluster, KindHandle};
use crate::crd::{
    PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor,
    VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::{self, Debug, Display};

/// Every kind the operator reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    CustomResourceDefinition,
    Service,
    Deployment,
    DaemonSet,
    PodDisruptionBudget,
    ValidatingWebhookConfiguration,
    MutatingWebhookConfiguration,
    ApiService,
    Secret,
    ConfigMap,
    SecurityContextConstraints,
    Route,
    ServiceMonitor,
    PrometheusRule,
    VirtualMachineClusterInstancetype,
    VirtualMachineClusterPreference,
    Namespace,
    KubeVirt,
}

impl ObjectKind {
    pub const ALL: [Self; 23] = [
        Self::ServiceAccount,
        Self::ClusterRole,
        Self::ClusterRoleBinding,
        Self::Role,
        Self::RoleBinding,
        Self::CustomResourceDefinition,
        Self::Service,
        Self::Deployment,
        Self::DaemonSet,
        Self::PodDisruptionBudget,
        Self::ValidatingWebhookConfiguration,
        Self::MutatingWebhookConfiguration,
        Self::ApiService,
        Self::Secret,
        Self::ConfigMap,
        Self::SecurityContextConstraints,
        Self::Route,
        Self::ServiceMonitor,
        Self::PrometheusRule,
        Self::VirtualMachineClusterInstancetype,
        Self::VirtualMachineClusterPreference,
        Self::Namespace,
        Self::KubeVirt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::CustomResourceDefinition => "CustomResourceDefinition",
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::PodDisruptionBudget => "PodDisruptionBudget",
            Self::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            Self::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
            Self::ApiService => "APIService",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::SecurityContextConstraints => "SecurityContextConstraints",
            Self::Route => "Route",
            Self::ServiceMonitor => "ServiceMonitor",
            Self::PrometheusRule => "PrometheusRule",
            Self::VirtualMachineClusterInstancetype => "VirtualMachineClusterInstancetype",
            Self::VirtualMachineClusterPreference => "VirtualMachineClusterPreference",
            Self::Namespace => "Namespace",
            Self::KubeVirt => "KubeVirt",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an existing object is brought up to date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// JSON patch of metadata plus a replace of the body field
    Patch,
    /// Whole-object replace guarded by the cached resourceVersion
    Update,
}

/// A kind the generic syncer can create, update and delete
pub trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ObjectKind;
    /// Top-level field replaced by the patch; `None` for metadata-only kinds
    const BODY_FIELD: Option<&'static str> = Some("spec");
    const WRITE_MODE: WriteMode = WriteMode::Patch;
    /// Whether `.metadata.generation` is recorded in the managed resource status
    const TRACK_GENERATION: bool = false;
    /// Fall back to a live GET when the object is missing from the cache
    const LOOKUP_LIVE: bool = false;

    fn handle(cluster: &Cluster) -> &KindHandle<Self>;

    /// The body field as JSON (`Null` when absent)
    fn body(&self) -> Result<Value, serde_json::Error> {
        let Some(field) = Self::BODY_FIELD else {
            return Ok(Value::Null);
        };
        let mut value = serde_json::to_value(self)?;
        Ok(value
            .get_mut(field)
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Whether `cached` already carries everything `desired` declares
    fn body_equal(desired: &Self, cached: &Self) -> bool {
        match (desired.body(), cached.body()) {
            (Ok(want), Ok(have)) => json_contains(&have, &want),
            _ => false,
        }
    }

    /// Whether `desired` can only be applied by deleting and recreating
    fn immutable_changed(_desired: &Self, _cached: &Self) -> bool {
        false
    }

    /// Copy fields the cluster owns from `cached` into `desired`
    fn inherit(_desired: &mut Self, _cached: &Self) {}
}

/// Structural containment: every field present in `want` has the same value
/// in `have`. Arrays must have the same length and contain element-wise.
/// A `null` in `want` matches a missing field.
pub fn json_contains(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (_, Value::Null) => true,
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(key, w)| match have.get(key) {
            Some(h) => json_contains(h, w),
            None => w.is_null() || is_empty_container(w),
        }),
        (Value::Array(have), Value::Array(want)) => {
            have.len() == want.len() && have.iter().zip(want).all(|(h, w)| json_contains(h, w))
        }
        (have, want) => have == want,
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Order-insensitive comparison of two lists
pub fn same_set<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}

macro_rules! managed_kind {
    ($ty:ty, $kind:ident, $field:ident $(, $name:ident: $t:ty = $value:expr)* $(,)?) => {
        impl ManagedKind for $ty {
            const KIND: ObjectKind = ObjectKind::$kind;
            $(const $name: $t = $value;)*

            fn handle(cluster: &Cluster) -> &KindHandle<Self> {
                &cluster.$field
            }
        }
    };
}

managed_kind!(ServiceAccount, ServiceAccount, service_accounts, BODY_FIELD: Option<&'static str> = None);
managed_kind!(CustomResourceDefinition, CustomResourceDefinition, crds, TRACK_GENERATION: bool = true);
managed_kind!(Deployment, Deployment, deployments, TRACK_GENERATION: bool = true);
managed_kind!(DaemonSet, DaemonSet, daemon_sets, TRACK_GENERATION: bool = true);
managed_kind!(PodDisruptionBudget, PodDisruptionBudget, pod_disruption_budgets, TRACK_GENERATION: bool = true);
managed_kind!(
    ValidatingWebhookConfiguration,
    ValidatingWebhookConfiguration,
    validating_webhooks,
    BODY_FIELD: Option<&'static str> = Some("webhooks"),
    TRACK_GENERATION: bool = true,
    LOOKUP_LIVE: bool = true,
);
managed_kind!(
    MutatingWebhookConfiguration,
    MutatingWebhookConfiguration,
    mutating_webhooks,
    BODY_FIELD: Option<&'static str> = Some("webhooks"),
    TRACK_GENERATION: bool = true,
    LOOKUP_LIVE: bool = true,
);
managed_kind!(APIService, ApiService, api_services);
managed_kind!(Secret, Secret, secrets, BODY_FIELD: Option<&'static str> = Some("data"), LOOKUP_LIVE: bool = true);
managed_kind!(ConfigMap, ConfigMap, config_maps, BODY_FIELD: Option<&'static str> = Some("data"));
managed_kind!(Route, Route, routes);
managed_kind!(ServiceMonitor, ServiceMonitor, service_monitors);
managed_kind!(PrometheusRule, PrometheusRule, prometheus_rules);
managed_kind!(VirtualMachineClusterInstancetype, VirtualMachineClusterInstancetype, instancetypes);
managed_kind!(VirtualMachineClusterPreference, VirtualMachineClusterPreference, preferences);

impl ManagedKind for Service {
    const KIND: ObjectKind = ObjectKind::Service;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.services
    }

    /// Either side not a ClusterIP service, or a pinned cluster IP that
    /// differs from the live one
    fn immutable_changed(desired: &Self, cached: &Self) -> bool {
        let is_cluster_ip = |svc: &Service| {
            svc.spec
                .as_ref()
                .and_then(|s| s.type_.as_deref())
                .is_none_or(|t| t.is_empty() || t == "ClusterIP")
        };
        let cluster_ip = |svc: &Service| {
            svc.spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .unwrap_or_default()
        };

        let desired_ip = cluster_ip(desired);
        !is_cluster_ip(desired)
            || !is_cluster_ip(cached)
            || (!desired_ip.is_empty() && desired_ip != cluster_ip(cached))
    }

    fn inherit(desired: &mut Self, cached: &Self) {
        let Some(cached_spec) = cached.spec.as_ref() else {
            return;
        };
        let spec = desired.spec.get_or_insert_with(Default::default);
        spec.cluster_ip.clone_from(&cached_spec.cluster_ip);
        spec.cluster_ips.clone_from(&cached_spec.cluster_ips);
        spec.type_.clone_from(&cached_spec.type_);
        if spec.session_affinity.as_deref().unwrap_or_default().is_empty() {
            spec.session_affinity.clone_from(&cached_spec.session_affinity);
        }
    }
}

impl ManagedKind for ClusterRole {
    const KIND: ObjectKind = ObjectKind::ClusterRole;
    const BODY_FIELD: Option<&'static str> = None;
    const WRITE_MODE: WriteMode = WriteMode::Update;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.cluster_roles
    }

    fn body_equal(desired: &Self, cached: &Self) -> bool {
        same_set(
            desired.rules.as_deref().unwrap_or_default(),
            cached.rules.as_deref().unwrap_or_default(),
        ) && desired.aggregation_rule == cached.aggregation_rule
    }
}

impl ManagedKind for Role {
    const KIND: ObjectKind = ObjectKind::Role;
    const BODY_FIELD: Option<&'static str> = None;
    const WRITE_MODE: WriteMode = WriteMode::Update;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.roles
    }

    fn body_equal(desired: &Self, cached: &Self) -> bool {
        same_set(
            desired.rules.as_deref().unwrap_or_default(),
            cached.rules.as_deref().unwrap_or_default(),
        )
    }
}

impl ManagedKind for ClusterRoleBinding {
    const KIND: ObjectKind = ObjectKind::ClusterRoleBinding;
    const BODY_FIELD: Option<&'static str> = None;
    const WRITE_MODE: WriteMode = WriteMode::Update;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.cluster_role_bindings
    }

    fn body_equal(desired: &Self, cached: &Self) -> bool {
        desired.role_ref == cached.role_ref
            && same_set(
                desired.subjects.as_deref().unwrap_or_default(),
                cached.subjects.as_deref().unwrap_or_default(),
            )
    }
}

impl ManagedKind for RoleBinding {
    const KIND: ObjectKind = ObjectKind::RoleBinding;
    const BODY_FIELD: Option<&'static str> = None;
    const WRITE_MODE: WriteMode = WriteMode::Update;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.role_bindings
    }

    fn body_equal(desired: &Self, cached: &Self) -> bool {
        desired.role_ref == cached.role_ref
            && same_set(
                desired.subjects.as_deref().unwrap_or_default(),
                cached.subjects.as_deref().unwrap_or_default(),
            )
    }
}

impl ManagedKind for SecurityContextConstraints {
    const KIND: ObjectKind = ObjectKind::SecurityContextConstraints;
    const BODY_FIELD: Option<&'static str> = None;
    const WRITE_MODE: WriteMode = WriteMode::Update;

    fn handle(cluster: &Cluster) -> &KindHandle<Self> {
        &cluster.sccs
    }

    fn body_equal(desired: &Self, cached: &Self) -> bool {
        let users_equal = same_set(
            desired.users.as_deref().unwrap_or_default(),
            cached.users.as_deref().unwrap_or_default(),
        );
        users_equal
            && json_contains(
                &Value::Object(cached.fields.clone()),
                &Value::Object(desired.fields.clone()),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::rbac::v1::{PolicyRule, Subject};
    use serde_json::json;

    fn service(type_: Option<&str>, ip: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: type_.map(str::to_string),
                cluster_ip: ip.map(str::to_string),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn test_json_contains() {
        let have = json!({"a": 1, "b": {"c": [1, 2], "d": "x"}, "extra": true});
        assert!(json_contains(&have, &json!({"a": 1, "b": {"c": [1, 2]}})));
        assert!(json_contains(&have, &json!({"missing": null, "empty": {}})));
        assert!(!json_contains(&have, &json!({"b": {"c": [1]}})));
        assert!(!json_contains(&have, &json!({"a": 2})));
    }

    #[test]
    fn test_service_empty_cluster_ip_is_inherited() {
        let desired = service(None, None);
        let cached = service(Some("ClusterIP"), Some("10.0.0.12"));
        assert!(!Service::immutable_changed(&desired, &cached));

        let mut inherited = desired.clone();
        Service::inherit(&mut inherited, &cached);
        assert_eq!(
            inherited.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("10.0.0.12")
        );
        assert!(Service::body_equal(&inherited, &cached));
    }

    #[test]
    fn test_service_type_or_pinned_ip_change_needs_recreate() {
        let cached = service(Some("ClusterIP"), Some("10.0.0.12"));
        assert!(Service::immutable_changed(&service(Some("NodePort"), None), &cached));
        assert!(Service::immutable_changed(&service(None, Some("10.0.0.99")), &cached));
        assert!(!Service::immutable_changed(&service(None, Some("10.0.0.12")), &cached));
    }

    #[test]
    fn test_non_cluster_ip_service_always_recreates() {
        let node_port = service(Some("NodePort"), Some("10.0.0.12"));
        assert!(Service::immutable_changed(&node_port, &node_port));
        assert!(Service::immutable_changed(
            &service(Some("ClusterIP"), None),
            &service(Some("LoadBalancer"), Some("10.0.0.12"))
        ));
        assert!(!Service::immutable_changed(
            &service(Some(""), None),
            &service(Some("ClusterIP"), Some("10.0.0.12"))
        ));
    }

    #[test]
    fn test_rbac_compares_as_sets() {
        let rule = |verb: &str| PolicyRule {
            verbs: vec![verb.to_string()],
            ..PolicyRule::default()
        };
        let a = ClusterRole {
            rules: Some(vec![rule("get"), rule("list")]),
            ..ClusterRole::default()
        };
        let b = ClusterRole {
            rules: Some(vec![rule("list"), rule("get")]),
            ..ClusterRole::default()
        };
        assert!(ClusterRole::body_equal(&a, &b));

        let subject = |name: &str| Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            ..Subject::default()
        };
        let x = ClusterRoleBinding {
            subjects: Some(vec![subject("a"), subject("b")]),
            ..ClusterRoleBinding::default()
        };
        let y = ClusterRoleBinding {
            subjects: Some(vec![subject("b"), subject("a")]),
            ..ClusterRoleBinding::default()
        };
        assert!(ClusterRoleBinding::body_equal(&x, &y));
        let z = ClusterRoleBinding {
            subjects: Some(vec![subject("a")]),
            ..ClusterRoleBinding::default()
        };
        assert!(!ClusterRoleBinding::body_equal(&x, &z));
    }

    #[test]
    fn test_body_extracts_field() {
        let cm = ConfigMap {
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..ConfigMap::default()
        };
        assert_eq!(cm.body().unwrap(), json!({"k": "v"}));
        assert_eq!(ServiceAccount::default().body().unwrap(), Value::Null);
    }
}
