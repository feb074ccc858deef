//! # Cluster Handles
//!
//! Bundles the cache and the API client of every kind the operator touches.

use crate::controller::client::KindClient;
use crate::controller::store::ObjectStore;
use crate::crd::{
    KubeVirt, PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor,
    VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use std::fmt;
use std::sync::Arc;

/// Cache plus client for one kind
pub struct KindHandle<K> {
    pub store: Arc<dyn ObjectStore<K>>,
    pub client: Arc<dyn KindClient<K>>,
}

impl<K> KindHandle<K> {
    pub fn new(store: Arc<dyn ObjectStore<K>>, client: Arc<dyn KindClient<K>>) -> Self {
        Self { store, client }
    }
}

impl<K> Clone for KindHandle<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
        }
    }
}

impl<K> fmt::Debug for KindHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindHandle")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

/// Every cache and client the reconciler reads from or writes to
#[derive(Clone)]
pub struct Cluster {
    pub service_accounts: KindHandle<ServiceAccount>,
    pub cluster_roles: KindHandle<ClusterRole>,
    pub cluster_role_bindings: KindHandle<ClusterRoleBinding>,
    pub roles: KindHandle<Role>,
    pub role_bindings: KindHandle<RoleBinding>,
    pub crds: KindHandle<CustomResourceDefinition>,
    pub services: KindHandle<Service>,
    pub deployments: KindHandle<Deployment>,
    pub daemon_sets: KindHandle<DaemonSet>,
    pub pod_disruption_budgets: KindHandle<PodDisruptionBudget>,
    pub validating_webhooks: KindHandle<ValidatingWebhookConfiguration>,
    pub mutating_webhooks: KindHandle<MutatingWebhookConfiguration>,
    pub api_services: KindHandle<APIService>,
    pub secrets: KindHandle<Secret>,
    pub config_maps: KindHandle<ConfigMap>,
    pub sccs: KindHandle<SecurityContextConstraints>,
    pub routes: KindHandle<Route>,
    pub service_monitors: KindHandle<ServiceMonitor>,
    pub prometheus_rules: KindHandle<PrometheusRule>,
    pub instancetypes: KindHandle<VirtualMachineClusterInstancetype>,
    pub preferences: KindHandle<VirtualMachineClusterPreference>,
    pub namespaces: KindHandle<Namespace>,
    pub kubevirts: KindHandle<KubeVirt>,
    /// Pods of the operator namespace, for canary health
    pub pods: Arc<dyn ObjectStore<Pod>>,
    /// Config maps holding rendered install strategies
    pub install_strategies: Arc<dyn ObjectStore<ConfigMap>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster").finish_non_exhaustive()
    }
}
