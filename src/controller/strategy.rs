//! # Install Strategy
//!
//! The fully rendered set of objects for one version, loaded from the config
//! maps that carry it. Read-only during a pass.

use crate::constants::{
    APP_LABEL, INSTALL_STRATEGY_LABEL, INSTALL_STRATEGY_MANIFESTS_KEY,
    INSTALL_STRATEGY_REGISTRY_ANNOTATION, INSTALL_STRATEGY_VERSION_ANNOTATION, KUBEVIRT_CA_NAME,
    KUBEVIRT_EXPORT_CA_NAME, VIRT_API_NAME, VIRT_EXPORT_PROXY_NAME, VIRT_SYNCHRONIZATION_NAME,
};
use crate::controller::store::ObjectStore;
use crate::crd::{
    PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor,
    VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::Resource;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Errors loading an install strategy
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("no install strategy config map found for version {version} and registry {registry}")]
    NotFound { version: String, registry: String },

    #[error("install strategy config map {0} has no manifests")]
    MissingManifests(String),

    #[error("unable to parse install strategy {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("install strategy {name} contains an object without a kind")]
    MissingKind { name: String },

    #[error("install strategy {name} contains unsupported kind {kind}")]
    UnknownKind { name: String, kind: String },
}

impl StrategyError {
    /// A missing strategy usually means it has not been rendered yet
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// What a control-plane deployment does, which decides when it is rolled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentRole {
    Api,
    Controller,
    /// Only installed with the export feature gate
    ExportProxy,
    /// Only installed with the decentralized live migration feature gate
    Synchronization,
}

/// Every desired object of one version, one list per kind
#[derive(Debug, Clone, Default)]
pub struct TargetStrategy {
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_roles: Vec<ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
    pub crds: Vec<CustomResourceDefinition>,
    pub services: Vec<Service>,
    pub deployments: Vec<Deployment>,
    pub daemon_sets: Vec<DaemonSet>,
    pub validating_webhooks: Vec<ValidatingWebhookConfiguration>,
    pub mutating_webhooks: Vec<MutatingWebhookConfiguration>,
    pub api_services: Vec<APIService>,
    pub secrets: Vec<Secret>,
    pub config_maps: Vec<ConfigMap>,
    pub sccs: Vec<SecurityContextConstraints>,
    pub routes: Vec<Route>,
    pub service_monitors: Vec<ServiceMonitor>,
    pub prometheus_rules: Vec<PrometheusRule>,
    pub instancetypes: Vec<VirtualMachineClusterInstancetype>,
    pub preferences: Vec<VirtualMachineClusterPreference>,
}

fn parse_doc<T: serde::de::DeserializeOwned>(
    name: &str,
    value: serde_yaml::Value,
) -> Result<T, StrategyError> {
    serde_yaml::from_value(value).map_err(|source| StrategyError::Parse {
        name: name.to_string(),
        source,
    })
}

impl TargetStrategy {
    /// Parse a multi-document YAML manifest; `name` is only used in errors
    pub fn from_manifests(name: &str, manifests: &str) -> Result<Self, StrategyError> {
        let mut strategy = Self::default();

        for document in serde_yaml::Deserializer::from_str(manifests) {
            let value =
                serde_yaml::Value::deserialize(document).map_err(|source| StrategyError::Parse {
                    name: name.to_string(),
                    source,
                })?;
            if value.is_null() {
                continue;
            }
            let kind = value
                .get("kind")
                .and_then(serde_yaml::Value::as_str)
                .ok_or_else(|| StrategyError::MissingKind {
                    name: name.to_string(),
                })?
                .to_string();

            match kind.as_str() {
                "ServiceAccount" => strategy.service_accounts.push(parse_doc(name, value)?),
                "ClusterRole" => strategy.cluster_roles.push(parse_doc(name, value)?),
                "ClusterRoleBinding" => strategy.cluster_role_bindings.push(parse_doc(name, value)?),
                "Role" => strategy.roles.push(parse_doc(name, value)?),
                "RoleBinding" => strategy.role_bindings.push(parse_doc(name, value)?),
                "CustomResourceDefinition" => strategy.crds.push(parse_doc(name, value)?),
                "Service" => strategy.services.push(parse_doc(name, value)?),
                "Deployment" => strategy.deployments.push(parse_doc(name, value)?),
                "DaemonSet" => strategy.daemon_sets.push(parse_doc(name, value)?),
                "ValidatingWebhookConfiguration" => {
                    strategy.validating_webhooks.push(parse_doc(name, value)?);
                }
                "MutatingWebhookConfiguration" => {
                    strategy.mutating_webhooks.push(parse_doc(name, value)?);
                }
                "APIService" => strategy.api_services.push(parse_doc(name, value)?),
                "Secret" => strategy.secrets.push(parse_doc(name, value)?),
                "ConfigMap" => strategy.config_maps.push(parse_doc(name, value)?),
                "SecurityContextConstraints" => strategy.sccs.push(parse_doc(name, value)?),
                "Route" => strategy.routes.push(parse_doc(name, value)?),
                "ServiceMonitor" => strategy.service_monitors.push(parse_doc(name, value)?),
                "PrometheusRule" => strategy.prometheus_rules.push(parse_doc(name, value)?),
                "VirtualMachineClusterInstancetype" => {
                    strategy.instancetypes.push(parse_doc(name, value)?);
                }
                "VirtualMachineClusterPreference" => {
                    strategy.preferences.push(parse_doc(name, value)?);
                }
                other => {
                    return Err(StrategyError::UnknownKind {
                        name: name.to_string(),
                        kind: other.to_string(),
                    })
                }
            }
        }

        Ok(strategy)
    }

    /// Place namespaced objects that do not name a namespace into `namespace`
    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        fn fill<K: Resource>(objects: &mut [K], namespace: &str) {
            for obj in objects {
                obj.meta_mut()
                    .namespace
                    .get_or_insert_with(|| namespace.to_string());
            }
        }
        fill(&mut self.service_accounts, namespace);
        fill(&mut self.roles, namespace);
        fill(&mut self.role_bindings, namespace);
        fill(&mut self.services, namespace);
        fill(&mut self.deployments, namespace);
        fill(&mut self.daemon_sets, namespace);
        fill(&mut self.secrets, namespace);
        fill(&mut self.config_maps, namespace);
        fill(&mut self.routes, namespace);
        fill(&mut self.service_monitors, namespace);
        fill(&mut self.prometheus_rules, namespace);
        self
    }

    pub fn deployment_role(deployment: &Deployment) -> DeploymentRole {
        let app = deployment
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(APP_LABEL))
            .or(deployment.metadata.name.as_ref())
            .map(String::as_str)
            .unwrap_or_default();
        match app {
            VIRT_API_NAME => DeploymentRole::Api,
            VIRT_EXPORT_PROXY_NAME => DeploymentRole::ExportProxy,
            VIRT_SYNCHRONIZATION_NAME => DeploymentRole::Synchronization,
            _ => DeploymentRole::Controller,
        }
    }

    pub fn deployments_with_role(&self, role: DeploymentRole) -> Vec<&Deployment> {
        self.deployments
            .iter()
            .filter(|d| Self::deployment_role(d) == role)
            .collect()
    }

    pub fn ca_secret(&self, name: &str) -> Option<&Secret> {
        self.secrets
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some(name))
    }

    pub fn ca_config_map(&self, name: &str) -> Option<&ConfigMap> {
        self.config_maps
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(name))
    }

    /// Secrets holding leaf certificates (everything but the two CAs)
    pub fn certificate_secrets(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.iter().filter(|s| !is_ca_name(s.metadata.name.as_deref()))
    }

    /// Config maps that are not CA bundles
    pub fn plain_config_maps(&self) -> impl Iterator<Item = &ConfigMap> {
        self.config_maps
            .iter()
            .filter(|c| !is_ca_name(c.metadata.name.as_deref()))
    }
}

pub fn is_ca_name(name: Option<&str>) -> bool {
    matches!(name, Some(KUBEVIRT_CA_NAME | KUBEVIRT_EXPORT_CA_NAME))
}

/// Parsed strategies keyed by config map uid and resourceVersion
#[derive(Debug, Default)]
pub struct StrategyCache {
    entries: Mutex<HashMap<String, Arc<TargetStrategy>>>,
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the most recent strategy for `version`/`registry` from `store`
    pub fn load(
        &self,
        store: &dyn ObjectStore<ConfigMap>,
        namespace: &str,
        version: &str,
        registry: &str,
    ) -> Result<Arc<TargetStrategy>, StrategyError> {
        let config_map = find_strategy_config_map(store, namespace, version, registry).ok_or_else(
            || StrategyError::NotFound {
                version: version.to_string(),
                registry: registry.to_string(),
            },
        )?;

        let name = config_map.metadata.name.clone().unwrap_or_default();
        let cache_key = format!(
            "{}/{}",
            config_map.metadata.uid.as_deref().unwrap_or(&name),
            config_map.metadata.resource_version.as_deref().unwrap_or_default()
        );

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(strategy) = entries.get(&cache_key) {
            debug!(config_map = %name, "using cached install strategy");
            return Ok(Arc::clone(strategy));
        }

        let manifests = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(INSTALL_STRATEGY_MANIFESTS_KEY))
            .ok_or_else(|| StrategyError::MissingManifests(name.clone()))?;
        let strategy = Arc::new(
            TargetStrategy::from_manifests(&name, manifests)?.with_default_namespace(namespace),
        );
        info!(config_map = %name, version, registry, "loaded install strategy");
        entries.insert(cache_key, Arc::clone(&strategy));
        Ok(strategy)
    }
}

fn find_strategy_config_map(
    store: &dyn ObjectStore<ConfigMap>,
    namespace: &str,
    version: &str,
    registry: &str,
) -> Option<Arc<ConfigMap>> {
    store
        .list()
        .into_iter()
        .filter(|cm| {
            let meta = &cm.metadata;
            let annotation = |key: &str| meta.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str);
            meta.namespace.as_deref() == Some(namespace)
                && meta
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key(INSTALL_STRATEGY_LABEL))
                && annotation(INSTALL_STRATEGY_VERSION_ANNOTATION) == Some(version)
                && annotation(INSTALL_STRATEGY_REGISTRY_ANNOTATION) == Some(registry)
        })
        .max_by_key(|cm| cm.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::FakeCluster;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const MANIFESTS: &str = r"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: kubevirt-apiserver
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: virt-api
  labels:
    kubevirt.io: virt-api
spec:
  selector:
    matchLabels:
      kubevirt.io: virt-api
  template:
    metadata:
      labels:
        kubevirt.io: virt-api
    spec:
      containers:
      - name: virt-api
        image: quay.io/kubevirt/virt-api:v1.4.0
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: virt-controller
  labels:
    kubevirt.io: virt-controller
spec:
  selector:
    matchLabels:
      kubevirt.io: virt-controller
  template:
    spec:
      containers:
      - name: virt-controller
        image: quay.io/kubevirt/virt-controller:v1.4.0
---
apiVersion: v1
kind: Secret
metadata:
  name: kubevirt-ca
---
apiVersion: v1
kind: Secret
metadata:
  name: kubevirt-virt-api-certs
";

    #[test]
    fn test_parse_manifests() {
        let strategy = TargetStrategy::from_manifests("test", MANIFESTS)
            .unwrap()
            .with_default_namespace("kubevirt");
        assert_eq!(strategy.service_accounts.len(), 1);
        assert_eq!(strategy.deployments.len(), 2);
        assert_eq!(
            strategy.deployments[0].metadata.namespace.as_deref(),
            Some("kubevirt")
        );
        assert_eq!(strategy.deployments_with_role(DeploymentRole::Api).len(), 1);
        assert_eq!(
            strategy.deployments_with_role(DeploymentRole::Controller).len(),
            1
        );
        assert!(strategy.ca_secret(KUBEVIRT_CA_NAME).is_some());
        let certs: Vec<_> = strategy.certificate_secrets().collect();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = TargetStrategy::from_manifests("test", "apiVersion: v1\nkind: Pod\nmetadata:\n  name: x\n")
            .unwrap_err();
        assert!(matches!(err, StrategyError::UnknownKind { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_cache_loads_matching_config_map() {
        let fake = FakeCluster::new();
        let store = fake.install_strategies.clone();
        let cache = StrategyCache::new();

        let err = cache.load(store.as_ref(), "kubevirt", "v1.4.0", "quay.io/kubevirt").unwrap_err();
        assert!(err.is_transient());

        store.seed(ConfigMap {
            metadata: ObjectMeta {
                name: Some("kubevirt-install-strategy-abc".to_string()),
                namespace: Some("kubevirt".to_string()),
                labels: Some([(INSTALL_STRATEGY_LABEL.to_string(), String::new())].into()),
                annotations: Some(
                    [
                        (INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), "v1.4.0".to_string()),
                        (
                            INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(),
                            "quay.io/kubevirt".to_string(),
                        ),
                    ]
                    .into(),
                ),
                ..ObjectMeta::default()
            },
            data: Some([(INSTALL_STRATEGY_MANIFESTS_KEY.to_string(), MANIFESTS.to_string())].into()),
            ..ConfigMap::default()
        });

        let first = cache.load(store.as_ref(), "kubevirt", "v1.4.0", "quay.io/kubevirt").unwrap();
        let second = cache.load(store.as_ref(), "kubevirt", "v1.4.0", "quay.io/kubevirt").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.load(store.as_ref(), "kubevirt", "v1.5.0", "quay.io/kubevirt").is_err());
    }
}
