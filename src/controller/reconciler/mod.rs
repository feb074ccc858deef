//! # Reconciler
//!
//! One pass of driving the cluster towards a loaded install strategy.
//!
//! A pass walks the phases in a fixed order: definitions and monitoring
//! objects, RBAC, services, certificates, then the control-plane workloads
//! along either the update path or the create/rollback path. Cleanup of
//! objects the strategy no longer names only happens once the whole
//! infrastructure has rolled over. [`Reconciler::sync`] returns `true` when
//! there is nothing left to wait on.

use crate::constants::{CLUSTER_MONITORING_LABEL, INSTALL_STRATEGY_LABEL};
use crate::controller::canary::DaemonSetMigration;
use crate::controller::client::PatchDocument;
use crate::controller::cluster::Cluster;
use crate::controller::events::EventRecorder;
use crate::controller::expectations::Expectations;
use crate::controller::kinds::{ManagedKind, ObjectKind};
use crate::controller::patch::PatchBuilder;
use crate::controller::pki::CertificateIssuer;
use crate::controller::queue::RequeueQueue;
use crate::controller::strategy::{is_ca_name, DeploymentRole, TargetStrategy};
use crate::controller::syncer::name_of;
use crate::controller::webhooks::is_tmp_webhook;
use crate::controller::stamp::Stamp;
use crate::crd::{KubeVirt, VirtualMachineClusterInstancetype, VirtualMachineClusterPreference};
use crate::error::ReconcileError;
use crate::observability::metrics;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionVersion,
};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

pub mod installation;
pub mod status;

pub use installation::{InstallationController, Outcome};

/// Shared collaborators handed to every [`Reconciler`]
#[derive(Clone)]
pub struct Dependencies {
    pub cluster: Arc<Cluster>,
    pub expectations: Arc<Expectations>,
    pub recorder: Arc<dyn EventRecorder>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub migrations: Vec<Arc<dyn DaemonSetMigration>>,
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("issuer", &self.issuer)
            .field("migrations", &self.migrations)
            .finish_non_exhaustive()
    }
}

/// State of one reconcile pass for one managed resource
pub struct Reconciler {
    pub(crate) kv: KubeVirt,
    pub(crate) strategy: Arc<TargetStrategy>,
    pub(crate) stamp: Stamp,
    /// `namespace/name` of the managed resource, the expectations owner
    pub(crate) owner: String,
    /// Namespace the control plane is installed into
    pub(crate) namespace: String,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) expectations: Arc<Expectations>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) issuer: Arc<dyn CertificateIssuer>,
    pub(crate) migrations: Vec<Arc<dyn DaemonSetMigration>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("owner", &self.owner)
            .field("stamp", &self.stamp)
            .finish_non_exhaustive()
    }
}

/// Which parts of the control plane already run the target version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rollover {
    pub api: bool,
    pub controllers: bool,
    pub infrastructure: bool,
}

/// Whether moving from `observed` to `target` is an upgrade
///
/// Versions that are not semver are assumed to be upgrades; an empty
/// observed version is a fresh install.
pub fn should_take_update_path(target: &str, observed: &str) -> bool {
    if observed.is_empty() {
        return false;
    }
    let parse = |v: &str| semver::Version::parse(v.strip_prefix('v').unwrap_or(v));
    match (parse(target), parse(observed)) {
        (Ok(target), Ok(observed)) => target > observed,
        _ => true,
    }
}

fn status_missing(version: &CustomResourceDefinitionVersion) -> bool {
    version
        .subresources
        .as_ref()
        .is_none_or(|s| s.status.is_none())
}

fn cached_version<'a>(
    cached: &'a CustomResourceDefinition,
    name: &str,
) -> Option<&'a CustomResourceDefinitionVersion> {
    cached.spec.versions.iter().find(|v| v.name == name)
}

/// Drop the status subresource from versions the live definition serves without one
fn withhold_status_subresource(desired: &mut CustomResourceDefinition, cached: &CustomResourceDefinition) {
    for version in &mut desired.spec.versions {
        if cached_version(cached, &version.name).is_some_and(status_missing) {
            if let Some(subresources) = version.subresources.as_mut() {
                subresources.status = None;
            }
        }
    }
}

/// Whether a desired version enables a status subresource the live one lacks
fn needs_status_subresource(desired: &CustomResourceDefinition, cached: &CustomResourceDefinition) -> bool {
    desired.spec.versions.iter().any(|version| {
        !status_missing(version) && cached_version(cached, &version.name).is_some_and(status_missing)
    })
}

impl Reconciler {
    pub fn new(
        kv: KubeVirt,
        strategy: Arc<TargetStrategy>,
        namespace: impl Into<String>,
        deps: &Dependencies,
    ) -> Self {
        let stamp = Stamp::target(&kv);
        let owner = kv.key();
        Self {
            kv,
            strategy,
            stamp,
            owner,
            namespace: namespace.into(),
            cluster: Arc::clone(&deps.cluster),
            expectations: Arc::clone(&deps.expectations),
            recorder: Arc::clone(&deps.recorder),
            issuer: Arc::clone(&deps.issuer),
            migrations: deps.migrations.clone(),
        }
    }

    /// The managed resource with the status written during the pass
    pub fn kv(&self) -> &KubeVirt {
        &self.kv
    }

    pub fn into_kv(self) -> KubeVirt {
        self.kv
    }

    pub(crate) fn rollover(&self) -> Rollover {
        let api = self.deployments_rolled_over(DeploymentRole::Api);
        let controllers = self.deployments_rolled_over(DeploymentRole::Controller);
        let gated = self.deployments_rolled_over(DeploymentRole::ExportProxy)
            && self.deployments_rolled_over(DeploymentRole::Synchronization);
        let daemon_sets = self.daemon_sets_rolled_over();

        let status = self.kv.status.clone().unwrap_or_default();
        let previously_observed = status.target_kube_virt_version
            == status.observed_kube_virt_version
            && status.target_kube_virt_registry == status.observed_kube_virt_registry;

        Rollover {
            api,
            controllers,
            infrastructure: (api && controllers && gated && daemon_sets) || previously_observed,
        }
    }

    /// Run one pass; `Ok(true)` once the strategy is fully applied
    pub async fn sync(&mut self, queue: &dyn RequeueQueue) -> Result<bool, ReconcileError> {
        for (field, value) in self.stamp.invalid_product_fields() {
            error!(
                field,
                value,
                "invalid label value: must be 63 characters or less, begin and end with an alphanumeric character, and contain only dots, hyphens or underscores"
            );
        }

        let rollover = self.rollover();
        debug!(?rollover, "computed rollover state");
        let strategy = Arc::clone(&self.strategy);

        if rollover.api {
            self.delete_tmp_webhooks().await?;
        } else {
            self.create_tmp_webhook().await?;
        }

        self.sync_crds().await?;
        self.sync_all(&strategy.service_monitors).await?;
        self.sync_all(&strategy.prometheus_rules).await?;

        if !rollover.infrastructure {
            self.backup_rbac().await?;
        }

        self.sync_all(&strategy.service_accounts).await?;
        self.sync_all(&strategy.cluster_roles).await?;
        self.sync_all(&strategy.cluster_role_bindings).await?;
        self.sync_all(&strategy.roles).await?;
        self.sync_all(&strategy.role_bindings).await?;
        self.sync_all(&strategy.sccs).await?;
        if self.sync_all(&strategy.services).await? {
            info!("waiting for a service to be recreated");
            return Ok(false);
        }
        let config_maps: Vec<ConfigMap> = strategy.plain_config_maps().cloned().collect();
        self.sync_all(&config_maps).await?;

        self.sync_certificates(queue).await?;

        if rollover.infrastructure {
            self.remove_from_privileged_scc().await?;
        }

        let status = self.kv.status.clone().unwrap_or_default();
        let finished = if should_take_update_path(
            status.target_kube_virt_version.as_deref().unwrap_or_default(),
            status.observed_kube_virt_version.as_deref().unwrap_or_default(),
        ) {
            self.update_path(rollover).await?
        } else {
            self.create_path(rollover).await?
        };
        if !finished {
            return Ok(false);
        }

        self.sync_namespace_labels().await?;

        if !rollover.infrastructure {
            debug!("waiting for the infrastructure to roll over before cleanup");
            return Ok(false);
        }

        self.rollout_crd_status_subresources().await?;
        self.delete_objects_not_in_strategy().await?;

        if self.kv.common_instancetypes_enabled() {
            self.sync_all(&strategy.instancetypes).await?;
            self.sync_all(&strategy.preferences).await?;
        } else {
            self.delete_absent::<VirtualMachineClusterInstancetype>(&[], |_| false)
                .await?;
            self.delete_absent::<VirtualMachineClusterPreference>(&[], |_| false)
                .await?;
        }

        Ok(true)
    }

    /// Node components first, then controllers, then the API that turns
    /// new features on
    async fn update_path(&mut self, rollover: Rollover) -> Result<bool, ReconcileError> {
        let strategy = Arc::clone(&self.strategy);
        for daemon_set in &strategy.daemon_sets {
            if !self.sync_daemon_set(daemon_set).await? {
                return Ok(false);
            }
        }
        self.sync_deployments(DeploymentRole::Controller).await?;
        if !rollover.controllers {
            return Ok(false);
        }
        self.sync_gated_deployments().await?;
        self.sync_deployments(DeploymentRole::Api).await?;
        Ok(true)
    }

    /// The API first so new objects are validated before anything acts on them
    async fn create_path(&mut self, rollover: Rollover) -> Result<bool, ReconcileError> {
        self.sync_deployments(DeploymentRole::Api).await?;
        if !rollover.api {
            return Ok(false);
        }
        self.sync_deployments(DeploymentRole::Controller).await?;
        self.sync_gated_deployments().await?;

        let strategy = Arc::clone(&self.strategy);
        for daemon_set in &strategy.daemon_sets {
            if !self.sync_daemon_set(daemon_set).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn sync_crds(&mut self) -> Result<(), ReconcileError> {
        let mut desired = self.strategy.crds.clone();
        for crd in &mut desired {
            if let Some(cached) = CustomResourceDefinition::handle(&self.cluster)
                .store
                .get(None, name_of(&crd.metadata))
            {
                withhold_status_subresource(crd, &cached);
            }
        }
        self.sync_all(&desired).await?;
        Ok(())
    }

    /// Turn on status subresources once every component serves them
    async fn rollout_crd_status_subresources(&mut self) -> Result<(), ReconcileError> {
        let strategy = Arc::clone(&self.strategy);
        for crd in &strategy.crds {
            let name = name_of(&crd.metadata);
            let Some(cached) = CustomResourceDefinition::handle(&self.cluster)
                .store
                .get(None, name)
            else {
                continue;
            };
            if !self.stamp.matches(&cached.metadata) || !needs_status_subresource(crd, &cached) {
                continue;
            }
            let desired = self.stamped(crd);
            let patch = PatchBuilder::new()
                .test_generation(cached.metadata.generation)
                .replace("spec", &desired.spec)
                .map_err(|e| ReconcileError::serialization(ObjectKind::CustomResourceDefinition, name, e))?
                .build();
            self.patch_object::<CustomResourceDefinition>(None, name, patch)
                .await?;
            info!(crd = %name, "enabled status subresource");
        }
        Ok(())
    }

    async fn sync_namespace_labels(&self) -> Result<(), ReconcileError> {
        let handle = &self.cluster.namespaces;
        let namespace = handle
            .store
            .get(None, &self.namespace)
            .ok_or_else(|| ReconcileError::MissingNamespace(self.namespace.clone()))?;

        let in_sync = namespace
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLUSTER_MONITORING_LABEL))
            .is_some_and(|v| v == "true");
        if in_sync {
            debug!(namespace = %self.namespace, "namespace labels are in sync");
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": { "labels": { CLUSTER_MONITORING_LABEL: "true" } }
        });
        handle
            .client
            .patch(None, &self.namespace, &PatchDocument::Merge(patch))
            .await
            .map_err(|e| ReconcileError::api("patch", ObjectKind::Namespace, &self.namespace, e))?;
        metrics::increment_object_writes(ObjectKind::Namespace.as_str(), "patch");
        info!(namespace = %self.namespace, "labelled namespace for cluster monitoring");
        Ok(())
    }

    /// Remove managed objects the strategy does not name
    ///
    /// Webhooks go first since a stale one can block the other deletions.
    async fn delete_objects_not_in_strategy(&self) -> Result<(), ReconcileError> {
        let s = Arc::clone(&self.strategy);
        self.delete_absent::<ValidatingWebhookConfiguration>(&s.validating_webhooks, is_tmp_webhook)
            .await?;
        self.delete_absent::<MutatingWebhookConfiguration>(&s.mutating_webhooks, |_| false)
            .await?;
        self.delete_absent::<APIService>(&s.api_services, |_| false)
            .await?;
        self.delete_absent::<Secret>(&s.secrets, |secret| {
            is_ca_name(secret.metadata.name.as_deref())
        })
        .await?;
        self.delete_absent::<ConfigMap>(&s.config_maps, |cm| {
            is_ca_name(cm.metadata.name.as_deref())
                || cm
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.contains_key(INSTALL_STRATEGY_LABEL))
        })
        .await?;
        self.delete_absent::<CustomResourceDefinition>(&s.crds, |_| false)
            .await?;
        self.delete_absent::<DaemonSet>(&s.daemon_sets, |_| false)
            .await?;
        self.delete_absent::<Deployment>(&s.deployments, |_| false)
            .await?;
        self.delete_absent::<Service>(&s.services, |_| false).await?;
        self.delete_absent::<ClusterRoleBinding>(&s.cluster_role_bindings, |_| false)
            .await?;
        self.delete_absent::<ClusterRole>(&s.cluster_roles, |_| false)
            .await?;
        self.delete_absent::<RoleBinding>(&s.role_bindings, |_| false)
            .await?;
        self.delete_absent::<Role>(&s.roles, |_| false).await?;
        self.delete_absent::<ServiceAccount>(&s.service_accounts, |_| false)
            .await?;
        self.delete_absent(&s.sccs, |_| false).await?;
        self.delete_absent(&s.prometheus_rules, |_| false).await?;
        self.delete_absent(&s.service_monitors, |_| false).await?;
        self.delete_absent(&s.routes, |_| false).await?;
        self.delete_absent::<PodDisruptionBudget>(&self.desired_pdbs(), |_| false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::fake::{FakeCluster, RecordedEvents};
    use crate::controller::pki::RcgenIssuer;
    use crate::crd::{KubeVirtSpec, KubeVirtStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn kubevirt() -> KubeVirt {
        let mut kv = KubeVirt::new("kubevirt", KubeVirtSpec::default());
        kv.metadata = ObjectMeta {
            name: Some("kubevirt".to_string()),
            namespace: Some("kubevirt".to_string()),
            uid: Some("kv-uid".to_string()),
            generation: Some(1),
            ..ObjectMeta::default()
        };
        kv.status = Some(KubeVirtStatus {
            target_kube_virt_version: Some("v1.1.0".to_string()),
            target_kube_virt_registry: Some("quay.io/kubevirt".to_string()),
            target_deployment_id: Some("abc123".to_string()),
            ..KubeVirtStatus::default()
        });
        kv
    }

    pub(crate) fn reconciler_with_events(
        fake: &FakeCluster,
        strategy: Arc<TargetStrategy>,
    ) -> (Reconciler, Arc<RecordedEvents>) {
        let events = Arc::new(RecordedEvents::default());
        let deps = Dependencies {
            cluster: fake.cluster(),
            expectations: Arc::new(Expectations::default()),
            recorder: Arc::clone(&events) as Arc<dyn EventRecorder>,
            issuer: Arc::new(RcgenIssuer),
            migrations: Vec::new(),
        };
        (Reconciler::new(kubevirt(), strategy, "kubevirt", &deps), events)
    }

    pub(crate) fn reconciler(fake: &FakeCluster, strategy: Arc<TargetStrategy>) -> Reconciler {
        reconciler_with_events(fake, strategy).0
    }

    #[test]
    fn test_should_take_update_path() {
        assert!(!should_take_update_path("v1.2.0", ""));
        assert!(should_take_update_path("v1.2.0", "v1.1.0"));
        assert!(!should_take_update_path("v1.1.0", "v1.2.0"));
        assert!(!should_take_update_path("v1.1.0", "v1.1.0"));
        assert!(should_take_update_path("devel", "v1.1.0"));
        assert!(should_take_update_path("1.2.0", "v1.1.9"));
    }

    #[test]
    fn test_status_subresource_is_withheld_until_rollout() {
        use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
            CustomResourceSubresourceStatus, CustomResourceSubresources,
        };
        let version = |status: bool| CustomResourceDefinitionVersion {
            name: "v1".to_string(),
            served: true,
            storage: true,
            subresources: Some(CustomResourceSubresources {
                status: status.then(|| CustomResourceSubresourceStatus(serde_json::json!({}))),
                ..CustomResourceSubresources::default()
            }),
            ..CustomResourceDefinitionVersion::default()
        };
        let crd = |status: bool| {
            let mut crd = CustomResourceDefinition::default();
            crd.spec.versions = vec![version(status)];
            crd
        };

        let cached = crd(false);
        let mut desired = crd(true);
        assert!(needs_status_subresource(&desired, &cached));
        withhold_status_subresource(&mut desired, &cached);
        assert!(status_missing(&desired.spec.versions[0]));

        assert!(!needs_status_subresource(&crd(true), &crd(true)));
    }
}
