//! # Installation Controller
//!
//! Per-resource lifecycle around [`Reconciler::sync`]: target selection,
//! install strategy loading, phases and conditions, the deletion finalizer,
//! and the status write-back.
//!
//! Only one `KubeVirt` may exist, and only in the operator namespace. While
//! a previous pass still waits for the watch to observe its creates and
//! deletes, nothing is done.

use crate::config::OperatorConfig;
use crate::constants::{
    COMPONENT_FINALIZER, KUBEVIRT_FINALIZER, SYNCHRONIZATION_FEATURE_GATE, VIRT_SYNCHRONIZATION_NAME,
};
use crate::controller::client::PatchDocument;
use crate::controller::kinds::{ManagedKind, ObjectKind};
use crate::controller::queue::RequeueQueue;
use crate::controller::reconciler::status::{
    remove_condition, set_condition, set_created, set_degraded, set_deployed, set_failure,
    set_progressing, CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_FAILURE,
    CONDITION_PROGRESSING, REASON_DELETION_FAILED, REASON_DELETION_IN_PROGRESS,
    REASON_EXISTING_DEPLOYMENT,
};
use crate::controller::reconciler::{Dependencies, Reconciler};
use crate::controller::strategy::{DeploymentRole, StrategyCache, TargetStrategy};
use crate::controller::patch::PatchBuilder;
use crate::controller::syncer::{is_managed, name_of};
use crate::crd::{
    KubeVirt, KubeVirtPhase, KubeVirtStatus, PrometheusRule, Route, SecurityContextConstraints,
    ServiceMonitor, VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use crate::error::ReconcileError;
use crate::observability::metrics;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a missing install strategy is looked up again
const STRATEGY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Result of one lifecycle pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Writes from an earlier pass are not observed yet
    AwaitingObservations,
    /// Work remains; watch events or a requeue drive the next pass
    InProgress,
    /// Installed and ready, or fully removed
    Complete,
    /// Another resource already owns the installation
    Rejected,
}

/// Version, registry and configuration the resource asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub version: String,
    pub registry: String,
    /// Serialized configuration the deployment id is derived from
    pub config: String,
    pub id: String,
}

impl InstallTarget {
    pub fn for_kv(kv: &KubeVirt, defaults: &OperatorConfig) -> Self {
        let version = kv
            .spec
            .image_tag
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| defaults.image_tag.clone());
        let registry = kv
            .spec
            .image_registry
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| defaults.image_registry.clone());
        let config = serde_json::json!({
            "version": version,
            "registry": registry,
            "spec": kv.spec,
        })
        .to_string();
        let id = format!("{:x}", md5::compute(config.as_bytes()));
        Self {
            version,
            registry,
            config,
            id,
        }
    }
}

/// Drives one `KubeVirt` through install, update and removal
#[derive(Debug)]
pub struct InstallationController {
    deps: Dependencies,
    config: OperatorConfig,
    strategies: StrategyCache,
}

impl InstallationController {
    pub fn new(deps: Dependencies, config: OperatorConfig) -> Self {
        Self {
            deps,
            config,
            strategies: StrategyCache::new(),
        }
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }

    /// Reconcile the resource stored under `namespace/name`
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        queue: &dyn RequeueQueue,
    ) -> Result<Outcome, ReconcileError> {
        let key = format!("{namespace}/{name}");
        let Some(cached) = self.deps.cluster.kubevirts.store.get(Some(namespace), name) else {
            debug!(kubevirt = %key, "resource is gone, dropping expectations");
            self.deps.expectations.delete_owner(&key);
            return Ok(Outcome::Complete);
        };

        if !self.deps.expectations.all_satisfied(&key) {
            debug!(
                kubevirt = %key,
                pending = ?self.deps.expectations.unsatisfied_kinds(&key),
                "waiting for earlier writes to be observed"
            );
            return Ok(Outcome::AwaitingObservations);
        }

        let mut kv = (*cached).clone();
        let result = if kv.is_being_deleted() {
            self.sync_deletion(&mut kv).await
        } else {
            self.sync_installation(&mut kv, queue).await
        };

        self.write_status(&cached, &kv).await?;
        self.write_finalizers(&cached, &kv).await?;
        result
    }

    /// Another resource, or a resource outside the operator namespace
    fn conflicting_install(&self, kv: &KubeVirt) -> Option<String> {
        if kv.metadata.namespace.as_deref() != Some(self.config.namespace.as_str()) {
            return Some(format!(
                "KubeVirt must be created in namespace {}",
                self.config.namespace
            ));
        }
        let others = self
            .deps
            .cluster
            .kubevirts
            .store
            .list()
            .into_iter()
            .filter(|other| other.metadata.uid != kv.metadata.uid && is_active(other))
            .count();
        (others > 0).then(|| "an installation already exists".to_string())
    }

    async fn sync_installation(
        &self,
        kv: &mut KubeVirt,
        queue: &dyn RequeueQueue,
    ) -> Result<Outcome, ReconcileError> {
        if let Some(message) = self.conflicting_install(kv) {
            warn!(kubevirt = %kv.key(), %message, "refusing to install");
            let status = kv.status.get_or_insert_with(KubeVirtStatus::default);
            set_failure(status, REASON_EXISTING_DEPLOYMENT, &message);
            return Ok(Outcome::Rejected);
        }

        let key = kv.key();
        let target = InstallTarget::for_kv(kv, &self.config);
        let status = kv.status.get_or_insert_with(KubeVirtStatus::default);
        status.operator_version = Some(self.config.operator_version.clone());
        status.target_kube_virt_version = Some(target.version.clone());
        status.target_kube_virt_registry = Some(target.registry.clone());
        status.target_deployment_config = Some(target.config.clone());
        status.target_deployment_id = Some(target.id.clone());
        status.phase.get_or_insert(KubeVirtPhase::Deploying);

        let updating = status
            .observed_deployment_id
            .as_deref()
            .is_some_and(|observed| !observed.is_empty() && observed != target.id);
        if !is_settled(status, &target) {
            set_progressing(status, updating);
        }
        remove_condition(status, CONDITION_FAILURE);

        let strategy = match self.strategies.load(
            self.deps.cluster.install_strategies.as_ref(),
            &self.config.namespace,
            &target.version,
            &target.registry,
        ) {
            Ok(strategy) => strategy,
            Err(e) if e.is_transient() => {
                info!(version = %target.version, registry = %target.registry, "install strategy not available yet");
                queue.add_after(&key, STRATEGY_POLL_INTERVAL);
                return Ok(Outcome::InProgress);
            }
            Err(e) => {
                set_degraded(status, "StrategyError", &e.to_string());
                return Err(e.into());
            }
        };

        add_finalizer(kv);

        let mut reconciler = Reconciler::new(kv.clone(), strategy, &self.config.namespace, &self.deps);
        let result = reconciler.sync(queue).await;
        let ready = result.as_ref().is_ok_and(|done| *done) && all_ready(&reconciler);
        *kv = reconciler.into_kv();

        let synchronization_address = self.synchronization_address(kv);
        let generation = kv.metadata.generation;
        let status = kv.status.get_or_insert_with(KubeVirtStatus::default);
        status.synchronization_address = synchronization_address;

        match result {
            Err(e) => {
                warn!(error = %e, reason = e.reason(), "install pass failed");
                set_degraded(status, e.reason(), &e.to_string());
                Err(e)
            }
            Ok(false) => Ok(Outcome::InProgress),
            Ok(true) => {
                status.observed_kube_virt_version = Some(target.version.clone());
                status.observed_kube_virt_registry = Some(target.registry.clone());
                status.observed_deployment_config = Some(target.config.clone());
                status.observed_deployment_id = Some(target.id.clone());
                status.observed_generation = generation;
                set_created(status);
                if !ready {
                    return Ok(Outcome::InProgress);
                }
                if status.phase != Some(KubeVirtPhase::Deployed) {
                    info!(version = %target.version, "all components deployed");
                }
                status.phase = Some(KubeVirtPhase::Deployed);
                set_deployed(status);
                Ok(Outcome::Complete)
            }
        }
    }

    async fn sync_deletion(&self, kv: &mut KubeVirt) -> Result<Outcome, ReconcileError> {
        let reconciler = Reconciler::new(
            kv.clone(),
            Arc::new(TargetStrategy::default()),
            &self.config.namespace,
            &self.deps,
        );

        let status = kv.status.get_or_insert_with(KubeVirtStatus::default);
        if status.phase == Some(KubeVirtPhase::Deleted) {
            remove_finalizer(kv);
            return Ok(Outcome::Complete);
        }

        if reconciler.has_managed_objects() {
            status.phase = Some(KubeVirtPhase::Deleting);
            set_condition(status, CONDITION_AVAILABLE, false, REASON_DELETION_IN_PROGRESS, "Deleting KubeVirt");
            set_condition(status, CONDITION_PROGRESSING, true, REASON_DELETION_IN_PROGRESS, "Deleting KubeVirt");
            if let Err(e) = reconciler.delete_all().await {
                set_condition(status, CONDITION_DEGRADED, true, REASON_DELETION_FAILED, &e.to_string());
                return Err(e);
            }
            return Ok(Outcome::InProgress);
        }

        status.phase = Some(KubeVirtPhase::Deleted);
        info!(kubevirt = %kv.key(), "all managed objects removed");
        remove_finalizer(kv);
        Ok(Outcome::Complete)
    }

    /// Cluster IP of the synchronization service while its gate is on
    fn synchronization_address(&self, kv: &KubeVirt) -> Option<String> {
        if !kv.feature_gate_enabled(SYNCHRONIZATION_FEATURE_GATE) {
            return None;
        }
        self.deps
            .cluster
            .services
            .store
            .get(Some(&self.config.namespace), VIRT_SYNCHRONIZATION_NAME)
            .and_then(|svc| svc.spec.as_ref().and_then(|s| s.cluster_ip.clone()))
            .filter(|ip| !ip.is_empty() && ip != "None")
    }

    async fn write_status(&self, cached: &KubeVirt, kv: &KubeVirt) -> Result<(), ReconcileError> {
        if cached.status == kv.status {
            return Ok(());
        }
        let Some(status) = kv.status.as_ref() else {
            return Ok(());
        };
        let name = kv.metadata.name.as_deref().unwrap_or_default();
        let value = serde_json::to_value(status)
            .map_err(|e| ReconcileError::serialization(ObjectKind::KubeVirt, name, e))?;
        self.deps
            .cluster
            .kubevirts
            .client
            .patch_status(kv.metadata.namespace.as_deref(), name, &value)
            .await
            .map_err(|e| ReconcileError::api("patch status of", ObjectKind::KubeVirt, name, e))?;
        metrics::increment_object_writes(ObjectKind::KubeVirt.as_str(), "patch-status");
        debug!(kubevirt = %kv.key(), phase = ?status.phase, "status updated");
        Ok(())
    }

    async fn write_finalizers(&self, cached: &KubeVirt, kv: &KubeVirt) -> Result<(), ReconcileError> {
        if cached.metadata.finalizers == kv.metadata.finalizers {
            return Ok(());
        }
        let name = kv.metadata.name.as_deref().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": kv.metadata.finalizers.clone().unwrap_or_default(),
            }
        });
        self.deps
            .cluster
            .kubevirts
            .client
            .patch(kv.metadata.namespace.as_deref(), name, &PatchDocument::Merge(patch))
            .await
            .map_err(|e| ReconcileError::api("patch", ObjectKind::KubeVirt, name, e))?;
        metrics::increment_object_writes(ObjectKind::KubeVirt.as_str(), "patch");
        Ok(())
    }
}

/// Installed, or being installed, and not yet removed
fn is_active(kv: &KubeVirt) -> bool {
    kv.status
        .as_ref()
        .and_then(|s| s.phase)
        .is_some_and(|phase| phase != KubeVirtPhase::Deleted)
}

/// Already deployed at `target`; progress conditions would only flap
fn is_settled(status: &KubeVirtStatus, target: &InstallTarget) -> bool {
    status.phase == Some(KubeVirtPhase::Deployed)
        && status.observed_deployment_id.as_deref() == Some(target.id.as_str())
}

fn add_finalizer(kv: &mut KubeVirt) {
    let finalizers = kv.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == KUBEVIRT_FINALIZER) {
        finalizers.push(KUBEVIRT_FINALIZER.to_string());
    }
}

fn remove_finalizer(kv: &mut KubeVirt) {
    if let Some(finalizers) = kv.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != KUBEVIRT_FINALIZER);
    }
}

/// Every enabled deployment and every daemonset runs the target and is ready
fn all_ready(r: &Reconciler) -> bool {
    [
        DeploymentRole::Api,
        DeploymentRole::Controller,
        DeploymentRole::ExportProxy,
        DeploymentRole::Synchronization,
    ]
    .into_iter()
    .all(|role| r.deployments_rolled_over(role))
        && r.daemon_sets_rolled_over()
}

impl Reconciler {
    fn managed_count<K: ManagedKind>(&self) -> usize {
        K::handle(&self.cluster)
            .store
            .list()
            .iter()
            .filter(|obj| is_managed(obj.meta()))
            .count()
    }

    /// Whether anything the operator installed is still present
    pub(crate) fn has_managed_objects(&self) -> bool {
        let counts = [
            self.managed_count::<CustomResourceDefinition>(),
            self.managed_count::<DaemonSet>(),
            self.managed_count::<PodDisruptionBudget>(),
            self.managed_count::<Deployment>(),
            self.managed_count::<ValidatingWebhookConfiguration>(),
            self.managed_count::<MutatingWebhookConfiguration>(),
            self.managed_count::<APIService>(),
            self.managed_count::<Service>(),
            self.managed_count::<ServiceMonitor>(),
            self.managed_count::<PrometheusRule>(),
            self.managed_count::<Route>(),
            self.managed_count::<Secret>(),
            self.managed_count::<ConfigMap>(),
            self.managed_count::<ClusterRoleBinding>(),
            self.managed_count::<ClusterRole>(),
            self.managed_count::<RoleBinding>(),
            self.managed_count::<Role>(),
            self.managed_count::<ServiceAccount>(),
            self.managed_count::<SecurityContextConstraints>(),
            self.managed_count::<VirtualMachineClusterInstancetype>(),
            self.managed_count::<VirtualMachineClusterPreference>(),
        ];
        counts.iter().any(|count| *count > 0)
    }

    /// Delete every managed object
    ///
    /// Definitions go first and the rest of the control plane stays until
    /// they are gone, so the controllers can still finalize the remaining
    /// custom resources.
    pub(crate) async fn delete_all(&self) -> Result<(), ReconcileError> {
        if !self.delete_crds().await? {
            debug!("waiting for definitions to be removed");
            return Ok(());
        }
        fn none<K>(_: &K) -> bool {
            false
        }
        self.delete_absent::<DaemonSet>(&[], none).await?;
        self.delete_absent::<PodDisruptionBudget>(&[], none).await?;
        self.delete_absent::<Deployment>(&[], none).await?;
        self.delete_absent::<ValidatingWebhookConfiguration>(&[], none).await?;
        self.delete_absent::<MutatingWebhookConfiguration>(&[], none).await?;
        self.delete_absent::<APIService>(&[], none).await?;
        self.delete_absent::<Service>(&[], none).await?;
        self.delete_absent::<ServiceMonitor>(&[], none).await?;
        self.delete_absent::<PrometheusRule>(&[], none).await?;
        self.delete_absent::<Route>(&[], none).await?;
        self.delete_absent::<Secret>(&[], none).await?;
        self.delete_absent::<ConfigMap>(&[], none).await?;
        self.delete_absent::<ClusterRoleBinding>(&[], none).await?;
        self.delete_absent::<ClusterRole>(&[], none).await?;
        self.delete_absent::<RoleBinding>(&[], none).await?;
        self.delete_absent::<Role>(&[], none).await?;
        self.delete_absent::<ServiceAccount>(&[], none).await?;
        self.delete_absent::<SecurityContextConstraints>(&[], none).await?;
        self.delete_absent::<VirtualMachineClusterInstancetype>(&[], none).await?;
        self.delete_absent::<VirtualMachineClusterPreference>(&[], none).await?;
        Ok(())
    }

    /// Finalize, delete and release the managed definitions
    ///
    /// Returns whether none are left in the cache.
    async fn delete_crds(&self) -> Result<bool, ReconcileError> {
        let crds: Vec<_> = self
            .cluster
            .crds
            .store
            .list()
            .into_iter()
            .filter(|crd| is_managed(&crd.metadata))
            .collect();
        if crds.is_empty() {
            return Ok(true);
        }

        for crd in crds.iter().filter(|crd| crd.metadata.deletion_timestamp.is_none()) {
            let finalizers = crd.metadata.finalizers.clone().unwrap_or_default();
            if !finalizers.iter().any(|f| f == COMPONENT_FINALIZER) {
                let mut with_ours = finalizers;
                with_ours.push(COMPONENT_FINALIZER.to_string());
                let patch = PatchBuilder::new().finalizers(&with_ours).build();
                self.patch_crd(crd, patch).await?;
            }
            self.delete_object(crd.as_ref()).await?;
        }

        // no definition is released before every one of them is empty
        if crds.iter().all(|crd| instance_deletion_completed(crd)) {
            for crd in &crds {
                let finalizers = crd.metadata.finalizers.clone().unwrap_or_default();
                if !finalizers.iter().any(|f| f == COMPONENT_FINALIZER) {
                    continue;
                }
                let remaining: Vec<String> = finalizers
                    .iter()
                    .filter(|f| *f != COMPONENT_FINALIZER)
                    .cloned()
                    .collect();
                let patch = PatchBuilder::new()
                    .test_finalizers(&finalizers)
                    .finalizers(&remaining)
                    .build();
                self.patch_crd(crd, patch).await?;
                info!(crd = %name_of(&crd.metadata), "released definition");
            }
        }

        Ok(!self
            .cluster
            .crds
            .store
            .list()
            .iter()
            .any(|crd| is_managed(&crd.metadata)))
    }

    async fn patch_crd(&self, crd: &CustomResourceDefinition, patch: json_patch::Patch) -> Result<(), ReconcileError> {
        let name = name_of(&crd.metadata);
        self.cluster
            .crds
            .client
            .patch(None, name, &PatchDocument::Json(patch))
            .await
            .map_err(|e| ReconcileError::api("patch", ObjectKind::CustomResourceDefinition, name, e))?;
        metrics::increment_object_writes(ObjectKind::CustomResourceDefinition.as_str(), "patch");
        Ok(())
    }
}

/// Terminating definition whose custom resources are all gone
fn instance_deletion_completed(crd: &CustomResourceDefinition) -> bool {
    crd.metadata.deletion_timestamp.is_some()
        && crd
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c.type_ == "Terminating"
                        && c.status == "False"
                        && c.reason.as_deref() == Some("InstanceDeletionCompleted")
                })
            })
}
