//! # Control-plane Deployments
//!
//! Deployments get the infra placement and the optional replica override
//! before going through the generic syncer. API and controller deployments
//! with at least two replicas are covered by a pod disruption budget.

use crate::constants::{APP_LABEL, EXPORT_FEATURE_GATE, SYNCHRONIZATION_FEATURE_GATE};
use crate::controller::placement::inject_placement;
use crate::controller::reconciler::Reconciler;
use crate::controller::strategy::{DeploymentRole, TargetStrategy};
use crate::controller::syncer::name_of;
use crate::error::ReconcileError;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::EventType;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const ADVANCED_FEATURE_USE_REASON: &str = "AdvancedFeatureUse";

/// Name of the disruption budget guarding `deployment`
pub fn pdb_name(deployment: &Deployment) -> String {
    format!("{}-pdb", name_of(&deployment.metadata))
}

/// Disruption budget for `deployment`, or `None` below two replicas
pub fn pdb_for(deployment: &Deployment) -> Option<PodDisruptionBudget> {
    let spec = deployment.spec.as_ref()?;
    if spec.replicas.unwrap_or(1) < 2 {
        return None;
    }
    Some(PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(deployment)),
            namespace: deployment.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), String::new())])),
            ..ObjectMeta::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(spec.selector.clone()),
            ..PodDisruptionBudgetSpec::default()
        }),
        ..PodDisruptionBudget::default()
    })
}

/// Whether a role is installed for the current feature gates
pub(crate) fn role_enabled(kv: &crate::crd::KubeVirt, role: DeploymentRole) -> bool {
    match role {
        DeploymentRole::Api | DeploymentRole::Controller => true,
        DeploymentRole::ExportProxy => kv.feature_gate_enabled(EXPORT_FEATURE_GATE),
        DeploymentRole::Synchronization => kv.feature_gate_enabled(SYNCHRONIZATION_FEATURE_GATE),
    }
}

impl Reconciler {
    /// Strategy deployment with placement and replica override applied
    pub(crate) fn desired_deployment(&self, deployment: &Deployment) -> Deployment {
        let mut desired = deployment.clone();
        let role = TargetStrategy::deployment_role(deployment);
        if let Some(spec) = desired.spec.as_mut() {
            let template = &mut spec.template;
            self.stamp
                .apply(template.metadata.get_or_insert_with(Default::default), false);
            inject_placement(
                template.spec.get_or_insert_with(Default::default),
                self.kv.infra_placement(),
            );
            if matches!(role, DeploymentRole::Api | DeploymentRole::Controller) {
                if let Some(replicas) = self.kv.infra_replicas() {
                    spec.replicas = Some(replicas);
                }
            }
        }
        desired
    }

    /// Disruption budgets the strategy implies for the current configuration
    pub(crate) fn desired_pdbs(&self) -> Vec<PodDisruptionBudget> {
        self.strategy
            .deployments
            .iter()
            .filter(|d| role_enabled(&self.kv, TargetStrategy::deployment_role(d)))
            .map(|d| self.desired_deployment(d))
            .filter_map(|d| pdb_for(&d))
            .collect()
    }

    /// Sync one deployment and its disruption budget
    pub(crate) async fn sync_deployment(&mut self, deployment: &Deployment) -> Result<(), ReconcileError> {
        let desired = self.desired_deployment(deployment);
        let role = TargetStrategy::deployment_role(deployment);

        let requested = deployment.spec.as_ref().and_then(|s| s.replicas);
        let applied = desired.spec.as_ref().and_then(|s| s.replicas);
        let overridden =
            matches!(role, DeploymentRole::Api | DeploymentRole::Controller) && requested != applied;
        let live = if overridden {
            self.lookup::<Deployment>(desired.metadata.namespace.as_deref(), name_of(&desired.metadata))
                .await?
                .and_then(|d| d.spec.and_then(|s| s.replicas))
        } else {
            None
        };
        if overridden && live != applied {
            self.recorder
                .publish(
                    &self.kv,
                    EventType::Warning,
                    ADVANCED_FEATURE_USE_REASON,
                    "applying custom number of infra replicas; this overrides autoscaling of the API deployment",
                )
                .await;
        }

        let outcome = self.sync_object(&desired).await?;
        debug!(deployment = %name_of(&desired.metadata), ?outcome, "synced deployment");
        self.sync_pdb_for(&desired).await
    }

    async fn sync_pdb_for(&mut self, deployment: &Deployment) -> Result<(), ReconcileError> {
        match pdb_for(deployment) {
            Some(pdb) => {
                self.sync_object(&pdb).await?;
            }
            None => {
                let namespace = deployment.metadata.namespace.as_deref();
                if let Some(existing) = self
                    .lookup::<PodDisruptionBudget>(namespace, &pdb_name(deployment))
                    .await?
                {
                    if existing.metadata.deletion_timestamp.is_none() {
                        info!(pdb = %pdb_name(deployment), "too few replicas, removing disruption budget");
                        self.delete_object(&existing).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sync every strategy deployment with `role`
    pub(crate) async fn sync_deployments(&mut self, role: DeploymentRole) -> Result<(), ReconcileError> {
        let strategy = std::sync::Arc::clone(&self.strategy);
        for deployment in strategy.deployments_with_role(role) {
            self.sync_deployment(deployment).await?;
        }
        Ok(())
    }

    /// Sync gated deployments when their gate is on, delete them otherwise
    pub(crate) async fn sync_gated_deployments(&mut self) -> Result<(), ReconcileError> {
        for role in [DeploymentRole::ExportProxy, DeploymentRole::Synchronization] {
            if role_enabled(&self.kv, role) {
                self.sync_deployments(role).await?;
                continue;
            }
            let strategy = std::sync::Arc::clone(&self.strategy);
            for deployment in strategy.deployments_with_role(role) {
                let namespace = deployment.metadata.namespace.as_deref();
                let name = name_of(&deployment.metadata);
                if let Some(existing) = self.cluster.deployments.store.get(namespace, name) {
                    if existing.metadata.deletion_timestamp.is_none() {
                        info!(deployment = %name, "feature gate disabled, removing deployment");
                        self.delete_object(existing.as_ref()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Cached deployment is stamped with the target and has a ready replica
    pub(crate) fn deployment_ready(&self, deployment: &Deployment) -> bool {
        let Some(cached) = self.cluster.deployments.store.get(
            deployment.metadata.namespace.as_deref(),
            name_of(&deployment.metadata),
        ) else {
            return false;
        };
        self.stamp.matches(&cached.metadata)
            && cached
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or_default()
                > 0
    }

    /// Cached daemonset is stamped with the target and every scheduled pod
    /// is updated and ready
    pub(crate) fn daemon_set_ready(&self, daemon_set: &DaemonSet) -> bool {
        let Some(cached) = self.cluster.daemon_sets.store.get(
            daemon_set.metadata.namespace.as_deref(),
            name_of(&daemon_set.metadata),
        ) else {
            return false;
        };
        if !self.stamp.matches(&cached.metadata) {
            return false;
        }
        let Some(status) = cached.status.as_ref() else {
            return false;
        };
        let desired = status.desired_number_scheduled;
        status.number_ready == desired && status.updated_number_scheduled.unwrap_or_default() >= desired
    }

    /// Every deployment with `role` has rolled over; gated-off roles count as rolled
    pub(crate) fn deployments_rolled_over(&self, role: DeploymentRole) -> bool {
        if !role_enabled(&self.kv, role) {
            return true;
        }
        self.strategy
            .deployments_with_role(role)
            .into_iter()
            .all(|d| {
                let ready = self.deployment_ready(d);
                if !ready {
                    debug!(deployment = %name_of(&d.metadata), "waiting for deployment to roll over");
                }
                ready
            })
    }

    pub(crate) fn daemon_sets_rolled_over(&self) -> bool {
        self.strategy.daemon_sets.iter().all(|ds| {
            let ready = self.daemon_set_ready(ds);
            if !ready {
                debug!(daemonset = %name_of(&ds.metadata), "waiting for daemonset to roll over");
            }
            ready
        })
    }
}
