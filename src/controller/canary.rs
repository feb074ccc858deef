//! # DaemonSet Canary Rollout
//!
//! Node daemonsets are upgraded one node first. The new template goes out
//! with `maxUnavailable: 1`; once a pod of the target version is ready the
//! rollout widens to 10% of the nodes, and when every scheduled pod is
//! updated and ready the strategy is put back to a single node and the
//! generation is recorded.
//!
//! A canary pod that restarts without becoming ready fails the rollout with a
//! Warning event. The pass is retried with backoff so a fixed image resumes
//! the rollout without operator intervention.

use crate::constants::{
    CANARY_MAX_UNAVAILABLE, INSTALL_STRATEGY_VERSION_ANNOTATION, ROLLOUT_MAX_UNAVAILABLE,
};
use crate::controller::client::PatchDocument;
use crate::controller::cluster::Cluster;
use crate::controller::kinds::ObjectKind;
use crate::controller::patch::{metadata_needs_update, PatchBuilder};
use crate::controller::placement::inject_placement;
use crate::controller::reconciler::Reconciler;
use crate::controller::syncer::name_of;
use crate::crd::CanaryUpgradeStatus;
use crate::error::ReconcileError;
use crate::observability::metrics;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetUpdateStrategy, RollingUpdateDaemonSet};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::EventType;
use std::fmt::Debug;
use tracing::{info, warn};

/// Work that must run once a daemonset has fully rolled out
#[async_trait]
pub trait DaemonSetMigration: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn run(&self, cluster: &Cluster, daemon_set: &DaemonSet) -> Result<(), ReconcileError>;
}

fn max_unavailable(ds: &DaemonSet) -> Option<&IntOrString> {
    ds.spec
        .as_ref()?
        .update_strategy
        .as_ref()?
        .rolling_update
        .as_ref()?
        .max_unavailable
        .as_ref()
}

fn is_canary_strategy(ds: &DaemonSet) -> bool {
    max_unavailable(ds) == Some(&IntOrString::Int(CANARY_MAX_UNAVAILABLE))
}

fn set_max_unavailable(ds: &mut DaemonSet, value: IntOrString) {
    let spec = ds.spec.get_or_insert_with(Default::default);
    let strategy = spec
        .update_strategy
        .get_or_insert_with(DaemonSetUpdateStrategy::default);
    strategy.type_ = Some("RollingUpdate".to_string());
    strategy
        .rolling_update
        .get_or_insert_with(RollingUpdateDaemonSet::default)
        .max_unavailable = Some(value);
}

/// Whether the containers of `cached` differ from `desired` in a field a
/// rollout must carry
pub fn spec_drifted(desired: Option<&PodSpec>, cached: Option<&PodSpec>) -> bool {
    let empty = PodSpec::default();
    let desired = desired.unwrap_or(&empty);
    let cached = cached.unwrap_or(&empty);
    containers_drifted(&desired.containers, &cached.containers)
        || containers_drifted(
            desired.init_containers.as_deref().unwrap_or_default(),
            cached.init_containers.as_deref().unwrap_or_default(),
        )
}

fn containers_drifted(desired: &[Container], cached: &[Container]) -> bool {
    if desired.len() != cached.len() {
        return true;
    }
    desired.iter().any(|want| {
        let Some(have) = cached.iter().find(|c| c.name == want.name) else {
            return true;
        };
        want.image != have.image
            || want.command != have.command
            || want.resources.clone().unwrap_or_default() != have.resources.clone().unwrap_or_default()
            || want.volume_mounts.as_deref().unwrap_or_default()
                != have.volume_mounts.as_deref().unwrap_or_default()
            || want.security_context != have.security_context
            || want.env.as_deref().unwrap_or_default() != have.env.as_deref().unwrap_or_default()
    })
}

fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let statuses = status.container_statuses.as_deref().unwrap_or_default();
    status.phase.as_deref() == Some("Running")
        && !statuses.is_empty()
        && statuses.iter().all(|c| c.ready)
}

fn pod_crash_looping(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default()
        .iter()
        .any(|c| c.restart_count > 0 && !c.ready)
}

impl Reconciler {
    /// Strategy daemonset with the workloads placement and a stamped template
    pub(crate) fn desired_daemon_set(&self, daemon_set: &DaemonSet) -> DaemonSet {
        let mut desired = self.stamped(daemon_set);
        if let Some(spec) = desired.spec.as_mut() {
            let template = &mut spec.template;
            self.stamp
                .apply(template.metadata.get_or_insert_with(Default::default), false);
            inject_placement(
                template.spec.get_or_insert_with(Default::default),
                self.kv.workloads_placement(),
            );
        }
        desired
    }

    /// Pods of `cached` running the target version
    fn canary_pods(&self, cached: &DaemonSet) -> Vec<Pod> {
        let uid = cached.metadata.uid.as_deref();
        self.cluster
            .pods
            .list()
            .into_iter()
            .filter(|pod| {
                pod.metadata.namespace == cached.metadata.namespace
                    && pod
                        .metadata
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|owner| Some(owner.uid.as_str()) == uid)
                    && pod
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(INSTALL_STRATEGY_VERSION_ANNOTATION))
                        == Some(&self.stamp.version)
            })
            .map(|pod| (*pod).clone())
            .collect()
    }

    fn updated_and_ready_pods(&self, cached: &DaemonSet) -> i32 {
        let ready = self
            .canary_pods(cached)
            .iter()
            .filter(|pod| pod_ready(pod))
            .count();
        let ready = i32::try_from(ready).unwrap_or(i32::MAX);
        let status = cached.status.clone().unwrap_or_default();
        ready
            .min(status.updated_number_scheduled.unwrap_or_default())
            .min(status.desired_number_scheduled)
    }

    /// Patch `cached` towards `desired` without recording a generation
    async fn patch_daemon_set(&self, cached: &DaemonSet, desired: &DaemonSet) -> Result<DaemonSet, ReconcileError> {
        let name = name_of(&desired.metadata);
        let ser = |e| ReconcileError::serialization(ObjectKind::DaemonSet, name, e);
        let patch = PatchBuilder::new()
            .test_generation(cached.metadata.generation)
            .metadata(&desired.metadata)
            .map_err(ser)?
            .replace("spec", &desired.spec)
            .map_err(ser)?
            .build();
        let patched = self
            .cluster
            .daemon_sets
            .client
            .patch(
                desired.metadata.namespace.as_deref(),
                name,
                &PatchDocument::Json(patch),
            )
            .await
            .map_err(|e| ReconcileError::api("patch", ObjectKind::DaemonSet, name, e))?;
        metrics::increment_object_writes(ObjectKind::DaemonSet.as_str(), "patch");
        Ok(patched)
    }

    fn set_canary_status(&mut self, status: CanaryUpgradeStatus) {
        self.kv
            .status
            .get_or_insert_with(Default::default)
            .canary_upgrade_status = Some(status);
        metrics::set_canary_state(&self.kv.key(), status);
    }

    /// Drive one daemonset towards the target; `true` once fully rolled out
    pub(crate) async fn sync_daemon_set(&mut self, daemon_set: &DaemonSet) -> Result<bool, ReconcileError> {
        let desired = self.desired_daemon_set(daemon_set);
        let namespace = desired.metadata.namespace.clone();
        let name = name_of(&desired.metadata).to_string();

        let Some(cached) = self.lookup::<DaemonSet>(namespace.as_deref(), &name).await? else {
            self.create_object(&desired).await?;
            return Ok(true);
        };

        let meta_changed = metadata_needs_update(&desired.metadata, &cached.metadata);
        let expected = self.expected_generation::<DaemonSet>(namespace.as_deref(), &name);
        if !meta_changed && expected.is_some() && expected == cached.metadata.generation {
            return Ok(true);
        }

        let (done, status) = self.process_canary(&cached, desired).await?;
        self.set_canary_status(status);
        Ok(done)
    }

    async fn process_canary(
        &mut self,
        cached: &DaemonSet,
        mut desired: DaemonSet,
    ) -> Result<(bool, CanaryUpgradeStatus), ReconcileError> {
        let name = name_of(&cached.metadata).to_string();
        let drifted = spec_drifted(
            desired.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
            cached.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
        );
        let stamped = self.stamp.matches(&cached.metadata)
            && !metadata_needs_update(&desired.metadata, &cached.metadata);
        if stamped && drifted {
            warn!(daemonset = %name, "daemonset spec drifted from the install strategy, reverting");
        }

        if !stamped || drifted {
            set_max_unavailable(&mut desired, IntOrString::Int(CANARY_MAX_UNAVAILABLE));
            self.patch_daemon_set(cached, &desired).await?;
            info!(daemonset = %name, "started canary upgrade");
            return Ok((false, CanaryUpgradeStatus::Started));
        }

        let desired_pods = cached
            .status
            .as_ref()
            .map(|s| s.desired_number_scheduled)
            .unwrap_or_default();
        let ready = self.updated_and_ready_pods(cached);

        if ready == 0 && desired_pods > 0 {
            if self.canary_pods(cached).iter().any(pod_crash_looping) {
                self.set_canary_status(CanaryUpgradeStatus::Failed);
                let message = format!("daemonset {name} rollout failed");
                self.recorder
                    .publish(&self.kv, EventType::Warning, "RolloutFailed", &message)
                    .await;
                return Err(ReconcileError::RolloutFailed {
                    name,
                    reason: "canary pod is crash looping".to_string(),
                });
            }
            return Ok((false, CanaryUpgradeStatus::Started));
        }

        if ready < desired_pods {
            if is_canary_strategy(cached) {
                set_max_unavailable(
                    &mut desired,
                    IntOrString::String(ROLLOUT_MAX_UNAVAILABLE.to_string()),
                );
                self.patch_daemon_set(cached, &desired).await?;
                info!(daemonset = %name, ready, desired = desired_pods, "canary ready, widening rollout");
                return Ok((false, CanaryUpgradeStatus::UpgradingDaemonSet));
            }
            info!(daemonset = %name, ready, desired = desired_pods, "waiting for daemonset rollout");
            return Ok((false, CanaryUpgradeStatus::WaitingDaemonSetRollout));
        }

        if !is_canary_strategy(cached) {
            set_max_unavailable(&mut desired, IntOrString::Int(CANARY_MAX_UNAVAILABLE));
            self.patch_daemon_set(cached, &desired).await?;
            return Ok((false, CanaryUpgradeStatus::WaitingDaemonSetRollout));
        }

        for migration in self.migrations.clone() {
            info!(daemonset = %name, migration = migration.name(), "running post-rollout migration");
            migration.run(&self.cluster, cached).await?;
        }
        self.set_generation(cached);
        info!(daemonset = %name, "daemonset rolled out");
        Ok((true, CanaryUpgradeStatus::Successful))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{FakeCluster, Verb};
    use crate::controller::reconciler::tests::{reconciler, reconciler_with_events};
    use crate::controller::strategy::TargetStrategy;
    use k8s_openapi::api::apps::v1::{DaemonSetSpec, DaemonSetStatus};
    use k8s_openapi::api::core::v1::{ContainerStatus, EnvVar, PodStatus, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::Arc;

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Container::default()
        }
    }

    fn pod_spec(containers: Vec<Container>) -> PodSpec {
        PodSpec {
            containers,
            ..PodSpec::default()
        }
    }

    #[test]
    fn test_drift_is_keyed_by_container_name() {
        let a = pod_spec(vec![container("handler", "v1"), container("sidecar", "v1")]);
        let reordered = pod_spec(vec![container("sidecar", "v1"), container("handler", "v1")]);
        assert!(!spec_drifted(Some(&a), Some(&reordered)));

        let new_image = pod_spec(vec![container("handler", "v2"), container("sidecar", "v1")]);
        assert!(spec_drifted(Some(&a), Some(&new_image)));
    }

    #[test]
    fn test_drift_ignores_args_but_not_env() {
        let base = pod_spec(vec![container("handler", "v1")]);
        let mut with_args = base.clone();
        with_args.containers[0].args = Some(vec!["--verbose".to_string()]);
        assert!(!spec_drifted(Some(&base), Some(&with_args)));

        let mut with_env = base.clone();
        with_env.containers[0].env = Some(vec![EnvVar {
            name: "DEBUG".to_string(),
            value: Some("1".to_string()),
            ..EnvVar::default()
        }]);
        assert!(spec_drifted(Some(&base), Some(&with_env)));
    }

    #[test]
    fn test_max_unavailable_helpers() {
        let mut ds = DaemonSet::default();
        assert!(!is_canary_strategy(&ds));
        set_max_unavailable(&mut ds, IntOrString::Int(1));
        assert!(is_canary_strategy(&ds));
        set_max_unavailable(&mut ds, IntOrString::String("10%".to_string()));
        assert_eq!(
            max_unavailable(&ds),
            Some(&IntOrString::String("10%".to_string()))
        );
    }

    fn handler(image: &str) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some("virt-handler".to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(pod_spec(vec![container("virt-handler", image)])),
                },
                ..DaemonSetSpec::default()
            }),
            ..DaemonSet::default()
        }
    }

    const TARGET_IMAGE: &str = "quay.io/kubevirt/virt-handler:v1.1.0";

    fn rollout_status(desired: i32, updated: i32) -> DaemonSetStatus {
        DaemonSetStatus {
            desired_number_scheduled: desired,
            updated_number_scheduled: Some(updated),
            ..DaemonSetStatus::default()
        }
    }

    fn handler_pod(name: &str, owner_uid: &str, ready: bool, restarts: i32) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubevirt".to_string()),
                annotations: Some(
                    [(INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), "v1.1.0".to_string())].into(),
                ),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "DaemonSet".to_string(),
                    name: "virt-handler".to_string(),
                    uid: owner_uid.to_string(),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "virt-handler".to_string(),
                    ready,
                    restart_count: restarts,
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    /// Seed the cached daemonset as the target template with `strategy` and `status`
    fn seed_current(
        fake: &FakeCluster,
        r: &Reconciler,
        strategy: Option<IntOrString>,
        status: DaemonSetStatus,
    ) -> DaemonSet {
        let mut cached = r.desired_daemon_set(&handler(TARGET_IMAGE));
        if let Some(value) = strategy {
            set_max_unavailable(&mut cached, value);
        }
        cached.status = Some(status);
        fake.kind::<DaemonSet>().seed(cached)
    }

    fn patched_max_unavailable(fake: &FakeCluster) -> Option<IntOrString> {
        fake.kind::<DaemonSet>()
            .object(Some("kubevirt"), "virt-handler")
            .as_ref()
            .and_then(max_unavailable)
            .cloned()
    }

    #[tokio::test]
    async fn test_fresh_install_creates_with_default_strategy() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();

        assert!(done);
        let writes = fake.calls.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].verb, Verb::Create);
        assert_eq!(patched_max_unavailable(&fake), None);
    }

    #[tokio::test]
    async fn test_rolled_out_daemon_set_is_left_alone() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let cached = seed_current(&fake, &r, Some(IntOrString::Int(1)), rollout_status(2, 2));
        r.set_generation(&cached);

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();

        assert!(done);
        assert!(fake.calls.all().is_empty());
    }

    #[tokio::test]
    async fn test_new_version_starts_single_pod_canary() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let mut old = r.desired_daemon_set(&handler("quay.io/kubevirt/virt-handler:v1.0.0"));
        old.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), "v1.0.0".to_string());
        old.status = Some(rollout_status(2, 0));
        fake.kind::<DaemonSet>().seed(old);

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();

        assert!(!done);
        assert_eq!(fake.calls.writes().len(), 1);
        assert_eq!(fake.calls.writes()[0].verb, Verb::Patch);
        assert_eq!(patched_max_unavailable(&fake), Some(IntOrString::Int(1)));
        let status = r.kv().status.as_ref().and_then(|s| s.canary_upgrade_status);
        assert_eq!(status, Some(CanaryUpgradeStatus::Started));
    }

    #[tokio::test]
    async fn test_ready_canary_widens_rollout() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let cached = seed_current(&fake, &r, Some(IntOrString::Int(1)), rollout_status(2, 1));
        let uid = cached.metadata.uid.clone().unwrap_or_default();
        fake.kind::<Pod>().seed(handler_pod("virt-handler-a", &uid, true, 0));

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();

        assert!(!done);
        assert_eq!(fake.calls.writes().len(), 1);
        assert_eq!(
            patched_max_unavailable(&fake),
            Some(IntOrString::String("10%".to_string()))
        );
        let status = r.kv().status.as_ref().and_then(|s| s.canary_upgrade_status);
        assert_eq!(status, Some(CanaryUpgradeStatus::UpgradingDaemonSet));
    }

    #[tokio::test]
    async fn test_completed_rollout_reverts_strategy_then_succeeds() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let cached = seed_current(
            &fake,
            &r,
            Some(IntOrString::String("10%".to_string())),
            rollout_status(2, 2),
        );
        let uid = cached.metadata.uid.clone().unwrap_or_default();
        fake.kind::<Pod>().seed(handler_pod("virt-handler-a", &uid, true, 0));
        fake.kind::<Pod>().seed(handler_pod("virt-handler-b", &uid, true, 0));

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();
        assert!(!done);
        assert_eq!(fake.calls.writes().len(), 1);
        assert_eq!(patched_max_unavailable(&fake), Some(IntOrString::Int(1)));
        let status = r.kv().status.as_ref().and_then(|s| s.canary_upgrade_status);
        assert_eq!(status, Some(CanaryUpgradeStatus::WaitingDaemonSetRollout));

        fake.calls.clear();
        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();
        assert!(done);
        assert!(fake.calls.writes().is_empty());
        let status = r.kv().status.as_ref().and_then(|s| s.canary_upgrade_status);
        assert_eq!(status, Some(CanaryUpgradeStatus::Successful));

        // the recorded generation now short-circuits the next pass
        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();
        assert!(done);
        assert!(fake.calls.writes().is_empty());
    }

    #[tokio::test]
    async fn test_crash_looping_canary_fails_rollout() {
        let fake = FakeCluster::new();
        let (mut r, events) = reconciler_with_events(&fake, Arc::new(TargetStrategy::default()));
        let cached = seed_current(&fake, &r, Some(IntOrString::Int(1)), rollout_status(2, 1));
        let uid = cached.metadata.uid.clone().unwrap_or_default();
        fake.kind::<Pod>().seed(handler_pod("virt-handler-a", &uid, false, 3));

        let err = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap_err();

        assert!(matches!(err, ReconcileError::RolloutFailed { .. }));
        let status = r.kv().status.as_ref().and_then(|s| s.canary_upgrade_status);
        assert_eq!(status, Some(CanaryUpgradeStatus::Failed));
        assert_eq!(events.with_reason("RolloutFailed").len(), 1);
        assert!(fake.calls.writes().is_empty());
    }

    #[tokio::test]
    async fn test_manual_container_edit_is_reverted() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let mut cached = r.desired_daemon_set(&handler(TARGET_IMAGE));
        if let Some(spec) = cached.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            spec.containers[0].image = Some("example.com/patched:latest".to_string());
        }
        cached.status = Some(rollout_status(2, 2));
        fake.kind::<DaemonSet>().seed(cached);

        let done = r.sync_daemon_set(&handler(TARGET_IMAGE)).await.unwrap();

        assert!(!done);
        let live = fake.kind::<DaemonSet>().object(Some("kubevirt"), "virt-handler").unwrap();
        let image = live.spec.unwrap().template.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some(TARGET_IMAGE));
    }
}
