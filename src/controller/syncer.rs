//! # Object Syncer
//!
//! Brings one desired object to the cluster: create it when absent, recreate
//! it when an immutable field moved, patch or replace it when its metadata,
//! body or generation drifted, and leave it alone otherwise. Also removes
//! managed objects that the install strategy no longer declares.

use crate::constants::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::controller::client::PatchDocument;
use crate::controller::kinds::{ManagedKind, WriteMode};
use crate::controller::patch::{metadata_needs_update, PatchBuilder};
use crate::controller::reconciler::Reconciler;
use crate::controller::store::object_key;
use crate::error::ReconcileError;
use crate::observability::metrics;
use json_patch::Patch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tracing::{debug, info};

/// Result of syncing one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    UpToDate,
    /// The live object was deleted so it can be created again next pass
    Recreating,
}

pub(crate) fn name_of(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

pub(crate) fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGED_BY_VALUE)
}

impl Reconciler {
    /// Copy of `desired` carrying the target stamp
    pub(crate) fn stamped<K: ManagedKind>(&self, desired: &K) -> K {
        let mut obj = desired.clone();
        self.stamp.apply(obj.meta_mut(), true);
        obj
    }

    /// Cached object, falling back to the API for kinds that allow it
    pub(crate) async fn lookup<K: ManagedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, ReconcileError> {
        let handle = K::handle(&self.cluster);
        if let Some(obj) = handle.store.get(namespace, name) {
            return Ok(Some((*obj).clone()));
        }
        if !K::LOOKUP_LIVE {
            return Ok(None);
        }
        handle
            .client
            .get(namespace, name)
            .await
            .map_err(|e| ReconcileError::api("get", K::KIND, name, e))
    }

    /// Create `obj`, expecting its creation to be observed
    pub(crate) async fn create_object<K: ManagedKind>(&mut self, obj: &K) -> Result<K, ReconcileError> {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        self.expectations.raise(K::KIND, &self.owner, 1, 0);
        match K::handle(&self.cluster).client.create(obj).await {
            Ok(created) => {
                metrics::increment_object_writes(K::KIND.as_str(), "create");
                if K::TRACK_GENERATION {
                    self.set_generation(&created);
                }
                info!(kind = %K::KIND, name = %name_of(created.meta()), "created object");
                Ok(created)
            }
            Err(e) => {
                self.expectations.lower(K::KIND, &self.owner, 1, 0);
                Err(ReconcileError::api("create", K::KIND, name, e))
            }
        }
    }

    /// Delete `obj`, expecting its deletion to be observed
    pub(crate) async fn delete_object<K: ManagedKind>(&self, obj: &K) -> Result<(), ReconcileError> {
        let meta = obj.meta();
        let key = object_key(obj);
        self.expectations
            .add_expected_deletion(K::KIND, &self.owner, &key);
        if let Err(e) = K::handle(&self.cluster)
            .client
            .delete(meta.namespace.as_deref(), name_of(meta))
            .await
        {
            self.expectations.deletion_observed(K::KIND, &self.owner, &key);
            return Err(ReconcileError::api("delete", K::KIND, name_of(meta), e));
        }
        metrics::increment_object_writes(K::KIND.as_str(), "delete");
        info!(kind = %K::KIND, %key, "deleted object");
        Ok(())
    }

    /// Apply a JSON patch and record the resulting generation
    pub(crate) async fn patch_object<K: ManagedKind>(
        &mut self,
        namespace: Option<&str>,
        name: &str,
        patch: Patch,
    ) -> Result<K, ReconcileError> {
        let patched = K::handle(&self.cluster)
            .client
            .patch(namespace, name, &PatchDocument::Json(patch))
            .await
            .map_err(|e| ReconcileError::api("patch", K::KIND, name, e))?;
        metrics::increment_object_writes(K::KIND.as_str(), "patch");
        if K::TRACK_GENERATION {
            self.set_generation(&patched);
        }
        debug!(kind = %K::KIND, name, "patched object");
        Ok(patched)
    }

    /// Drive one desired object to the cluster
    pub(crate) async fn sync_object<K: ManagedKind>(
        &mut self,
        desired: &K,
    ) -> Result<SyncOutcome, ReconcileError> {
        let mut desired = self.stamped(desired);
        let namespace = desired.meta().namespace.clone();
        let name = name_of(desired.meta()).to_string();

        let Some(cached) = self.lookup::<K>(namespace.as_deref(), &name).await? else {
            self.create_object(&desired).await?;
            return Ok(SyncOutcome::Created);
        };

        if K::immutable_changed(&desired, &cached) {
            if cached.meta().deletion_timestamp.is_none() {
                info!(kind = %K::KIND, %name, "immutable field changed, recreating");
                self.delete_object(&cached).await?;
            }
            return Ok(SyncOutcome::Recreating);
        }
        K::inherit(&mut desired, &cached);

        let meta_changed = metadata_needs_update(desired.meta(), cached.meta());
        let body_changed = !K::body_equal(&desired, &cached);
        let stamp_matches = self.stamp.matches(cached.meta());
        let generation_ok = !K::TRACK_GENERATION
            || self.expected_generation::<K>(namespace.as_deref(), &name)
                == cached.meta().generation;

        if !meta_changed && !body_changed && generation_ok && stamp_matches {
            return Ok(SyncOutcome::UpToDate);
        }

        match K::WRITE_MODE {
            WriteMode::Update => {
                desired
                    .meta_mut()
                    .resource_version
                    .clone_from(&cached.meta().resource_version);
                let updated = K::handle(&self.cluster)
                    .client
                    .update(&desired)
                    .await
                    .map_err(|e| ReconcileError::api("update", K::KIND, &name, e))?;
                metrics::increment_object_writes(K::KIND.as_str(), "update");
                if K::TRACK_GENERATION {
                    self.set_generation(&updated);
                }
                info!(kind = %K::KIND, %name, "updated object");
            }
            WriteMode::Patch => {
                let ser = |e| ReconcileError::serialization(K::KIND, &name, e);
                let mut builder = PatchBuilder::new();
                if K::TRACK_GENERATION {
                    builder = builder.test_generation(cached.meta().generation);
                }
                if meta_changed || !stamp_matches {
                    builder = builder.metadata(desired.meta()).map_err(ser)?;
                }
                if body_changed || !generation_ok {
                    builder = body_patch::<K>(builder, &desired, &cached).map_err(ser)?;
                }
                if builder.is_empty() {
                    if !generation_ok {
                        self.set_generation(&cached);
                    }
                    return Ok(SyncOutcome::UpToDate);
                }
                self.patch_object::<K>(namespace.as_deref(), &name, builder.build())
                    .await?;
                info!(kind = %K::KIND, %name, "patched object");
            }
        }
        Ok(SyncOutcome::Updated)
    }

    /// Sync every object, returning whether any of them is being recreated
    pub(crate) async fn sync_all<K: ManagedKind>(
        &mut self,
        desired: &[K],
    ) -> Result<bool, ReconcileError> {
        let mut recreating = false;
        for obj in desired {
            recreating |= self.sync_object(obj).await? == SyncOutcome::Recreating;
        }
        Ok(recreating)
    }

    /// Delete managed objects of kind `K` that `desired` does not name
    ///
    /// Objects already being deleted, and those `keep` returns true for, are
    /// left alone. A desired object without a namespace matches any namespace.
    pub(crate) async fn delete_absent<K: ManagedKind>(
        &self,
        desired: &[K],
        keep: impl Fn(&K) -> bool,
    ) -> Result<(), ReconcileError> {
        for obj in K::handle(&self.cluster).store.list() {
            let meta = obj.meta();
            if !is_managed(meta) || meta.deletion_timestamp.is_some() || keep(&obj) {
                continue;
            }
            let wanted = desired.iter().any(|d| {
                let want = d.meta();
                want.name == meta.name
                    && (want.namespace.is_none() || want.namespace == meta.namespace)
            });
            if !wanted {
                self.delete_object(obj.as_ref()).await?;
            }
        }
        Ok(())
    }
}

/// Replace the body field, or add it when the live object has none
fn body_patch<K: ManagedKind>(
    builder: PatchBuilder,
    desired: &K,
    cached: &K,
) -> Result<PatchBuilder, serde_json::Error> {
    let Some(field) = K::BODY_FIELD else {
        return Ok(builder);
    };
    let body = desired.body()?;
    if body.is_null() {
        return Ok(builder);
    }
    if cached.body()? == Value::Null {
        builder.insert(field, &body)
    } else {
        builder.replace(field, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{FakeCluster, Verb};
    use crate::controller::reconciler::tests::reconciler;
    use crate::controller::strategy::TargetStrategy;
    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceSpec};
    use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
    use std::sync::Arc;

    fn config_map(name: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([("key".to_string(), value.to_string())].into()),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_up_to_date() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let cm = config_map("a", "1");

        assert_eq!(r.sync_object(&cm).await.unwrap(), SyncOutcome::Created);
        assert_eq!(r.sync_object(&cm).await.unwrap(), SyncOutcome::UpToDate);
        assert_eq!(fake.calls.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_body_is_patched() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        r.sync_object(&config_map("a", "1")).await.unwrap();

        assert_eq!(
            r.sync_object(&config_map("a", "2")).await.unwrap(),
            SyncOutcome::Updated
        );
        let live = fake.kind::<ConfigMap>().object(Some("kubevirt"), "a").unwrap();
        assert_eq!(live.data.unwrap()["key"], "2");
    }

    #[tokio::test]
    async fn test_stale_stamp_rewrites_metadata() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        r.sync_object(&config_map("a", "1")).await.unwrap();
        r.stamp.version = "v2".to_string();

        assert_eq!(
            r.sync_object(&config_map("a", "1")).await.unwrap(),
            SyncOutcome::Updated
        );
        let live = fake.kind::<ConfigMap>().object(Some("kubevirt"), "a").unwrap();
        assert!(r.stamp.matches(&live.metadata));
    }

    #[tokio::test]
    async fn test_failed_create_lowers_expectations() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        fake.kind::<ConfigMap>().fail_next(Verb::Create, "quota exceeded");

        assert!(r.sync_object(&config_map("a", "1")).await.is_err());
        assert!(r.expectations.all_satisfied(&r.owner));
    }

    #[tokio::test]
    async fn test_service_type_change_is_recreated() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let mut live = Service {
            metadata: ObjectMeta {
                name: Some("virt-api".to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("10.0.0.1".to_string()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        fake.kind::<Service>().seed(live.clone());

        live.spec = Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            ..ServiceSpec::default()
        });
        assert_eq!(r.sync_object(&live).await.unwrap(), SyncOutcome::Recreating);
        assert!(fake.kind::<Service>().object(Some("kubevirt"), "virt-api").is_none());
        assert!(!r.expectations.all_satisfied(&r.owner));
    }

    #[tokio::test]
    async fn test_cluster_role_uses_update() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let role = |verbs: &[&str]| ClusterRole {
            metadata: ObjectMeta {
                name: Some("kubevirt.io:operator".to_string()),
                ..ObjectMeta::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: verbs.iter().map(ToString::to_string).collect(),
                ..PolicyRule::default()
            }]),
            ..ClusterRole::default()
        };
        r.sync_object(&role(&["get"])).await.unwrap();
        r.sync_object(&role(&["get", "list"])).await.unwrap();

        let verbs: Vec<Verb> = fake.calls.writes().iter().map(|c| c.verb).collect();
        assert_eq!(verbs, vec![Verb::Create, Verb::Update]);
    }

    #[tokio::test]
    async fn test_delete_absent_skips_unmanaged() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        r.sync_object(&config_map("keep", "1")).await.unwrap();
        r.sync_object(&config_map("stale", "1")).await.unwrap();
        fake.kind::<ConfigMap>().seed(config_map("foreign", "1"));

        r.delete_absent(&[config_map("keep", "1")], |_| false)
            .await
            .unwrap();

        let names: Vec<String> = fake
            .kind::<ConfigMap>()
            .objects()
            .into_iter()
            .filter_map(|cm| cm.metadata.name)
            .collect();
        assert_eq!(names, vec!["foreign".to_string(), "keep".to_string()]);
    }
}
