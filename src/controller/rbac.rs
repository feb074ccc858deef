//! # RBAC Backups
//!
//! While an update is in flight the old control plane keeps running against
//! RBAC objects that are about to be rewritten. Each managed RBAC object that
//! still belongs to an older install strategy gets an ephemeral copy, stamped
//! with the version it came from, which the final cleanup removes.

use crate::constants::{
    EPHEMERAL_BACKUP_ANNOTATION, INSTALL_STRATEGY_IDENTIFIER_ANNOTATION,
    INSTALL_STRATEGY_REGISTRY_ANNOTATION, INSTALL_STRATEGY_VERSION_ANNOTATION,
};
use crate::controller::kinds::ManagedKind;
use crate::controller::reconciler::Reconciler;
use crate::controller::stamp::Stamp;
use crate::controller::syncer::name_of;
use crate::error::ReconcileError;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use tracing::info;

/// The stamp `meta` was written with, if it is a backup candidate
///
/// Objects already at `target`, unstamped objects and backups themselves
/// are never backed up.
fn backup_stamp(meta: &ObjectMeta, target: &Stamp) -> Option<Stamp> {
    if target.matches(meta) {
        return None;
    }
    let annotations = meta.annotations.as_ref()?;
    if annotations.contains_key(EPHEMERAL_BACKUP_ANNOTATION) {
        return None;
    }
    Some(Stamp {
        version: annotations.get(INSTALL_STRATEGY_VERSION_ANNOTATION)?.clone(),
        registry: annotations.get(INSTALL_STRATEGY_REGISTRY_ANNOTATION)?.clone(),
        id: annotations.get(INSTALL_STRATEGY_IDENTIFIER_ANNOTATION)?.clone(),
        ..target.clone()
    })
}

/// Whether no live backup of `uid` written with `stamp` exists yet
fn needs_backup<K: ManagedKind>(cached: &[Arc<K>], uid: &str, stamp: &Stamp) -> bool {
    !cached.iter().any(|obj| {
        let meta = obj.meta();
        meta.deletion_timestamp.is_none()
            && meta
                .annotations
                .as_ref()
                .and_then(|a| a.get(EPHEMERAL_BACKUP_ANNOTATION))
                .is_some_and(|backup_of| backup_of == uid)
            && stamp.matches(meta)
    })
}

impl Reconciler {
    pub(crate) async fn backup_rbac(&mut self) -> Result<(), ReconcileError> {
        self.backup_kind::<ClusterRole>().await?;
        self.backup_kind::<ClusterRoleBinding>().await?;
        self.backup_kind::<Role>().await?;
        self.backup_kind::<RoleBinding>().await
    }

    async fn backup_kind<K: ManagedKind>(&mut self) -> Result<(), ReconcileError> {
        let cached = K::handle(&self.cluster).store.list();
        for obj in &cached {
            let meta = obj.meta();
            let Some(stamp) = backup_stamp(meta, &self.stamp) else {
                continue;
            };
            let uid = meta.uid.clone().unwrap_or_default();
            if !needs_backup(&cached, &uid, &stamp) {
                continue;
            }

            let mut backup = obj.as_ref().clone();
            *backup.meta_mut() = ObjectMeta {
                generate_name: meta.name.clone(),
                namespace: meta.namespace.clone(),
                ..ObjectMeta::default()
            };
            stamp.apply(backup.meta_mut(), true);
            backup
                .meta_mut()
                .annotations
                .get_or_insert_with(Default::default)
                .insert(EPHEMERAL_BACKUP_ANNOTATION.to_string(), uid);

            self.create_object(&backup).await?;
            info!(kind = %K::KIND, name = %name_of(meta), "created backup");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::FakeCluster;
    use crate::controller::reconciler::tests::reconciler;
    use crate::controller::strategy::TargetStrategy;

    fn old_role(r: &Reconciler) -> ClusterRole {
        let mut role = ClusterRole {
            metadata: ObjectMeta {
                name: Some("kubevirt.io:operator".to_string()),
                ..ObjectMeta::default()
            },
            ..ClusterRole::default()
        };
        let old = Stamp {
            version: "v0.9.0".to_string(),
            ..r.stamp.clone()
        };
        old.apply(&mut role.metadata, true);
        role
    }

    #[tokio::test]
    async fn test_old_role_is_backed_up_once() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let seeded = fake.kind::<ClusterRole>().seed(old_role(&r));

        r.backup_rbac().await.unwrap();
        r.backup_rbac().await.unwrap();

        let roles = fake.kind::<ClusterRole>().objects();
        assert_eq!(roles.len(), 2);
        let backup = roles
            .iter()
            .find(|role| role.metadata.name != seeded.metadata.name)
            .unwrap();
        let annotations = backup.metadata.annotations.clone().unwrap();
        assert_eq!(
            annotations.get(EPHEMERAL_BACKUP_ANNOTATION),
            seeded.metadata.uid.as_ref()
        );
        assert_eq!(annotations[INSTALL_STRATEGY_VERSION_ANNOTATION], "v0.9.0");
        assert!(backup
            .metadata
            .name
            .as_deref()
            .unwrap()
            .starts_with("kubevirt.io:operator"));
    }

    #[tokio::test]
    async fn test_current_objects_are_not_backed_up() {
        let fake = FakeCluster::new();
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));
        let mut role = old_role(&r);
        r.stamp.apply(&mut role.metadata, true);
        fake.kind::<ClusterRole>().seed(role);
        fake.kind::<Role>().seed(Role {
            metadata: ObjectMeta {
                name: Some("unstamped".to_string()),
                namespace: Some("kubevirt".to_string()),
                ..ObjectMeta::default()
            },
            ..Role::default()
        });

        r.backup_rbac().await.unwrap();
        assert!(fake.calls.writes().is_empty());
    }
}
