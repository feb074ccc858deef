//! # Security Context Constraints
//!
//! Once the new control plane is running under its own constraints, the
//! operator's service accounts are taken out of the shared `privileged` SCC.

use crate::constants::{
    API_SERVICE_ACCOUNT, CONTROLLER_SERVICE_ACCOUNT, HANDLER_SERVICE_ACCOUNT, PRIVILEGED_SCC_NAME,
};
use crate::controller::kinds::{ManagedKind, ObjectKind};
use crate::controller::patch::PatchBuilder;
use crate::controller::reconciler::Reconciler;
use crate::crd::SecurityContextConstraints;
use crate::error::ReconcileError;
use tracing::info;

/// Service account users the operator once granted `privileged`
pub fn privileged_users(namespace: &str) -> Vec<String> {
    [HANDLER_SERVICE_ACCOUNT, API_SERVICE_ACCOUNT, CONTROLLER_SERVICE_ACCOUNT]
        .iter()
        .map(|sa| format!("system:serviceaccount:{namespace}:{sa}"))
        .collect()
}

impl Reconciler {
    pub(crate) async fn remove_from_privileged_scc(&mut self) -> Result<(), ReconcileError> {
        let Some(scc) = SecurityContextConstraints::handle(&self.cluster)
            .store
            .get(None, PRIVILEGED_SCC_NAME)
        else {
            return Ok(());
        };

        let users = scc.users.clone().unwrap_or_default();
        let remove = privileged_users(&self.namespace);
        let kept: Vec<String> = users
            .iter()
            .filter(|user| !remove.contains(user))
            .cloned()
            .collect();
        if kept.len() == users.len() {
            return Ok(());
        }

        let ser = |e| {
            ReconcileError::serialization(ObjectKind::SecurityContextConstraints, PRIVILEGED_SCC_NAME, e)
        };
        let patch = PatchBuilder::new()
            .test("users", serde_json::to_value(&users).map_err(ser)?)
            .replace("users", &kept)
            .map_err(ser)?
            .build();
        self.patch_object::<SecurityContextConstraints>(None, PRIVILEGED_SCC_NAME, patch)
            .await?;
        info!(
            removed = users.len() - kept.len(),
            "removed service accounts from the privileged SCC"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::{FakeCluster, Verb};
    use crate::controller::reconciler::tests::reconciler;
    use crate::controller::strategy::TargetStrategy;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn privileged(users: Vec<String>) -> SecurityContextConstraints {
        SecurityContextConstraints {
            types: None,
            metadata: ObjectMeta {
                name: Some(PRIVILEGED_SCC_NAME.to_string()),
                ..ObjectMeta::default()
            },
            users: Some(users),
            fields: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_operator_accounts_are_removed() {
        let fake = FakeCluster::new();
        let mut users = privileged_users("kubevirt");
        users.push("system:admin".to_string());
        fake.kind::<SecurityContextConstraints>().seed(privileged(users));
        let mut r = reconciler(&fake, Arc::new(TargetStrategy::default()));

        r.remove_from_privileged_scc().await.unwrap();
        r.remove_from_privileged_scc().await.unwrap();

        let live = fake
            .kind::<SecurityContextConstraints>()
            .object(None, PRIVILEGED_SCC_NAME)
            .unwrap();
        assert_eq!(live.users, Some(vec!["system:admin".to_string()]));
        let verbs: Vec<Verb> = fake.calls.writes().iter().map(|c| c.verb).collect();
        assert_eq!(verbs, vec![Verb::Patch]);
    }
}
