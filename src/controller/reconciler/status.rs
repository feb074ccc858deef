//! # Status Management
//!
//! In-memory updates to the managed resource's status during a pass: the
//! generations recorded for tracked objects and the install conditions.
//! The status is written back once, by the installation controller, and only
//! when it actually changed.

use crate::controller::reconciler::Reconciler;
use crate::crd::{Condition, GenerationStatus, KubeVirtStatus};
use kube::Resource;

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_CREATED: &str = "Created";
pub const CONDITION_FAILURE: &str = "Failure";

pub const REASON_DEPLOYMENT_IN_PROGRESS: &str = "DeploymentInProgress";
pub const REASON_UPDATE_IN_PROGRESS: &str = "UpdateInProgress";
pub const REASON_ALL_RESOURCES_CREATED: &str = "AllResourcesCreated";
pub const REASON_ALL_RESOURCES_DEPLOYED: &str = "AllResourcesDeployed";
pub const REASON_EXISTING_DEPLOYMENT: &str = "ExistingDeployment";
pub const REASON_DELETION_IN_PROGRESS: &str = "DeletionInProgress";
pub const REASON_DELETION_FAILED: &str = "DeletionFailed";

fn status_str(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Set condition `type_`, keeping the transition time unless the status flips
///
/// Returns whether anything changed.
pub fn set_condition(
    status: &mut KubeVirtStatus,
    type_: &str,
    value: bool,
    reason: &str,
    message: &str,
) -> bool {
    let value = status_str(value);
    let now = chrono::Utc::now().to_rfc3339();

    if let Some(existing) = status.conditions.iter_mut().find(|c| c.r#type == type_) {
        let unchanged = existing.status == value
            && existing.reason.as_deref() == Some(reason)
            && existing.message.as_deref() == Some(message);
        if unchanged {
            return false;
        }
        if existing.status != value {
            existing.last_transition_time = Some(now.clone());
        }
        existing.status = value.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        existing.last_checked_time = Some(now);
        return true;
    }

    status.conditions.push(Condition {
        r#type: type_.to_string(),
        status: value.to_string(),
        last_checked_time: Some(now.clone()),
        last_transition_time: Some(now),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
    true
}

pub fn remove_condition(status: &mut KubeVirtStatus, type_: &str) {
    status.conditions.retain(|c| c.r#type != type_);
}

pub fn condition_is_true(status: &KubeVirtStatus, type_: &str) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.r#type == type_ && c.status == "True")
}

/// Available/Progressing/Degraded while objects are still rolling out
pub fn set_progressing(status: &mut KubeVirtStatus, updating: bool) {
    let (reason, message) = if updating {
        (REASON_UPDATE_IN_PROGRESS, "Updating KubeVirt")
    } else {
        (REASON_DEPLOYMENT_IN_PROGRESS, "Deploying KubeVirt")
    };
    set_condition(status, CONDITION_AVAILABLE, false, reason, message);
    set_condition(status, CONDITION_PROGRESSING, true, reason, message);
    set_condition(status, CONDITION_DEGRADED, false, reason, message);
}

pub fn set_deployed(status: &mut KubeVirtStatus) {
    let message = "All components are ready.";
    let reason = REASON_ALL_RESOURCES_DEPLOYED;
    set_condition(status, CONDITION_AVAILABLE, true, reason, message);
    set_condition(status, CONDITION_PROGRESSING, false, reason, message);
    set_condition(status, CONDITION_DEGRADED, false, reason, message);
}

pub fn set_created(status: &mut KubeVirtStatus) {
    set_condition(
        status,
        CONDITION_CREATED,
        true,
        REASON_ALL_RESOURCES_CREATED,
        "All resources were created.",
    );
}

pub fn set_degraded(status: &mut KubeVirtStatus, reason: &str, message: &str) {
    set_condition(status, CONDITION_DEGRADED, true, reason, message);
}

pub fn set_failure(status: &mut KubeVirtStatus, reason: &str, message: &str) {
    set_condition(status, CONDITION_DEGRADED, true, reason, message);
    set_condition(status, CONDITION_FAILURE, true, reason, message);
}

fn generation_matches<K: Resource<DynamicType = ()>>(
    entry: &GenerationStatus,
    namespace: Option<&str>,
    name: &str,
) -> bool {
    entry.group == K::group(&()) && entry.resource == K::plural(&()) && entry.name == name
        && entry.namespace.as_deref().filter(|ns| !ns.is_empty()) == namespace.filter(|ns| !ns.is_empty())
}

impl Reconciler {
    /// Generation last written for the object, if one was recorded
    pub(crate) fn expected_generation<K: Resource<DynamicType = ()>>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<i64> {
        self.kv.status.as_ref().and_then(|status| {
            status
                .generations
                .iter()
                .find(|g| generation_matches::<K>(g, namespace, name))
                .map(|g| g.last_generation)
        })
    }

    /// Record the generation of an object the operator just wrote
    pub(crate) fn set_generation<K: Resource<DynamicType = ()>>(&mut self, obj: &K) {
        let meta = obj.meta();
        let Some(generation) = meta.generation else {
            return;
        };
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone();

        let status = self.kv.status.get_or_insert_with(Default::default);
        match status
            .generations
            .iter_mut()
            .find(|g| generation_matches::<K>(g, namespace.as_deref(), &name))
        {
            Some(entry) => entry.last_generation = generation,
            None => status.generations.push(GenerationStatus {
                group: K::group(&()).to_string(),
                resource: K::plural(&()).to_string(),
                namespace,
                name,
                last_generation: generation,
            }),
        }
    }
}
