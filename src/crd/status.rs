//! # KubeVirt Status
//!
//! Status types for tracking install progress, rollout state and the
//! generations of the objects the operator manages.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of the KubeVirt resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<KubeVirtPhase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Version of the operator that last reconciled this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kube_virt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kube_virt_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_deployment_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_kube_virt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_kube_virt_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_deployment_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Last generation the operator wrote for each generation-tracked object
    #[serde(default)]
    pub generations: Vec<GenerationStatus>,
    /// Last state of the node daemonset canary rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_upgrade_status: Option<CanaryUpgradeStatus>,
    /// Cluster IP of the synchronization controller service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum KubeVirtPhase {
    Deploying,
    Deployed,
    Deleting,
    Deleted,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Available, Progressing, Degraded, Created, Failure)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition was evaluated
    #[serde(rename = "lastProbeTime", default, skip_serializing_if = "Option::is_none")]
    pub last_checked_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Recorded generation of one managed object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub last_generation: i64,
}

/// State of the node daemonset rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum CanaryUpgradeStatus {
    /// Canary pod is being rolled out (one pod at a time)
    Started,
    /// Canary is healthy; the rest of the nodes roll out at the wider rate
    UpgradingDaemonSet,
    /// Waiting for pods to settle or for the strategy to be reverted
    WaitingDaemonSetRollout,
    Successful,
    Failed,
}

impl std::fmt::Display for CanaryUpgradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "Started",
            Self::UpgradingDaemonSet => "UpgradingDaemonSet",
            Self::WaitingDaemonSetRollout => "WaitingDaemonSetRollout",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}
