//! # Install Metrics
//!
//! Metrics for what a pass does to the cluster: object writes by kind and
//! verb, the node daemonset canary state, and certificate rotations.

use crate::crd::CanaryUpgradeStatus;
use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{IntCounterVec, IntGaugeVec};
use std::sync::LazyLock;

static OBJECT_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "virt_operator_object_writes_total",
            "Total number of API writes issued for managed objects",
        ),
        &["kind", "verb"],
    )
    .expect("Failed to create OBJECT_WRITES_TOTAL metric - this should never happen")
});

static CANARY_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "virt_operator_canary_upgrade_state",
            "1 for the current node daemonset rollout state of each resource",
        ),
        &["kubevirt", "state"],
    )
    .expect("Failed to create CANARY_STATE metric - this should never happen")
});

static CERTIFICATE_ROTATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "virt_operator_certificate_rotations_total",
            "Total number of certificates issued or rotated",
        ),
        &["secret"],
    )
    .expect("Failed to create CERTIFICATE_ROTATIONS_TOTAL metric - this should never happen")
});

const CANARY_STATES: [CanaryUpgradeStatus; 5] = [
    CanaryUpgradeStatus::Started,
    CanaryUpgradeStatus::UpgradingDaemonSet,
    CanaryUpgradeStatus::WaitingDaemonSetRollout,
    CanaryUpgradeStatus::Successful,
    CanaryUpgradeStatus::Failed,
];

pub(crate) fn register_install_metrics() -> Result<()> {
    REGISTRY.register(Box::new(OBJECT_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CANARY_STATE.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATE_ROTATIONS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_object_writes(kind: &str, verb: &str) {
    OBJECT_WRITES_TOTAL.with_label_values(&[kind, verb]).inc();
}

/// Mark `status` as the current canary state of `kubevirt`
pub fn set_canary_state(kubevirt: &str, status: CanaryUpgradeStatus) {
    for state in CANARY_STATES {
        let value = i64::from(state == status);
        CANARY_STATE
            .with_label_values(&[kubevirt, &state.to_string()])
            .set(value);
    }
}

pub fn increment_certificate_rotations(secret: &str) {
    CERTIFICATE_ROTATIONS_TOTAL.with_label_values(&[secret]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_state_is_one_hot() {
        set_canary_state("test/one-hot", CanaryUpgradeStatus::Started);
        set_canary_state("test/one-hot", CanaryUpgradeStatus::Successful);
        let value = |state: CanaryUpgradeStatus| {
            CANARY_STATE
                .with_label_values(&["test/one-hot", &state.to_string()])
                .get()
        };
        assert_eq!(value(CanaryUpgradeStatus::Successful), 1);
        assert_eq!(value(CanaryUpgradeStatus::Started), 0);
    }

    #[test]
    fn test_object_writes_by_kind_and_verb() {
        let counter = OBJECT_WRITES_TOTAL.with_label_values(&["ConfigMap", "create"]);
        let before = counter.get();
        increment_object_writes("ConfigMap", "create");
        assert_eq!(counter.get(), before + 1);
    }
}
