//! # Events
//!
//! Kubernetes events published against the managed resource.

use crate::constants::OPERATOR_NAME;
use crate::crd::KubeVirt;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Publishes events about the managed resource
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, kv: &KubeVirt, type_: EventType, reason: &str, message: &str);
}

/// [`EventRecorder`] writing `events.k8s.io` events through the API
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, kv: &KubeVirt, type_: EventType, reason: &str, message: &str) {
        let reference = kv.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}
