//! # Watch Loop
//!
//! Drives the installation controller from the `KubeVirt` watch plus a
//! wake-up stream fed by every other cache.

use crate::config::OperatorConfig;
use crate::controller::backoff::BackoffState;
use crate::controller::queue::DelayedRequeue;
use crate::controller::reconciler::{InstallationController, Outcome};
use crate::crd::KubeVirt;
use crate::error::ReconcileError;
use crate::observability::metrics;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error, reset_backoff};
use crate::runtime::initialization::InitializationResult;
use anyhow::Result;
use futures::StreamExt;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, Instrument};

/// Requeue while earlier writes are still in flight
const AWAITING_OBSERVATIONS_REQUEUE: Duration = Duration::from_secs(5);
/// Upper bound on the wait while work is in progress
const IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue while the caches finish their first list
const CACHE_SYNC_REQUEUE: Duration = Duration::from_secs(1);

const WATCH_INITIAL_BACKOFF_MS: u64 = 1_000;
const WATCH_MAX_BACKOFF_MS: u64 = 30_000;

/// Shared state handed to every reconcile
pub struct Context {
    pub controller: InstallationController,
    pub config: OperatorConfig,
    pub caches_synced: Arc<AtomicBool>,
    /// Error backoff per `namespace/name`
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Turn the outcome of a pass into the next requeue
fn next_action(outcome: Outcome, requested: Option<Duration>, config: &OperatorConfig) -> Action {
    let cap = match outcome {
        Outcome::AwaitingObservations => AWAITING_OBSERVATIONS_REQUEUE,
        Outcome::InProgress => IN_PROGRESS_REQUEUE,
        Outcome::Complete | Outcome::Rejected => config.resync_interval(),
    };
    Action::requeue(requested.map_or(cap, |after| after.min(cap)))
}

/// Reconcile one `KubeVirt` resource
pub async fn reconcile(kv: Arc<KubeVirt>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let key = kv.key();
    if !ctx.caches_synced.load(Ordering::Relaxed) {
        debug!(%key, "caches not synced yet");
        return Ok(Action::requeue(CACHE_SYNC_REQUEUE));
    }

    let span = tracing::info_span!("controller.reconcile", resource.key = %key);
    async move {
        metrics::increment_reconciliations();
        let started = Instant::now();
        let queue = DelayedRequeue::new();
        let namespace = kv.namespace().unwrap_or_default();
        let result = ctx
            .controller
            .reconcile(&namespace, &kv.name_any(), &queue)
            .await;
        metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());

        let outcome = result?;
        reset_backoff(&ctx, &key);
        let action = next_action(outcome, queue.next(), &ctx.config);
        debug!(?outcome, ?action, "reconcile finished");
        Ok(action)
    }
    .instrument(span)
    .await
}

/// Run the controller until a shutdown signal arrives
pub async fn run_watch_loop(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        controller,
        context,
        wakeups,
        ..
    } = init;

    let watch_backoff = Arc::new(AtomicU64::new(WATCH_INITIAL_BACKOFF_MS));
    info!("starting watch loop");

    controller
        .reconcile_all_on(wakeups)
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, context)
        .for_each(|result| {
            let watch_backoff = Arc::clone(&watch_backoff);
            async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(object = %obj, ?action, "reconciled");
                        watch_backoff.store(WATCH_INITIAL_BACKOFF_MS, Ordering::Relaxed);
                    }
                    Err(e) => {
                        handle_watch_stream_error(&e, &watch_backoff, WATCH_MAX_BACKOFF_MS)
                            .await;
                    }
                }
            }
        })
        .await;

    info!("watch loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_action_uses_earliest_request() {
        let config = OperatorConfig::default();
        assert_eq!(
            next_action(Outcome::Complete, Some(Duration::from_secs(42)), &config),
            Action::requeue(Duration::from_secs(42))
        );
        assert_eq!(
            next_action(Outcome::Complete, None, &config),
            Action::requeue(config.resync_interval())
        );
    }

    #[test]
    fn test_next_action_caps_waits_while_in_progress() {
        let config = OperatorConfig::default();
        assert_eq!(
            next_action(Outcome::InProgress, Some(Duration::from_secs(3600)), &config),
            Action::requeue(IN_PROGRESS_REQUEUE)
        );
        assert_eq!(
            next_action(Outcome::AwaitingObservations, None, &config),
            Action::requeue(AWAITING_OBSERVATIONS_REQUEUE)
        );
    }
}
