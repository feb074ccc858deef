//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! Reconciliation errors get per-object Fibonacci backoff; controller stream
//! errors are classified by their API status code.

use crate::constants;
use crate::controller::backoff::BackoffState;
use crate::crd::KubeVirt;
use crate::error::ReconcileError;
use crate::observability::metrics;
use crate::runtime::watch_loop::Context;
use kube_runtime::controller::{self, Action};
use kube_runtime::watcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per resource and reset by the next successful pass.
pub fn handle_reconciliation_error(
    obj: Arc<KubeVirt>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    let key = obj.key();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.key = %key,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!(reason = error.reason(), "reconciliation of {} failed: {}", key, error);
    metrics::increment_reconciliation_errors(error.reason());

    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key.clone()).or_insert_with(|| {
                BackoffState::new(ctx.config.backoff_min_secs, ctx.config.backoff_max_secs)
            });
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (constants::DEFAULT_BACKOFF_MAX_SECS, 0)
        }
    };

    let next_trigger_time = chrono::Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
    info!(
        error_count,
        "retrying {} in {}s at {} (trigger source: error-backoff)",
        key,
        backoff_seconds,
        next_trigger_time.to_rfc3339()
    );

    metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Forget the backoff of `key` after a successful pass
pub fn reset_backoff(ctx: &Context, key: &str) {
    if let Ok(mut states) = ctx.backoff_states.lock() {
        states.remove(key);
    }
}

/// Errors surfaced by the controller stream
pub type ControllerError = controller::Error<ReconcileError, watcher::Error>;

/// How the watch loop reacts to a controller stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// Already handled by [`handle_reconciliation_error`]
    Reported,
    /// Queued object left the store before its pass ran
    ObjectGone,
    /// 410: the watcher relists on its own
    Expired,
    /// 429: back off before the watcher retries
    Throttled,
    /// 401 or 403 from the API server
    Forbidden,
    Other,
}

/// API status code carried by a watcher error, if any
fn status_code(error: &watcher::Error) -> Option<u16> {
    match error {
        watcher::Error::WatchError(response) => Some(response.code),
        watcher::Error::InitialListFailed(e)
        | watcher::Error::WatchStartFailed(e)
        | watcher::Error::WatchFailed(e) => match e {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        },
        watcher::Error::NoResourceVersion => None,
    }
}

pub fn classify_watch_error(error: &ControllerError) -> WatchErrorClass {
    match error {
        controller::Error::ReconcilerFailed(_, _) => WatchErrorClass::Reported,
        controller::Error::ObjectNotFound(_) => WatchErrorClass::ObjectGone,
        controller::Error::QueueError(e) => match status_code(e) {
            Some(410) => WatchErrorClass::Expired,
            Some(429) => WatchErrorClass::Throttled,
            Some(401 | 403) => WatchErrorClass::Forbidden,
            _ => WatchErrorClass::Other,
        },
        controller::Error::RunnerError(_) => WatchErrorClass::Other,
    }
}

/// Log a controller stream error and wait where the next attempt needs time
///
/// Throttling doubles `backoff` (in ms) up to `max_backoff_ms`.
pub async fn handle_watch_stream_error(
    error: &ControllerError,
    backoff: &AtomicU64,
    max_backoff_ms: u64,
) -> WatchErrorClass {
    let class = classify_watch_error(error);
    let restart_delay = Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS);
    match class {
        WatchErrorClass::Reported => {}
        WatchErrorClass::ObjectGone => debug!("{}", error),
        WatchErrorClass::Expired => {
            warn!(error_type = "410", "watch resource version expired, watch will restart");
        }
        WatchErrorClass::Throttled => {
            let current = backoff.load(Ordering::Relaxed);
            warn!(error_type = "429", backoff_ms = current, "watch throttled by the API server");
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff.store(std::cmp::min(current * 2, max_backoff_ms), Ordering::Relaxed);
        }
        WatchErrorClass::Forbidden => {
            error!(
                "watch rejected by the API server, check the RBAC of the {} service account: {}",
                constants::OPERATOR_NAME,
                error
            );
            tokio::time::sleep(restart_delay).await;
        }
        WatchErrorClass::Other => {
            error!("controller stream error: {:?}", error);
            tokio::time::sleep(restart_delay).await;
        }
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> ErrorResponse {
        serde_json::from_value(serde_json::json!({
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code
        }))
        .unwrap()
    }

    fn queue_error(error: watcher::Error) -> ControllerError {
        controller::Error::QueueError(error)
    }

    #[test]
    fn test_classify_by_status_code() {
        let expired = queue_error(watcher::Error::WatchError(api_error(410, "Expired")));
        assert_eq!(classify_watch_error(&expired), WatchErrorClass::Expired);

        let throttled = queue_error(watcher::Error::InitialListFailed(kube::Error::Api(
            api_error(429, "TooManyRequests"),
        )));
        assert_eq!(classify_watch_error(&throttled), WatchErrorClass::Throttled);

        let forbidden = queue_error(watcher::Error::WatchStartFailed(kube::Error::Api(
            api_error(403, "Forbidden"),
        )));
        assert_eq!(classify_watch_error(&forbidden), WatchErrorClass::Forbidden);

        let server = queue_error(watcher::Error::WatchFailed(kube::Error::Api(api_error(
            500,
            "InternalError",
        ))));
        assert_eq!(classify_watch_error(&server), WatchErrorClass::Other);
        assert_eq!(
            classify_watch_error(&queue_error(watcher::Error::NoResourceVersion)),
            WatchErrorClass::Other
        );
    }

    #[tokio::test]
    async fn test_expired_resource_version_restarts_without_delay() {
        let backoff = AtomicU64::new(100);
        let expired = queue_error(watcher::Error::WatchError(api_error(410, "Expired")));
        let class = handle_watch_stream_error(&expired, &backoff, 1000).await;
        assert_eq!(class, WatchErrorClass::Expired);
        assert_eq!(backoff.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn test_throttling_doubles_backoff_up_to_max() {
        let backoff = AtomicU64::new(1);
        let throttled = queue_error(watcher::Error::WatchError(api_error(429, "TooManyRequests")));
        handle_watch_stream_error(&throttled, &backoff, 3).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 2);
        handle_watch_stream_error(&throttled, &backoff, 3).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 3);
    }
}
