//! # Requeue Queue
//!
//! Delayed re-evaluation requests raised during a pass, such as the next
//! certificate rotation deadline.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Schedules another reconcile of `key` after a delay
pub trait RequeueQueue: Send + Sync {
    fn add_after(&self, key: &str, after: Duration);
}

/// Collects requests of one pass and keeps the earliest
///
/// The controller runtime turns the result into `Action::requeue`.
#[derive(Debug, Default)]
pub struct DelayedRequeue {
    earliest: Mutex<Option<Duration>>,
}

impl DelayedRequeue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest requested delay, if any
    pub fn next(&self) -> Option<Duration> {
        *self.earliest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RequeueQueue for DelayedRequeue {
    fn add_after(&self, _key: &str, after: Duration) {
        let mut earliest = self.earliest.lock().unwrap_or_else(PoisonError::into_inner);
        *earliest = Some(earliest.map_or(after, |current| current.min(after)));
    }
}
