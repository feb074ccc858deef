//! # Expectations
//!
//! Tracks writes the operator has issued but not yet seen reflected in its
//! caches. A reconcile pass only runs once every kind is satisfied for the
//! owning resource, so the same intent is never acted on twice.

use crate::controller::kinds::ObjectKind;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Pending {
    adds: i64,
    deletes: i64,
    deletion_keys: HashSet<String>,
    updated_at: Instant,
}

impl Pending {
    fn new() -> Self {
        Self {
            adds: 0,
            deletes: 0,
            deletion_keys: HashSet::new(),
            updated_at: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.deletes <= 0 && self.deletion_keys.is_empty()
    }
}

/// Pending creations and deletions per `(kind, owner)`
#[derive(Debug)]
pub struct Expectations {
    pending: Mutex<HashMap<(ObjectKind, String), Pending>>,
    timeout: Duration,
}

impl Expectations {
    /// Records older than `timeout` count as satisfied so a lost watch event
    /// cannot stall the operator forever.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn with_entry<R>(&self, kind: ObjectKind, owner: &str, f: impl FnOnce(&mut Pending) -> R) -> R {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = pending
            .entry((kind, owner.to_string()))
            .or_insert_with(Pending::new);
        entry.updated_at = Instant::now();
        f(entry)
    }

    /// Expect `adds` creations and `deletes` deletions before acting again
    pub fn raise(&self, kind: ObjectKind, owner: &str, adds: i64, deletes: i64) {
        self.with_entry(kind, owner, |p| {
            p.adds += adds;
            p.deletes += deletes;
        });
        debug!(%kind, owner, adds, deletes, "raised expectations");
    }

    /// Undo a [`raise`](Self::raise) whose write failed
    pub fn lower(&self, kind: ObjectKind, owner: &str, adds: i64, deletes: i64) {
        self.with_entry(kind, owner, |p| {
            p.adds -= adds;
            p.deletes -= deletes;
        });
        debug!(%kind, owner, adds, deletes, "lowered expectations");
    }

    /// The cache reported a newly created object
    pub fn creation_observed(&self, kind: ObjectKind, owner: &str) {
        self.lower(kind, owner, 1, 0);
    }

    /// Expect the deletion of the object identified by `key`
    pub fn add_expected_deletion(&self, kind: ObjectKind, owner: &str, key: &str) {
        self.with_entry(kind, owner, |p| {
            p.deletes += 1;
            p.deletion_keys.insert(key.to_string());
        });
        debug!(%kind, owner, key, "expecting deletion");
    }

    /// The cache reported the deletion of `key`, or the delete call failed
    pub fn deletion_observed(&self, kind: ObjectKind, owner: &str, key: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = pending.get_mut(&(kind, owner.to_string())) {
            if p.deletion_keys.remove(key) {
                p.deletes -= 1;
                p.updated_at = Instant::now();
                debug!(%kind, owner, key, "deletion observed");
            }
        }
    }

    /// Whether every issued write of `kind` has been observed
    pub fn satisfied(&self, kind: ObjectKind, owner: &str) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending
            .get(&(kind, owner.to_string()))
            .is_none_or(|p| p.fulfilled() || p.updated_at.elapsed() > self.timeout)
    }

    /// Whether every kind is satisfied for `owner`
    pub fn all_satisfied(&self, owner: &str) -> bool {
        ObjectKind::ALL.iter().all(|kind| self.satisfied(*kind, owner))
    }

    /// Kinds still waiting on the cache for `owner`
    pub fn unsatisfied_kinds(&self, owner: &str) -> Vec<ObjectKind> {
        ObjectKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.satisfied(*kind, owner))
            .collect()
    }

    /// Forget everything recorded for `owner`
    pub fn delete_owner(&self, owner: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|(_, o), _| o != owner);
    }
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            crate::constants::DEFAULT_EXPECTATIONS_TIMEOUT_SECS,
        ))
    }
}
