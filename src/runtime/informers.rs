//! # Informers
//!
//! Reflector caches for every kind the reconciler reads. Each cache also
//! reports what it sees to the expectations and wakes the controller.

use crate::controller::expectations::Expectations;
use crate::controller::kinds::ObjectKind;
use crate::controller::store::object_key;
use crate::controller::syncer::is_managed;
use crate::crd::KubeVirt;
use futures::channel::mpsc::UnboundedSender;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a cache does with the events it sees
#[derive(Clone)]
pub struct Observer {
    /// Kind whose expectations the events settle; `None` for read-only kinds
    pub kind: Option<ObjectKind>,
    /// Only operator-owned objects settle expectations or wake the controller
    pub managed_only: bool,
    pub expectations: Arc<Expectations>,
    pub kubevirts: Store<KubeVirt>,
    pub trigger: UnboundedSender<()>,
}

impl Observer {
    fn owners(&self) -> Vec<String> {
        self.kubevirts.state().iter().map(|kv| kv.key()).collect()
    }

    fn applied<K: Resource>(&self, obj: &K, seen: &mut HashSet<String>) {
        let meta = obj.meta();
        if self.managed_only && !is_managed(meta) {
            return;
        }
        let key = object_key(obj);
        if let Some(kind) = self.kind {
            if meta.deletion_timestamp.is_some() {
                for owner in self.owners() {
                    self.expectations.deletion_observed(kind, &owner, &key);
                }
            } else if seen.insert(key.clone()) {
                for owner in self.owners() {
                    self.expectations.creation_observed(kind, &owner);
                }
            }
        }
        self.wake();
    }

    fn deleted<K: Resource>(&self, obj: &K, seen: &mut HashSet<String>) {
        if self.managed_only && !is_managed(obj.meta()) {
            return;
        }
        let key = object_key(obj);
        seen.remove(&key);
        if let Some(kind) = self.kind {
            for owner in self.owners() {
                self.expectations.deletion_observed(kind, &owner, &key);
            }
        }
        self.wake();
    }

    fn wake(&self) {
        // the receiver only goes away on shutdown
        let _ = self.trigger.unbounded_send(());
    }
}

/// Start a reflector for `api` and return its cache
///
/// Objects present in the initial list are remembered without settling
/// creations, since nothing was waiting on them.
pub fn spawn_informer<K>(api: Api<K>, config: watcher::Config, observer: Observer) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, config).default_backoff());
    let kind_name = std::any::type_name::<K>();

    tokio::spawn(async move {
        let mut seen = HashSet::new();
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::InitApply(obj)) => {
                    seen.insert(object_key(&obj));
                }
                Ok(watcher::Event::InitDone) => {
                    debug!(kind = kind_name, "initial list complete");
                    observer.wake();
                }
                Ok(watcher::Event::Apply(obj)) => observer.applied(&obj, &mut seen),
                Ok(watcher::Event::Delete(obj)) => observer.deleted(&obj, &mut seen),
                Ok(watcher::Event::Init) => {}
                Err(e) => warn!(kind = kind_name, error = %e, "watch error"),
            }
        }
        warn!(kind = kind_name, "informer stream ended");
    });

    reader
}

/// Selector matching operator-owned objects
pub fn managed_selector() -> watcher::Config {
    watcher::Config::default().labels(&format!(
        "{}={}",
        crate::constants::MANAGED_BY_LABEL,
        crate::constants::MANAGED_BY_VALUE
    ))
}
