//! # Object Stores
//!
//! Read-only caches of cluster state, one per kind. Production uses the
//! reflector stores fed by the watch loop; tests use the in-memory fake.

use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
use std::hash::Hash;
use std::sync::Arc;

/// Read access to the cached objects of one kind
pub trait ObjectStore<K>: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>>;
    fn list(&self) -> Vec<Arc<K>>;
}

impl<K> ObjectStore<K> for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let key = match namespace {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };
        Store::get(self, &key)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.state()
    }
}

/// `namespace/name`, or just `name` for cluster-scoped objects
pub fn object_key<K: Resource>(obj: &K) -> String {
    key_for(obj.meta().namespace.as_deref(), obj.meta().name.as_deref().unwrap_or_default())
}

pub fn key_for(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}
