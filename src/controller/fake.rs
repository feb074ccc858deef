//! # In-memory Cluster
//!
//! A cluster double used by unit and integration tests. Each kind is a map
//! that serves as both the cache and the API: writes land in the map
//! immediately and are recorded in a shared [`CallLog`], so a test can run a
//! pass, inspect the exact calls, and run the next pass against the result.
//!
//! Deleting an object that still has finalizers only marks it terminating;
//! it disappears once a write clears the last finalizer.

use crate::controller::client::{ClientError, KindClient, PatchDocument};
use crate::controller::cluster::{Cluster, KindHandle};
use crate::controller::events::EventRecorder;
use crate::controller::store::{key_for, ObjectStore};
use crate::crd::{
    KubeVirt, PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor,
    VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// API verb recorded by the fake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Patch,
    Update,
    Delete,
    Get,
    PatchStatus,
}

/// One recorded API call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Created or updated object, or the patch document
    pub body: Option<Value>,
}

/// Ordered record of every call made against the fake cluster
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<ApiCall>>,
}

impl CallLog {
    fn push(&self, call: ApiCall) {
        lock(&self.calls).push(call);
    }

    pub fn all(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }

    /// Every call except reads
    pub fn writes(&self) -> Vec<ApiCall> {
        self.all()
            .into_iter()
            .filter(|call| call.verb != Verb::Get)
            .collect()
    }

    pub fn writes_for(&self, kind: &str) -> Vec<ApiCall> {
        self.writes()
            .into_iter()
            .filter(|call| call.kind == kind)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store and client for one kind
pub struct FakeKind<K> {
    objects: Mutex<BTreeMap<String, K>>,
    calls: Arc<CallLog>,
    failures: Mutex<HashMap<Verb, String>>,
    counter: AtomicU64,
}

impl<K> fmt::Debug for FakeKind<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeKind")
            .field("kind", &std::any::type_name::<K>())
            .field("objects", &lock(&self.objects).len())
            .finish_non_exhaustive()
    }
}

impl<K> FakeKind<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(calls: Arc<CallLog>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            calls,
            failures: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    fn kind_name() -> String {
        K::kind(&()).into_owned()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Put an object straight into the cache without recording a call
    ///
    /// Missing uid, generation and resourceVersion are filled in.
    pub fn seed(&self, mut obj: K) -> K {
        let id = self.next_id();
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{id}"));
        meta.generation.get_or_insert(1);
        meta.resource_version.get_or_insert_with(|| id.to_string());
        let key = key_for(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());
        lock(&self.objects).insert(key, obj.clone());
        obj
    }

    pub fn object(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        lock(&self.objects).get(&key_for(namespace, name)).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Mutate a cached object in place, e.g. to simulate a status change
    pub fn modify(&self, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut K)) {
        if let Some(obj) = lock(&self.objects).get_mut(&key_for(namespace, name)) {
            f(obj);
        }
    }

    /// Remove an object without recording a call
    pub fn evict(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        lock(&self.objects).remove(&key_for(namespace, name))
    }

    /// Make the next call with `verb` fail with `message`
    pub fn fail_next(&self, verb: Verb, message: &str) {
        lock(&self.failures).insert(verb, message.to_string());
    }

    fn record(&self, verb: Verb, namespace: Option<&str>, name: &str, body: Option<Value>) -> Result<(), ClientError> {
        self.calls.push(ApiCall {
            verb,
            kind: Self::kind_name(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            body,
        });
        match lock(&self.failures).remove(&verb) {
            Some(message) => Err(ClientError::Rejected(message)),
            None => Ok(()),
        }
    }

    fn apply_write(&self, key: &str, current: &K, mut updated: K) -> Result<K, ClientError> {
        let generation = current.meta().generation.unwrap_or(1);
        let changed = without_metadata(current)? != without_metadata(&updated)?;
        let id = self.next_id();
        let meta = updated.meta_mut();
        meta.generation = Some(if changed { generation + 1 } else { generation });
        meta.resource_version = Some(id.to_string());
        meta.uid.clone_from(&current.meta().uid);
        if is_released(meta) {
            lock(&self.objects).remove(key);
        } else {
            lock(&self.objects).insert(key.to_string(), updated.clone());
        }
        Ok(updated)
    }
}

fn without_metadata<K: Serialize>(obj: &K) -> Result<Value, ClientError> {
    let mut value = serde_json::to_value(obj).map_err(|e| ClientError::Rejected(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    Ok(value)
}

/// Terminating and without finalizers
fn is_released(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().is_none_or(Vec::is_empty)
}

fn deletion_time() -> Result<Time, ClientError> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(Value::String(now)).map_err(reject)
}

fn reject(e: impl fmt::Display) -> ClientError {
    ClientError::Rejected(e.to_string())
}

impl<K> ObjectStore<K> for FakeKind<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.object(namespace, name).map(Arc::new)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects().into_iter().map(Arc::new).collect()
    }
}

#[async_trait]
impl<K> KindClient<K> for FakeKind<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K, ClientError> {
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            if let Some(prefix) = meta.generate_name.clone() {
                meta.name = Some(format!("{prefix}{:05}", self.next_id()));
            }
        }
        let namespace = meta.namespace.clone();
        let name = meta.name.clone().unwrap_or_default();
        let body = serde_json::to_value(&obj).ok();
        self.record(Verb::Create, namespace.as_deref(), &name, body)?;

        let key = key_for(namespace.as_deref(), &name);
        if name.is_empty() {
            return Err(reject("name or generateName is required"));
        }
        if lock(&self.objects).contains_key(&key) {
            return Err(reject(format!("{} {key} already exists", Self::kind_name())));
        }
        obj.meta_mut().uid = None;
        obj.meta_mut().resource_version = None;
        obj.meta_mut().generation = None;
        Ok(self.seed(obj))
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchDocument,
    ) -> Result<K, ClientError> {
        self.record(Verb::Patch, namespace, name, Some(patch.to_value()))?;
        let key = key_for(namespace, name);
        let current = lock(&self.objects)
            .get(&key)
            .cloned()
            .ok_or_else(|| reject(format!("{} {key} not found", Self::kind_name())))?;

        let mut doc = serde_json::to_value(&current).map_err(reject)?;
        match patch {
            PatchDocument::Json(p) => json_patch::patch(&mut doc, &p.0).map_err(reject)?,
            PatchDocument::Merge(v) => json_patch::merge(&mut doc, v),
        }
        let updated: K = serde_json::from_value(doc).map_err(reject)?;
        self.apply_write(&key, &current, updated)
    }

    async fn update(&self, obj: &K) -> Result<K, ClientError> {
        let namespace = obj.meta().namespace.clone();
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record(
            Verb::Update,
            namespace.as_deref(),
            &name,
            serde_json::to_value(obj).ok(),
        )?;
        let key = key_for(namespace.as_deref(), &name);
        let current = lock(&self.objects)
            .get(&key)
            .cloned()
            .ok_or_else(|| reject(format!("{} {key} not found", Self::kind_name())))?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != current.meta().resource_version
        {
            return Err(reject(format!("{} {key} conflict", Self::kind_name())));
        }
        self.apply_write(&key, &current, obj.clone())
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.record(Verb::Delete, namespace, name, None)?;
        let key = key_for(namespace, name);
        let mut objects = lock(&self.objects);
        let Some(current) = objects.get_mut(&key) else {
            return Err(reject(format!("{} {key} not found", Self::kind_name())));
        };
        let meta = current.meta_mut();
        if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(deletion_time()?);
                meta.resource_version = Some(self.next_id().to_string());
            }
            return Ok(());
        }
        objects.remove(&key);
        Ok(())
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClientError> {
        self.record(Verb::Get, namespace, name, None)?;
        Ok(self.object(namespace, name))
    }

    async fn patch_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<K, ClientError> {
        self.record(Verb::PatchStatus, namespace, name, Some(status.clone()))?;
        let key = key_for(namespace, name);
        let current = lock(&self.objects)
            .get(&key)
            .cloned()
            .ok_or_else(|| reject(format!("{} {key} not found", Self::kind_name())))?;
        let mut doc = serde_json::to_value(&current).map_err(reject)?;
        json_patch::merge(&mut doc, &serde_json::json!({ "status": status }));
        let updated: K = serde_json::from_value(doc).map_err(reject)?;
        lock(&self.objects).insert(key, updated.clone());
        Ok(updated)
    }
}

/// A whole cluster of [`FakeKind`]s wired into a [`Cluster`]
pub struct FakeCluster {
    pub calls: Arc<CallLog>,
    /// Install strategy config maps, kept apart from managed config maps
    pub install_strategies: Arc<FakeKind<ConfigMap>>,
    kinds: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    cluster: Arc<Cluster>,
}

impl fmt::Debug for FakeCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeCluster")
            .field("kinds", &self.kinds.len())
            .finish_non_exhaustive()
    }
}

struct Builder {
    calls: Arc<CallLog>,
    kinds: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Builder {
    fn handle<K>(&mut self) -> KindHandle<K>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let fake = Arc::new(FakeKind::<K>::new(Arc::clone(&self.calls)));
        self.kinds.insert(TypeId::of::<K>(), Arc::clone(&fake) as Arc<dyn Any + Send + Sync>);
        KindHandle::new(Arc::clone(&fake) as Arc<dyn ObjectStore<K>>, fake)
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let calls = Arc::new(CallLog::default());
        let mut b = Builder {
            calls: Arc::clone(&calls),
            kinds: HashMap::new(),
        };
        let install_strategies = Arc::new(FakeKind::<ConfigMap>::new(Arc::clone(&calls)));
        let pods = b.handle::<Pod>();

        let cluster = Cluster {
            service_accounts: b.handle::<ServiceAccount>(),
            cluster_roles: b.handle::<ClusterRole>(),
            cluster_role_bindings: b.handle::<ClusterRoleBinding>(),
            roles: b.handle::<Role>(),
            role_bindings: b.handle::<RoleBinding>(),
            crds: b.handle::<CustomResourceDefinition>(),
            services: b.handle::<Service>(),
            deployments: b.handle::<Deployment>(),
            daemon_sets: b.handle::<DaemonSet>(),
            pod_disruption_budgets: b.handle::<PodDisruptionBudget>(),
            validating_webhooks: b.handle::<ValidatingWebhookConfiguration>(),
            mutating_webhooks: b.handle::<MutatingWebhookConfiguration>(),
            api_services: b.handle::<APIService>(),
            secrets: b.handle::<Secret>(),
            config_maps: b.handle::<ConfigMap>(),
            sccs: b.handle::<SecurityContextConstraints>(),
            routes: b.handle::<Route>(),
            service_monitors: b.handle::<ServiceMonitor>(),
            prometheus_rules: b.handle::<PrometheusRule>(),
            instancetypes: b.handle::<VirtualMachineClusterInstancetype>(),
            preferences: b.handle::<VirtualMachineClusterPreference>(),
            namespaces: b.handle::<Namespace>(),
            kubevirts: b.handle::<KubeVirt>(),
            pods: pods.store,
            install_strategies: Arc::clone(&install_strategies) as Arc<dyn ObjectStore<ConfigMap>>,
        };

        Self {
            calls,
            install_strategies,
            kinds: b.kinds,
            cluster: Arc::new(cluster),
        }
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        Arc::clone(&self.cluster)
    }

    /// The fake behind kind `K`
    ///
    /// # Panics
    ///
    /// Panics if `K` is not one of the kinds wired into [`Cluster`].
    pub fn kind<K: Send + Sync + 'static>(&self) -> Arc<FakeKind<K>> {
        self.kinds
            .get(&TypeId::of::<K>())
            .cloned()
            .and_then(|any| any.downcast::<FakeKind<K>>().ok())
            .unwrap_or_else(|| {
                panic!(
                    "{} is not part of the fake cluster",
                    std::any::type_name::<K>()
                )
            })
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One event captured by [`RecordedEvents`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// [`EventRecorder`] that keeps events in memory
#[derive(Debug, Default)]
pub struct RecordedEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordedEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordedEvents {
    async fn publish(&self, _kv: &KubeVirt, type_: EventType, reason: &str, message: &str) {
        lock(&self.events).push(RecordedEvent {
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
