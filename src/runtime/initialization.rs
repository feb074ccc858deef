//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, the Kubernetes client and the reflector caches.

use crate::config::OperatorConfig;
use crate::constants::INSTALL_STRATEGY_LABEL;
use crate::controller::client::{KindClient, KubeKindClient};
use crate::controller::cluster::{Cluster, KindHandle};
use crate::controller::events::KubeEventRecorder;
use crate::controller::expectations::Expectations;
use crate::controller::kinds::ObjectKind;
use crate::controller::pki::RcgenIssuer;
use crate::controller::reconciler::{Dependencies, InstallationController};
use crate::controller::server::{start_server, ServerState};
use crate::controller::store::ObjectStore;
use crate::crd::{
    KubeVirt, PrometheusRule, Route, SecurityContextConstraints, ServiceMonitor,
    VirtualMachineClusterInstancetype, VirtualMachineClusterPreference,
};
use crate::observability;
use crate::runtime::informers::{managed_selector, spawn_informer, Observer};
use crate::runtime::watch_loop::Context;
use anyhow::{anyhow, Result};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::Api;
use kube::runtime::reflector::Store;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    pub client: Client,
    /// Controller over the `KubeVirt` resources of the operator namespace
    pub controller: Controller<KubeVirt>,
    pub context: Arc<Context>,
    /// Fires whenever a cache sees a relevant change
    pub wakeups: UnboundedReceiver<()>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

/// Whether readiness waits for a cache's first list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheSync {
    Required,
    /// Kinds whose API may not be installed in the cluster
    Optional,
}

/// Builds the reflector caches behind a [`Cluster`]
struct CacheBuilder {
    client: Client,
    expectations: Arc<Expectations>,
    kubevirts: Store<KubeVirt>,
    trigger: UnboundedSender<()>,
    pending: Vec<BoxFuture<'static, ()>>,
}

impl CacheBuilder {
    fn observer(&self, kind: Option<ObjectKind>, managed_only: bool) -> Observer {
        Observer {
            kind,
            managed_only,
            expectations: Arc::clone(&self.expectations),
            kubevirts: self.kubevirts.clone(),
            trigger: self.trigger.clone(),
        }
    }

    fn watch<K>(
        &mut self,
        api: Api<K>,
        config: watcher::Config,
        observer: Observer,
        sync: CacheSync,
    ) -> Arc<dyn ObjectStore<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    {
        let store = spawn_informer(api, config, observer);
        if sync == CacheSync::Required {
            let ready = store.clone();
            self.pending.push(Box::pin(async move {
                if let Err(e) = ready.wait_until_ready().await {
                    error!(kind = std::any::type_name::<K>(), error = %e, "cache writer dropped");
                }
            }));
        }
        Arc::new(store)
    }

    fn namespaced<K>(&mut self, kind: ObjectKind, config: watcher::Config, sync: CacheSync) -> KindHandle<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        let observer = self.observer(Some(kind), true);
        let store = self.watch(Api::all(self.client.clone()), config, observer, sync);
        let client: Arc<dyn KindClient<K>> = Arc::new(KubeKindClient::namespaced(self.client.clone()));
        KindHandle::new(store, client)
    }

    fn cluster_scoped<K>(&mut self, kind: ObjectKind, config: watcher::Config, sync: CacheSync) -> KindHandle<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        let observer = self.observer(Some(kind), true);
        let store = self.watch(Api::all(self.client.clone()), config, observer, sync);
        let client: Arc<dyn KindClient<K>> = Arc::new(KubeKindClient::cluster(self.client.clone()));
        KindHandle::new(store, client)
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reflector caches and the installation controller
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virt_operator=info".into()),
        )
        .init();

    let config = OperatorConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.namespace,
        "Starting virt-operator"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &config).await?;

    let client = Client::try_default().await?;

    let controller = Controller::new(
        Api::<KubeVirt>::namespaced(client.clone(), &config.namespace),
        watcher::Config::default(),
    )
    .with_config(kube::runtime::controller::Config::default().debounce(Duration::from_millis(500)));

    let (trigger, wakeups) = mpsc::unbounded();
    let expectations = Arc::new(Expectations::new(config.expectations_timeout()));
    let mut caches = CacheBuilder {
        client: client.clone(),
        expectations: Arc::clone(&expectations),
        kubevirts: controller.store(),
        trigger,
        pending: Vec::new(),
    };
    let cluster = build_cluster(&mut caches, &config);

    let caches_synced = Arc::clone(&server_state.caches_synced);
    let pending = std::mem::take(&mut caches.pending);
    tokio::spawn(async move {
        futures::future::join_all(pending).await;
        caches_synced.store(true, Ordering::Relaxed);
        info!("caches synced");
    });

    let deps = Dependencies {
        cluster: Arc::new(cluster),
        expectations,
        recorder: Arc::new(KubeEventRecorder::new(client.clone())),
        issuer: Arc::new(RcgenIssuer),
        migrations: Vec::new(),
    };
    let context = Arc::new(Context {
        controller: InstallationController::new(deps, config.clone()),
        config,
        caches_synced: Arc::clone(&server_state.caches_synced),
        backoff_states: Mutex::new(HashMap::new()),
    });

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        controller,
        context,
        wakeups,
        server_state,
    })
}

fn build_cluster(caches: &mut CacheBuilder, config: &OperatorConfig) -> Cluster {
    use CacheSync::{Optional, Required};
    let managed = managed_selector;
    let client = caches.client.clone();

    let kubevirts_store: Arc<dyn ObjectStore<KubeVirt>> = Arc::new(caches.kubevirts.clone());
    let kubevirts_client: Arc<dyn KindClient<KubeVirt>> =
        Arc::new(KubeKindClient::namespaced(client.clone()));

    let namespace_store = caches.watch(
        Api::<Namespace>::all(client.clone()),
        watcher::Config::default().fields(&format!("metadata.name={}", config.namespace)),
        caches.observer(None, false),
        Required,
    );
    let pods = caches.watch(
        Api::<Pod>::namespaced(client.clone(), &config.namespace),
        watcher::Config::default(),
        caches.observer(None, false),
        Required,
    );
    let install_strategies = caches.watch(
        Api::<ConfigMap>::namespaced(client.clone(), &config.namespace),
        watcher::Config::default().labels(INSTALL_STRATEGY_LABEL),
        caches.observer(None, false),
        Required,
    );

    Cluster {
        service_accounts: caches.namespaced(ObjectKind::ServiceAccount, managed(), Required),
        cluster_roles: caches.cluster_scoped(ObjectKind::ClusterRole, managed(), Required),
        cluster_role_bindings: caches.cluster_scoped(ObjectKind::ClusterRoleBinding, managed(), Required),
        roles: caches.namespaced(ObjectKind::Role, managed(), Required),
        role_bindings: caches.namespaced(ObjectKind::RoleBinding, managed(), Required),
        crds: caches.cluster_scoped(ObjectKind::CustomResourceDefinition, managed(), Required),
        services: caches.namespaced(ObjectKind::Service, managed(), Required),
        deployments: caches.namespaced(ObjectKind::Deployment, managed(), Required),
        daemon_sets: caches.namespaced(ObjectKind::DaemonSet, managed(), Required),
        pod_disruption_budgets: caches.namespaced(ObjectKind::PodDisruptionBudget, managed(), Required),
        validating_webhooks: caches.cluster_scoped(
            ObjectKind::ValidatingWebhookConfiguration,
            managed(),
            Required,
        ),
        mutating_webhooks: caches.cluster_scoped(
            ObjectKind::MutatingWebhookConfiguration,
            managed(),
            Required,
        ),
        api_services: caches.cluster_scoped(ObjectKind::ApiService, managed(), Required),
        secrets: caches.namespaced(ObjectKind::Secret, managed(), Required),
        config_maps: caches.namespaced(ObjectKind::ConfigMap, managed(), Required),
        // unfiltered: the privileged SCC is not ours but its users are edited
        sccs: caches.cluster_scoped::<SecurityContextConstraints>(
            ObjectKind::SecurityContextConstraints,
            watcher::Config::default(),
            Optional,
        ),
        routes: caches.namespaced::<Route>(ObjectKind::Route, managed(), Optional),
        service_monitors: caches.namespaced::<ServiceMonitor>(ObjectKind::ServiceMonitor, managed(), Optional),
        prometheus_rules: caches.namespaced::<PrometheusRule>(ObjectKind::PrometheusRule, managed(), Optional),
        instancetypes: caches.cluster_scoped::<VirtualMachineClusterInstancetype>(
            ObjectKind::VirtualMachineClusterInstancetype,
            managed(),
            Optional,
        ),
        preferences: caches.cluster_scoped::<VirtualMachineClusterPreference>(
            ObjectKind::VirtualMachineClusterPreference,
            managed(),
            Optional,
        ),
        namespaces: KindHandle::new(
            namespace_store,
            Arc::new(KubeKindClient::cluster(client.clone())),
        ),
        kubevirts: KindHandle::new(kubevirts_store, kubevirts_client),
        pods,
        install_strategies,
    }
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &OperatorConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}
