//! Install, upgrade and delete cycles against the in-memory cluster.

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus, Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::sync::Arc;
use std::time::Duration;
use virt_operator::constants::{
    INSTALL_STRATEGY_LABEL, INSTALL_STRATEGY_MANIFESTS_KEY, INSTALL_STRATEGY_REGISTRY_ANNOTATION,
    INSTALL_STRATEGY_VERSION_ANNOTATION, KUBEVIRT_FINALIZER, MANAGED_BY_LABEL,
};
use virt_operator::config::OperatorConfig;
use virt_operator::controller::events::EventRecorder;
use virt_operator::controller::expectations::Expectations;
use virt_operator::controller::fake::{FakeCluster, RecordedEvents, Verb};
use virt_operator::controller::pki::RcgenIssuer;
use virt_operator::controller::queue::DelayedRequeue;
use virt_operator::controller::reconciler::status::{condition_is_true, CONDITION_AVAILABLE};
use virt_operator::controller::reconciler::{Dependencies, InstallationController, Outcome};
use virt_operator::crd::KubeVirtPhase;
use virt_operator::{KubeVirt, KubeVirtSpec};

const NAMESPACE: &str = "kubevirt";
const REGISTRY: &str = "quay.io/kubevirt";
const MAX_PASSES: usize = 10;

fn manifests(version: &str) -> String {
    format!(
        r"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: kubevirt-apiserver
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: kubevirt-apiserver
rules:
- apiGroups: ['']
  resources: ['configmaps']
  verbs: ['get', 'list', 'watch']
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: kubevirt-apiserver
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: kubevirt-apiserver
subjects:
- kind: ServiceAccount
  name: kubevirt-apiserver
  namespace: kubevirt
---
apiVersion: v1
kind: Secret
metadata:
  name: kubevirt-ca
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: kubevirt-ca
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: virt-api
  labels:
    kubevirt.io: virt-api
spec:
  replicas: 2
  selector:
    matchLabels:
      kubevirt.io: virt-api
  template:
    metadata:
      labels:
        kubevirt.io: virt-api
    spec:
      containers:
      - name: virt-api
        image: {REGISTRY}/virt-api:{version}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: virt-controller
  labels:
    kubevirt.io: virt-controller
spec:
  replicas: 2
  selector:
    matchLabels:
      kubevirt.io: virt-controller
  template:
    metadata:
      labels:
        kubevirt.io: virt-controller
    spec:
      containers:
      - name: virt-controller
        image: {REGISTRY}/virt-controller:{version}
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: virt-handler
  labels:
    kubevirt.io: virt-handler
spec:
  selector:
    matchLabels:
      kubevirt.io: virt-handler
  template:
    metadata:
      labels:
        kubevirt.io: virt-handler
    spec:
      containers:
      - name: virt-handler
        image: {REGISTRY}/virt-handler:{version}
"
    )
}

/// RFC 3339 timestamp `secs` after the epoch
fn timestamp(secs: i64) -> Time {
    let rfc3339 = chrono::DateTime::from_timestamp(secs, 0)
        .expect("timestamp in range")
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(rfc3339)).expect("valid timestamp")
}

fn strategy_config_map(version: &str, created: i64) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("kubevirt-install-strategy-{version}")),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some([(INSTALL_STRATEGY_LABEL.to_string(), String::new())].into()),
            annotations: Some(
                [
                    (INSTALL_STRATEGY_VERSION_ANNOTATION.to_string(), version.to_string()),
                    (INSTALL_STRATEGY_REGISTRY_ANNOTATION.to_string(), REGISTRY.to_string()),
                ]
                .into(),
            ),
            creation_timestamp: Some(timestamp(created)),
            ..ObjectMeta::default()
        },
        data: Some([(INSTALL_STRATEGY_MANIFESTS_KEY.to_string(), manifests(version))].into()),
        ..ConfigMap::default()
    }
}

fn kubevirt(image_tag: &str) -> KubeVirt {
    let mut kv = KubeVirt::new(
        "kubevirt",
        KubeVirtSpec {
            image_tag: Some(image_tag.to_string()),
            ..KubeVirtSpec::default()
        },
    );
    kv.metadata.namespace = Some(NAMESPACE.to_string());
    kv.metadata.uid = Some("kv-uid".to_string());
    kv.metadata.generation = Some(1);
    kv
}

struct Harness {
    fake: FakeCluster,
    controller: InstallationController,
}

impl Harness {
    fn new(version: &str) -> Self {
        let fake = FakeCluster::new();
        fake.kind::<Namespace>().seed(Namespace {
            metadata: ObjectMeta {
                name: Some(NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        });
        fake.install_strategies.seed(strategy_config_map(version, 1_700_000_000));
        fake.kind::<KubeVirt>().seed(kubevirt(version));

        let deps = Dependencies {
            cluster: fake.cluster(),
            // the fake has no watch, so writes are never observed
            expectations: Arc::new(Expectations::new(Duration::ZERO)),
            recorder: Arc::new(RecordedEvents::default()) as Arc<dyn EventRecorder>,
            issuer: Arc::new(RcgenIssuer),
            migrations: Vec::new(),
        };
        let controller = InstallationController::new(deps, OperatorConfig::default());
        Self { fake, controller }
    }

    async fn pass(&self) -> Outcome {
        let queue = DelayedRequeue::new();
        self.controller
            .reconcile(NAMESPACE, "kubevirt", &queue)
            .await
            .expect("reconcile pass failed")
    }

    /// Report every workload as rolled out
    fn mark_workloads_ready(&self) {
        let deployments = self.fake.kind::<Deployment>();
        for deployment in deployments.objects() {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            deployments.modify(Some(NAMESPACE), &name, |d| {
                d.status = Some(DeploymentStatus {
                    ready_replicas: Some(2),
                    ..DeploymentStatus::default()
                });
            });
        }
        let daemon_sets = self.fake.kind::<DaemonSet>();
        for daemon_set in daemon_sets.objects() {
            let name = daemon_set.metadata.name.clone().unwrap_or_default();
            daemon_sets.modify(Some(NAMESPACE), &name, |ds| {
                ds.status = Some(DaemonSetStatus::default());
            });
        }
    }

    async fn run_until_complete(&self) {
        for _ in 0..MAX_PASSES {
            if self.pass().await == Outcome::Complete {
                return;
            }
            self.mark_workloads_ready();
        }
        panic!("installation did not complete within {MAX_PASSES} passes");
    }

    fn kv(&self) -> KubeVirt {
        self.fake
            .kind::<KubeVirt>()
            .object(Some(NAMESPACE), "kubevirt")
            .expect("KubeVirt resource missing")
    }
}

#[tokio::test]
async fn test_fresh_install_reaches_deployed() {
    let h = Harness::new("v1.1.0");

    assert_eq!(h.pass().await, Outcome::InProgress);
    assert!(h.fake.kind::<ServiceAccount>().object(Some(NAMESPACE), "kubevirt-apiserver").is_some());
    assert!(h.fake.kind::<ClusterRole>().object(None, "kubevirt-apiserver").is_some());
    assert!(h.fake.kind::<ClusterRoleBinding>().object(None, "kubevirt-apiserver").is_some());

    h.mark_workloads_ready();
    h.run_until_complete().await;

    let ca = h.fake.kind::<Secret>().object(Some(NAMESPACE), "kubevirt-ca").unwrap();
    assert!(ca.data.unwrap().contains_key("tls.crt"));

    let kv = h.kv();
    let status = kv.status.as_ref().unwrap();
    assert_eq!(status.phase, Some(KubeVirtPhase::Deployed));
    assert_eq!(status.observed_kube_virt_version.as_deref(), Some("v1.1.0"));
    assert_eq!(status.observed_kube_virt_registry.as_deref(), Some(REGISTRY));
    assert!(condition_is_true(status, CONDITION_AVAILABLE));
    assert!(kv
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == KUBEVIRT_FINALIZER));

    let ns = h.fake.kind::<Namespace>().object(None, NAMESPACE).unwrap();
    assert_eq!(
        ns.metadata.labels.unwrap().get("openshift.io/cluster-monitoring").map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn test_settled_install_issues_no_writes() {
    let h = Harness::new("v1.1.0");
    h.mark_workloads_ready();
    h.run_until_complete().await;

    h.fake.calls.clear();
    assert_eq!(h.pass().await, Outcome::Complete);

    let writes = h.fake.calls.writes();
    assert!(writes.is_empty(), "unexpected writes: {writes:#?}");
}

#[tokio::test]
async fn test_every_installed_object_is_stamped() {
    let h = Harness::new("v1.1.0");
    h.mark_workloads_ready();
    h.run_until_complete().await;

    let managed = |labels: Option<&std::collections::BTreeMap<String, String>>| {
        labels.is_some_and(|l| l.contains_key(MANAGED_BY_LABEL))
    };
    let version = |annotations: Option<&std::collections::BTreeMap<String, String>>| {
        annotations.and_then(|a| a.get(INSTALL_STRATEGY_VERSION_ANNOTATION)).cloned()
    };
    for deployment in h.fake.kind::<Deployment>().objects() {
        assert!(managed(deployment.metadata.labels.as_ref()));
        assert_eq!(version(deployment.metadata.annotations.as_ref()).as_deref(), Some("v1.1.0"));
    }
    for sa in h.fake.kind::<ServiceAccount>().objects() {
        assert!(managed(sa.metadata.labels.as_ref()));
    }
}

#[tokio::test]
async fn test_upgrade_rolls_workloads_to_new_version() {
    let h = Harness::new("v1.1.0");
    h.mark_workloads_ready();
    h.run_until_complete().await;

    h.fake.install_strategies.seed(strategy_config_map("v1.2.0", 1_700_000_100));
    h.fake.kind::<KubeVirt>().modify(Some(NAMESPACE), "kubevirt", |kv| {
        kv.spec.image_tag = Some("v1.2.0".to_string());
        kv.metadata.generation = Some(2);
    });

    assert_ne!(h.pass().await, Outcome::Complete);
    let progressing = h.kv().status.unwrap();
    assert_eq!(progressing.target_kube_virt_version.as_deref(), Some("v1.2.0"));
    assert_eq!(progressing.observed_kube_virt_version.as_deref(), Some("v1.1.0"));

    h.mark_workloads_ready();
    h.run_until_complete().await;

    let status = h.kv().status.unwrap();
    assert_eq!(status.observed_kube_virt_version.as_deref(), Some("v1.2.0"));
    assert_eq!(status.observed_generation, Some(2));
    let api = h.fake.kind::<Deployment>().object(Some(NAMESPACE), "virt-api").unwrap();
    let image = api.spec.unwrap().template.spec.unwrap().containers[0].image.clone();
    assert_eq!(image.as_deref(), Some("quay.io/kubevirt/virt-api:v1.2.0"));
}

#[tokio::test]
async fn test_delete_removes_objects_then_releases_finalizer() {
    let h = Harness::new("v1.1.0");
    h.mark_workloads_ready();
    h.run_until_complete().await;

    h.fake.calls.clear();
    h.fake.kind::<KubeVirt>().modify(Some(NAMESPACE), "kubevirt", |kv| {
        kv.metadata.deletion_timestamp = Some(timestamp(1_800_000_000));
    });

    assert_eq!(h.pass().await, Outcome::InProgress);
    assert_eq!(h.kv().status.unwrap().phase, Some(KubeVirtPhase::Deleting));
    assert!(h.fake.kind::<Deployment>().objects().is_empty());
    assert!(h.fake.kind::<ClusterRole>().objects().is_empty());
    assert!(!h.fake.calls.writes_for("Deployment").is_empty());

    assert_eq!(h.pass().await, Outcome::Complete);
    assert!(h.fake.kind::<KubeVirt>().object(Some(NAMESPACE), "kubevirt").is_none());
    let deleted = h
        .fake
        .calls
        .writes_for("KubeVirt")
        .into_iter()
        .filter(|call| call.verb == Verb::PatchStatus)
        .filter_map(|call| call.body)
        .any(|status| status["phase"] == "Deleted");
    assert!(deleted);
    assert!(h
        .fake
        .calls
        .writes()
        .iter()
        .all(|call| call.verb != Verb::Create));
}
