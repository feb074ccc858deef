//! # Constants
//!
//! Well-known label and annotation keys, object names, and default values
//! shared across the operator.

/// Label marking every object the operator owns
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on operator-owned objects
pub const MANAGED_BY_VALUE: &str = "virt-operator";

pub const APP_VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const APP_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const DEFAULT_APP_COMPONENT: &str = "compute";

/// Component label used by the install strategy to identify deployments and daemonsets
pub const APP_LABEL: &str = "kubevirt.io";

// Install strategy stamp annotations
pub const INSTALL_STRATEGY_VERSION_ANNOTATION: &str = "kubevirt.io/install-strategy-version";
pub const INSTALL_STRATEGY_REGISTRY_ANNOTATION: &str = "kubevirt.io/install-strategy-registry";
pub const INSTALL_STRATEGY_IDENTIFIER_ANNOTATION: &str = "kubevirt.io/install-strategy-identifier";
pub const GENERATION_ANNOTATION: &str = "kubevirt.io/generation";
pub const EPHEMERAL_BACKUP_ANNOTATION: &str = "kubevirt.io/ephemeral-backup-object";

/// Label carried by install strategy config maps
pub const INSTALL_STRATEGY_LABEL: &str = "kubevirt.io/install-strategy";
/// Config map key holding the multi-document strategy manifest
pub const INSTALL_STRATEGY_MANIFESTS_KEY: &str = "manifests";

// Certificates
pub const CERT_BYTES_KEY: &str = "tls.crt";
pub const KEY_BYTES_KEY: &str = "tls.key";
pub const CERT_DURATION_ANNOTATION: &str = "kubevirt.io/duration";
pub const CA_BUNDLE_KEY: &str = "ca-bundle";
pub const MAX_CERTIFICATES_IN_BUNDLE: usize = 50;
pub const KUBEVIRT_CA_NAME: &str = "kubevirt-ca";
pub const KUBEVIRT_EXPORT_CA_NAME: &str = "kubevirt-export-ca";
pub const EXPORT_PROXY_CERT_SECRET_NAME: &str = "kubevirt-exportproxy-certs";

/// CA rotation interval (7 days)
pub const DEFAULT_CA_ROTATE_INTERVAL: &str = "168h";
/// CA overlap interval, also the CA renew-before window
pub const DEFAULT_CA_OVERLAP_INTERVAL: &str = "24h";
pub const DEFAULT_CERT_ROTATE_INTERVAL: &str = "24h";
pub const DEFAULT_CERT_RENEW_BEFORE: &str = "18h";

// Temporary validating webhook blocking CR creation during an API rollover
pub const TMP_WEBHOOK_GENERATE_NAME: &str = "virt-operator-tmp-webhook";
pub const TMP_WEBHOOK_SERVICE_NAME: &str = "fake-validation-service";
pub const TMP_WEBHOOK_PATH_PREFIX: &str = "/fake-path";

// Namespace labelling
pub const CLUSTER_MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

/// Node OS selector defaulted into every workload
pub const NODE_OS_LABEL: &str = "kubernetes.io/os";
pub const NODE_OS_LINUX: &str = "linux";

/// Privileged SCC the operator removes its service accounts from after rollover
pub const PRIVILEGED_SCC_NAME: &str = "privileged";
pub const HANDLER_SERVICE_ACCOUNT: &str = "kubevirt-handler";
pub const API_SERVICE_ACCOUNT: &str = "kubevirt-apiserver";
pub const CONTROLLER_SERVICE_ACCOUNT: &str = "kubevirt-controller";

// Deployment roles
pub const VIRT_API_NAME: &str = "virt-api";
pub const VIRT_EXPORT_PROXY_NAME: &str = "virt-exportproxy";
pub const VIRT_SYNCHRONIZATION_NAME: &str = "virt-synchronization-controller";

// Feature gates
pub const EXPORT_FEATURE_GATE: &str = "VMExport";
pub const SYNCHRONIZATION_FEATURE_GATE: &str = "DecentralizedLiveMigration";

/// Finalizer held on the managed resource until every managed object is gone
pub const KUBEVIRT_FINALIZER: &str = "foregroundDeleteKubeVirt";

/// Finalizer held on managed definitions until their instances are gone
pub const COMPONENT_FINALIZER: &str = "kubevirt.io/virtOperatorFinalizer";

/// Field manager / event reporter name
pub const OPERATOR_NAME: &str = "virt-operator";

// Canary rollout
pub const CANARY_MAX_UNAVAILABLE: i32 = 1;
pub const ROLLOUT_MAX_UNAVAILABLE: &str = "10%";

// Runtime defaults
pub const DEFAULT_METRICS_PORT: u16 = 8443;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 1;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
pub const DEFAULT_EXPECTATIONS_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "kubevirt";
pub const DEFAULT_IMAGE_REGISTRY: &str = "quay.io/kubevirt";
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;
