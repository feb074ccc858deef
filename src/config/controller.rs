//! # Operator Configuration
//!
//! Operator settings loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS, DEFAULT_EXPECTATIONS_TIMEOUT_SECS,
    DEFAULT_IMAGE_REGISTRY, DEFAULT_METRICS_PORT, DEFAULT_OPERATOR_NAMESPACE,
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_SERVER_POLL_INTERVAL_MS,
    DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
};
use std::time::Duration;

/// Operator configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator runs in; the managed resource must live here
    pub namespace: String,
    /// Version installed when the resource does not override `imageTag`
    pub image_tag: String,
    /// Registry used when the resource does not override `imageRegistry`
    pub image_registry: String,
    /// Version string reported in `status.operatorVersion`
    pub operator_version: String,
    /// HTTP server port for metrics and health checks
    pub metrics_port: u16,
    /// Server startup timeout (seconds)
    pub startup_timeout_secs: u64,
    /// Server readiness poll interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Requeue interval after a successful pass (seconds)
    pub resync_interval_secs: u64,
    /// Error backoff lower bound (seconds)
    pub backoff_min_secs: u64,
    /// Error backoff upper bound (seconds)
    pub backoff_max_secs: u64,
    /// Pending expectations older than this count as satisfied (seconds)
    pub expectations_timeout_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            image_tag: env!("CARGO_PKG_VERSION").to_string(),
            image_registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            expectations_timeout_secs: DEFAULT_EXPECTATIONS_TIMEOUT_SECS,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let namespace = std::env::var("OPERATOR_NAMESPACE")
            .or_else(|_| std::env::var("POD_NAMESPACE"))
            .unwrap_or(defaults.namespace);
        Self {
            namespace,
            image_tag: env_var_or_default("OPERATOR_IMAGE_TAG", defaults.image_tag),
            image_registry: env_var_or_default("OPERATOR_IMAGE_REGISTRY", defaults.image_registry),
            operator_version: env_var_or_default("OPERATOR_VERSION", defaults.operator_version),
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout_secs,
            ),
            poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            ),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                defaults.resync_interval_secs,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", defaults.backoff_min_secs),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", defaults.backoff_max_secs),
            expectations_timeout_secs: env_var_or_default(
                "EXPECTATIONS_TIMEOUT_SECS",
                defaults.expectations_timeout_secs,
            ),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn expectations_timeout(&self) -> Duration {
        Duration::from_secs(self.expectations_timeout_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
