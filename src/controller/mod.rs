//! # Controller
//!
//! Reconciliation of the virtualization control plane: the install strategy,
//! per-kind syncing against cached cluster state, certificates, the node
//! daemonset canary and the lifecycle of the `KubeVirt` resource.

pub mod backoff;
pub mod canary;
pub mod certificates;
pub mod client;
pub mod cluster;
pub mod events;
pub mod expectations;
pub mod fake;
pub mod kinds;
pub mod patch;
pub mod pki;
pub mod placement;
pub mod queue;
pub mod rbac;
pub mod reconciler;
pub mod scc;
pub mod server;
pub mod stamp;
pub mod store;
pub mod strategy;
pub mod syncer;
pub mod webhooks;
pub mod workloads;
