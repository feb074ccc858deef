//! # Metrics Module
//!
//! Prometheus metrics for monitoring the operator, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup and registration
//! - `controller_metrics` - Reconcile passes, requeues and errors
//! - `install_metrics` - Object writes, canary state and certificate rotations

pub mod controller_metrics;
pub mod install_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use install_metrics::*;
pub use registry::*;
