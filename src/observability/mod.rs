//! # Observability
//!
//! Prometheus metrics exported by the operator.

pub mod metrics;
