//! # Configuration
//!
//! Operator settings loaded from the environment and duration helpers shared
//! by the certificate rotation strategy.

pub mod controller;
pub mod duration;

pub use controller::OperatorConfig;
pub use duration::{format_duration, parse_kubernetes_duration};
