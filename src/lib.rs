//! # virt-operator
//!
//! Installs, upgrades and removes a virtualization control plane on
//! Kubernetes from a rendered install strategy.
//!
//! The [`controller`] module holds the reconcile logic and runs against any
//! [`controller::cluster::Cluster`], either backed by reflector caches and
//! the API ([`runtime`]) or by the in-memory [`controller::fake`].

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod error;
pub mod observability;
pub mod runtime;

pub use crd::{KubeVirt, KubeVirtSpec, KubeVirtStatus};
pub use error::ReconcileError;
