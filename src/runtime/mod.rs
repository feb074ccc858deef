//! # Runtime Module
//!
//! Runtime components of the operator: initialization, the reflector
//! caches, the watch loop and error handling.

pub mod error_policy;
pub mod informers;
pub mod initialization;
pub mod watch_loop;

pub use error_policy::*;
pub use initialization::*;
pub use watch_loop::*;
