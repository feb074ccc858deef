//! # Errors
//!
//! Error types surfaced by a reconcile pass.

use crate::controller::client::ClientError;
use crate::controller::kinds::ObjectKind;
use crate::controller::pki::PkiError;
use crate::controller::strategy::StrategyError;
use thiserror::Error;

/// Errors that abort a reconcile pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A call to the cluster API failed
    #[error("unable to {verb} {kind} {name}: {source}")]
    Api {
        verb: &'static str,
        kind: ObjectKind,
        name: String,
        #[source]
        source: ClientError,
    },

    /// A patch or object could not be serialized
    #[error("unable to serialize {kind} {name}: {source}")]
    Serialization {
        kind: ObjectKind,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A desired object is missing a field the operator relies on
    #[error("invalid {kind} in install strategy: {message}")]
    InvalidObject { kind: ObjectKind, message: String },

    /// The node daemonset canary is crash-looping
    #[error("daemonset {name} rollout failed: {reason}")]
    RolloutFailed { name: String, reason: String },

    #[error("namespace {0} not found")]
    MissingNamespace(String),

    #[error("certificate {name}: {source}")]
    Certificate {
        name: String,
        #[source]
        source: PkiError,
    },

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

impl ReconcileError {
    /// Short machine-readable reason used for metrics labels and conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Api { .. } => "ApiError",
            Self::Serialization { .. } => "SerializationError",
            Self::InvalidObject { .. } => "InvalidStrategyObject",
            Self::RolloutFailed { .. } => "RolloutFailed",
            Self::MissingNamespace(_) => "MissingNamespace",
            Self::Certificate { .. } => "CertificateError",
            Self::Strategy(_) => "StrategyError",
        }
    }

    /// Whether retrying the same pass can succeed without outside changes
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { .. } | Self::RolloutFailed { .. } | Self::MissingNamespace(_) => true,
            Self::Strategy(err) => err.is_transient(),
            Self::Serialization { .. } | Self::InvalidObject { .. } | Self::Certificate { .. } => {
                false
            }
        }
    }

    pub(crate) fn api(
        verb: &'static str,
        kind: ObjectKind,
        name: impl Into<String>,
        source: ClientError,
    ) -> Self {
        Self::Api {
            verb,
            kind,
            name: name.into(),
            source,
        }
    }

    pub(crate) fn serialization(
        kind: ObjectKind,
        name: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Self::Serialization {
            kind,
            name: name.into(),
            source,
        }
    }
}
