//! Error types for the cluster search service
//!
//! This module provides the request-level and teardown-level error types;
//! each subsystem (index, cache, ingress decode, worker emit) defines its
//! own thiserror enum and the request-level type wraps them.
//!
//! Propagation policy: every failure is handled at its point of detection.
//! A bad request is dropped and reported to the caller, never retried here.
//! The only teardown error is a failure to join the worker thread.

use thiserror::Error;

use crate::cache::CacheError;
use crate::ingress::DecodeError;

/// Errors from handling one inbound request.
///
/// Each variant corresponds to one drop point on the ingress path; none of
/// them affect other in-flight requests or the worker loop.
#[derive(Error, Debug)]
pub enum IngressError {
    /// No cluster ordinal could be parsed from the request key.
    #[error(
        "no cluster id found in request key '{key}'\nSuggestion: Keys must contain a 'cluster<N>' segment, e.g. '/rag/emb/cluster7/client0_qb3'"
    )]
    MalformedKey { key: String },

    /// Cold-cluster load failed; nothing was cached and the cluster stays
    /// eligible for retry on the next request.
    #[error("cluster load failed: {0}")]
    Load(#[from] CacheError),

    /// The payload could not be decoded into a query batch.
    #[error("query batch decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The background search worker could not be spawned.
    #[error(
        "failed to start search worker: {0}\nSuggestion: Check the process thread limit (ulimit -u)"
    )]
    WorkerStart(#[from] std::io::Error),
}

impl IngressError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier the host can use in structured responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::MalformedKey { .. } => "MALFORMED_KEY",
            Self::Load(_) => "CLUSTER_LOAD_FAILED",
            Self::Decode(_) => "DECODE_FAILED",
            Self::WorkerStart(_) => "WORKER_START_FAILED",
        }
    }
}

/// Errors from service teardown.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error(
        "search worker thread panicked before it could be joined\nSuggestion: Check earlier log output for the worker's panic message"
    )]
    JoinFailed,
}

/// Result type alias for request handling
pub type IngressResult<T> = Result<T, IngressError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ClusterId;

    #[test]
    fn test_status_codes_are_stable() {
        let err = IngressError::MalformedKey {
            key: "no-cluster-here".to_string(),
        };
        assert_eq!(err.status_code(), "MALFORMED_KEY");

        let err = IngressError::Load(CacheError::PopulationFailed(ClusterId::new(1)));
        assert_eq!(err.status_code(), "CLUSTER_LOAD_FAILED");
    }

    #[test]
    fn test_malformed_key_message_names_the_key() {
        let err = IngressError::MalformedKey {
            key: "/rag/emb/oops".to_string(),
        };
        assert!(err.to_string().contains("/rag/emb/oops"));
    }
}
