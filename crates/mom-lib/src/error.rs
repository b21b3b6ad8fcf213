//! Typed errors shared across the library
//!
//! Guest communication failures are [`RpcError`]s so callers can tell a
//! guest that is simply not answering from one that answered with garbage.
//! Plugin lookups and entity accessors have their own small enums. Anything
//! application-level propagates through `anyhow`.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single request/reply exchange with a guest server
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Timed out after {timeout:?} waiting for {message} response")]
    Timeout {
        message: &'static str,
        timeout: Duration,
    },

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Other side failed to process {message}: {error}")]
    Rejected { message: &'static str, error: String },

    #[error("Invalid {message} response: {reason}")]
    InvalidResponse {
        message: &'static str,
        reason: String,
    },

    #[error("Guest server is not ready after {attempts} attempts ({elapsed:?})")]
    ServerUnavailable { attempts: u32, elapsed: Duration },

    #[error("Transport is closed")]
    Closed,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// The other side answered, but the answer broke the envelope contract
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            RpcError::Rejected { .. } | RpcError::InvalidResponse { .. }
        )
    }
}

/// Failure reading a value out of an entity snapshot
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EntityError {
    #[error("No statistics collected for {entity}")]
    EmptyHistory { entity: String },

    #[error("Statistic '{key}' is not available for {entity}")]
    MissingStatistic { entity: String, key: String },

    #[error("Statistic '{key}' of {entity} is not numeric")]
    NonNumeric { entity: String, key: String },

    #[error("{entity} has no guest client")]
    NoGuestClient { entity: String },
}

/// Failure constructing a named plugin
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },

    #[error("{kind} '{name}' is already registered")]
    Duplicate { kind: &'static str, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_classification() {
        let timeout = RpcError::Timeout {
            message: "Inquiry",
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_message_error());

        let rejected = RpcError::Rejected {
            message: "Notify",
            error: "boom".to_string(),
        };
        assert!(rejected.is_message_error());
        assert_eq!(
            rejected.to_string(),
            "Other side failed to process Notify: boom"
        );
    }
}
