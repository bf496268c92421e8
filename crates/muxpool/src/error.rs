//! Error types for the connection pool and call dispatcher.
//!
//! This module defines the central `Error` enum returned by every pool and
//! routing operation. It implements `From<Error>` for `tonic::Status` so a
//! service that proxies calls through the pool can surface failures to its own
//! clients with an appropriate status code.
//!
//! ## Error Cases
//! - `NotFound`: No pool is registered for the service, or the method
//!   identifier was malformed and resolved to an empty service name.
//! - `DialFailed`: Establishing a replacement connection failed (refused,
//!   timed out, bad endpoint URI).
//! - `InvalidMetadata`: A caller-supplied header could not be encoded as gRPC
//!   metadata.
//! - `Rpc`: The call itself failed. The status is passed through untouched.
//!
//! An unhealthy connection is never reported on its own; it only triggers a
//! redial, whose failure surfaces as `DialFailed`.

use tonic::{Code, Status};
use tower::BoxError;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for pool, routing and dispatch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No pool serves this service name.
    #[error("No client registered for service `{service}`")]
    NotFound { service: String },

    /// A new connection to the endpoint could not be established.
    #[error("Failed to dial `{endpoint}`: {source}")]
    DialFailed {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// A header key or value is not valid ASCII gRPC metadata.
    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    /// The remote call returned a non-OK status.
    #[error(transparent)]
    Rpc(#[from] Status),
}

impl Error {
    /// Returns the remote status when the failure came from the call itself.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc(status) => Some(status),
            _ => None,
        }
    }

    /// Whether another attempt might succeed: the endpoint could not be
    /// reached, or the call ended in `UNAVAILABLE` or `DEADLINE_EXCEEDED`.
    /// Anything else is an answer that a retry would only repeat.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DialFailed { .. } => true,
            Self::Rpc(status) => matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded),
            Self::NotFound { .. } | Self::InvalidMetadata { .. } => false,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { service } => {
                Status::not_found(format!("No client registered for service `{service}`"))
            }
            Error::DialFailed { endpoint, source } => {
                Status::unavailable(format!("Failed to dial `{endpoint}`: {source}"))
            }
            Error::InvalidMetadata { reason } => Status::invalid_argument(reason),
            Error::Rpc(status) => status,
        }
    }
}
