//! Transport abstraction used by [`ConnectionPool`].
//!
//! A [`Connection`] is a long-lived multiplexed channel to one endpoint. Many
//! calls share it concurrently, so every method takes `&self`. A [`Dialer`]
//! creates connections; the pool owns what it dials and is the only party that
//! closes them.
//!
//! The production implementation lives in [`crate::grpc`]. Tests plug in
//! their own dialer to count dials and capture outgoing metadata.
//!
//! [`ConnectionPool`]: crate::ConnectionPool

use crate::config::PoolConfig;
use core::{future::Future, time::Duration};
use tonic::{
    Request, Response, Status, codec::CompressionEncoding, codegen::http::uri::PathAndQuery,
};
use tower::BoxError;

/// Connectivity of a [`Connection`], modelled on the gRPC channel states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    /// Whether a connection in this state may be handed to a caller.
    ///
    /// `Idle` and `Connecting` are usable: the transport reconnects on its own
    /// within those states, so the pool hands them out instead of redialing.
    pub const fn is_usable(self) -> bool {
        !matches!(self, Self::TransientFailure | Self::Shutdown)
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            _ => Self::Shutdown,
        }
    }
}

/// Per-call knobs applied on top of the pool-wide defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Sent as `grpc-timeout`. Overrides the context deadline when shorter.
    pub timeout: Option<Duration>,
    /// Compress the request with this encoding.
    pub send_compressed: Option<CompressionEncoding>,
    /// Advertise that a response compressed with this encoding is accepted.
    pub accept_compressed: Option<CompressionEncoding>,
    /// Overrides [`PoolConfig::max_send_message_size`] for this call.
    pub max_send_message_size: Option<usize>,
    /// Overrides [`PoolConfig::max_recv_message_size`] for this call.
    pub max_recv_message_size: Option<usize>,
}

impl CallOptions {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compressed = Some(encoding);
        self.accept_compressed = Some(encoding);
        self
    }
}

/// A shared, multiplexed channel to one endpoint.
pub trait Connection: Send + Sync + 'static {
    /// Current connectivity. Must not block.
    fn state(&self) -> ConnectivityState;

    /// Moves the connection to [`ConnectivityState::Shutdown`] and releases
    /// its transport. Calling it more than once is a no-op.
    fn close(&self);

    /// Performs one unary call of `path` (`/<service>/<method>`).
    fn unary<M1, M2>(
        &self,
        path: PathAndQuery,
        request: Request<M1>,
        options: CallOptions,
    ) -> impl Future<Output = Result<Response<M2>, Status>> + Send
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static;
}

/// Establishes [`Connection`]s to an endpoint.
///
/// Cloned once per pool when a routing table is started.
pub trait Dialer: Clone + Send + Sync + 'static {
    type Connection: Connection;

    /// Dials `endpoint` honouring the timeouts and limits in `config`.
    fn dial(
        &self,
        endpoint: &str,
        config: &PoolConfig,
    ) -> impl Future<Output = Result<Self::Connection, BoxError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failure_and_shutdown_are_unusable() {
        assert!(ConnectivityState::Idle.is_usable());
        assert!(ConnectivityState::Connecting.is_usable());
        assert!(ConnectivityState::Ready.is_usable());
        assert!(!ConnectivityState::TransientFailure.is_usable());
        assert!(!ConnectivityState::Shutdown.is_usable());
    }

    #[test]
    fn state_survives_u8_encoding() {
        for state in [
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Shutdown,
        ] {
            assert_eq!(ConnectivityState::from_u8(state as u8), state);
        }
    }
}
