//! tonic-backed [`Dialer`] and [`Connection`].
//!
//! tonic does not expose the connectivity state of a [`Channel`], so
//! [`GrpcConnection`] tracks it from what it observes:
//!
//! - a successful dial or call moves it to `Ready`
//! - a failed readiness check, or a call that ends in `UNAVAILABLE`, moves it
//!   to `TransientFailure`
//! - [`Connection::close`] moves it to `Shutdown`, which is terminal
//!
//! Once a connection leaves the usable states the pool replaces it on the next
//! acquire that lands on its slot.

use crate::{
    config::PoolConfig,
    transport::{CallOptions, Connection, ConnectivityState, Dialer},
};
use arc_swap::ArcSwapOption;
use core::{
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};
use tonic::{
    Code, Request, Response, Status,
    client::Grpc,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
};
use tonic_prost::ProstCodec;
use tower::BoxError;

/// The dial did not complete within [`PoolConfig::dial_timeout`].
#[derive(Debug, thiserror::Error)]
#[error("dial timed out after {0:?}")]
pub struct DialTimeout(pub Duration);

/// Dials plaintext HTTP/2 channels with the pool's keep-alive, window and
/// timeout settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcDialer;

impl Dialer for GrpcDialer {
    type Connection = GrpcConnection;

    async fn dial(&self, endpoint: &str, config: &PoolConfig) -> Result<GrpcConnection, BoxError> {
        let target = Endpoint::from_shared(endpoint_uri(endpoint))?
            .connect_timeout(config.dial_timeout)
            .http2_keep_alive_interval(config.keep_alive_interval)
            .keep_alive_timeout(config.keep_alive_timeout)
            .keep_alive_while_idle(true)
            .initial_stream_window_size(Some(config.initial_stream_window_size))
            .initial_connection_window_size(Some(config.initial_connection_window_size));

        // `connect_timeout` bounds the TCP connect and the outer timeout the
        // whole `connect()`. Neither waits for the peer's HTTP/2 settings, so a
        // peer that accepts TCP but never speaks HTTP/2 is noticed by the first
        // call, bounded by its deadline.
        let channel = tokio::time::timeout(config.dial_timeout, target.connect())
            .await
            .map_err(|_| DialTimeout(config.dial_timeout))??;

        Ok(GrpcConnection::new(channel, config))
    }
}

/// Builds the URI tonic expects from a bare `host:port`.
fn endpoint_uri(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("http://{endpoint}")
    }
}

/// A shared tonic [`Channel`] plus the state observed on it.
pub struct GrpcConnection {
    channel: ArcSwapOption<Channel>,
    state: AtomicU8,
    max_send_message_size: usize,
    max_recv_message_size: usize,
}

impl GrpcConnection {
    fn new(channel: Channel, config: &PoolConfig) -> Self {
        Self {
            channel: ArcSwapOption::from_pointee(channel),
            state: AtomicU8::new(ConnectivityState::Ready as u8),
            max_send_message_size: config.max_send_message_size,
            max_recv_message_size: config.max_recv_message_size,
        }
    }

    /// A clone of the underlying channel, for use with generated tonic
    /// clients. `None` once the connection has been closed.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.load_full().map(|channel| Channel::clone(&channel))
    }

    /// Records a transition unless the connection is already shut down.
    fn transition(&self, next: ConnectivityState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectivityState::Shutdown as u8).then_some(next as u8)
            });
    }

    fn observe<T>(&self, result: &Result<T, Status>) {
        match result {
            Ok(_) => self.transition(ConnectivityState::Ready),
            Err(status) if status.code() == Code::Unavailable => {
                self.transition(ConnectivityState::TransientFailure);
            }
            Err(_) => {}
        }
    }
}

impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn close(&self) {
        self.state
            .store(ConnectivityState::Shutdown as u8, Ordering::Release);
        // In-flight calls hold their own clone; the transport goes away when
        // the last one finishes.
        self.channel.store(None);
    }

    async fn unary<M1, M2>(
        &self,
        path: PathAndQuery,
        mut request: Request<M1>,
        options: CallOptions,
    ) -> Result<Response<M2>, Status>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        let Some(channel) = self.channel() else {
            return Err(Status::unavailable("connection is closed"));
        };

        if let Some(timeout) = options.timeout {
            request.set_timeout(timeout);
        }

        let mut grpc = Grpc::new(channel)
            .max_encoding_message_size(
                options
                    .max_send_message_size
                    .unwrap_or(self.max_send_message_size),
            )
            .max_decoding_message_size(
                options
                    .max_recv_message_size
                    .unwrap_or(self.max_recv_message_size),
            );
        if let Some(encoding) = options.send_compressed {
            grpc = grpc.send_compressed(encoding);
        }
        if let Some(encoding) = options.accept_compressed {
            grpc = grpc.accept_compressed(encoding);
        }

        if let Err(e) = grpc.ready().await {
            self.transition(ConnectivityState::TransientFailure);
            return Err(Status::unavailable(format!("Service was not ready: {e}")));
        }

        let result = grpc.unary(request, path, ProstCodec::default()).await;
        self.observe(&result);
        result
    }
}

impl Drop for GrpcConnection {
    fn drop(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(state = ?self.state(), "Dropping gRPC connection");
    }
}
