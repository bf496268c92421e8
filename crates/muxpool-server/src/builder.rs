//! Server bootstrap.
//!
//! [`ServerBuilder`] assembles a tonic server with the standard side services
//! switched on or off: `grpc.health.v1.Health`, server reflection, response
//! compression, per-RPC metrics, HTTP/2 keep-alive and (with the `tls`
//! feature) mutual TLS. Application services
//! are added with [`ServerBuilder::add_service`].
//!
//! [`GrpcServer`] serves until a shutdown future resolves. Before the listener
//! stops, every health status it manages flips to `NOT_SERVING`, so health
//! checkers observe the drain.

use crate::metrics::RpcMetricsLayer;
use core::{convert::Infallible, future::Future, time::Duration};
use futures::Stream;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::{
    body::Body,
    codec::CompressionEncoding,
    codegen::{
        Service,
        http::{Request, Response},
    },
    server::NamedService,
    service::{Routes, RoutesBuilder},
    transport::{Server, server::Connected},
};
use tonic_health::{ServingStatus, server::HealthReporter};
use tower::layer::util::{Identity, Stack};

/// Health status name for the server as a whole.
const OVERALL: &str = "";

#[derive(Default)]
pub struct ServerBuilder {
    reflection: bool,
    health: bool,
    health_services: Vec<String>,
    file_descriptor_sets: Vec<&'static [u8]>,
    keep_alive: Option<(Duration, Duration)>,
    compression: Option<CompressionEncoding>,
    metrics: bool,
    #[cfg(feature = "tls")]
    tls: Option<tonic::transport::ServerTlsConfig>,
    routes: RoutesBuilder,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `grpc.reflection.v1`, describing the health service and every
    /// descriptor set passed to [`register_file_descriptor_set`].
    ///
    /// [`register_file_descriptor_set`]: Self::register_file_descriptor_set
    #[must_use]
    pub fn enable_reflection(mut self) -> Self {
        self.reflection = true;
        self
    }

    /// Serves `grpc.health.v1.Health`. The server as a whole reports
    /// `SERVING` while it runs.
    #[must_use]
    pub fn enable_health(mut self) -> Self {
        self.health = true;
        self
    }

    /// Service names reported as `SERVING` alongside the overall status. Has
    /// no effect unless health is enabled.
    #[must_use]
    pub fn health_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.health_services
            .extend(services.into_iter().map(Into::into));
        self
    }

    /// An encoded `FileDescriptorSet` to expose through reflection.
    #[must_use]
    pub fn register_file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.file_descriptor_sets.push(encoded);
        self
    }

    /// Makes the health and reflection services accept requests compressed
    /// with `encoding` and compress their responses with it when the client
    /// advertises support. Application services configure their own.
    #[must_use]
    pub const fn compression(mut self, encoding: CompressionEncoding) -> Self {
        self.compression = Some(encoding);
        self
    }

    /// Records a request counter and a handling-time histogram for every RPC,
    /// keyed by method and status code. Recording needs the `metrics`
    /// feature and an installed meter; otherwise it costs a clock read.
    #[must_use]
    pub const fn enable_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Pings idle clients every `interval` and drops those that do not answer
    /// within `timeout`.
    #[must_use]
    pub const fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = Some((interval, timeout));
        self
    }

    /// Serves over TLS with the PEM `cert`/`key` identity. With `client_ca`,
    /// clients must present a certificate it signed.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls(mut self, cert: &[u8], key: &[u8], client_ca: Option<&[u8]>) -> Self {
        use tonic::transport::{Certificate, Identity, ServerTlsConfig};

        let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
        if let Some(ca) = client_ca {
            config = config.client_ca_root(Certificate::from_pem(ca));
        }
        self.tls = Some(config);
        self
    }

    /// Adds an application service, typically a generated `FooServer`.
    #[must_use]
    pub fn add_service<S>(mut self, service: S) -> Self
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.routes.add_service(service);
        self
    }

    /// Assembles the server.
    ///
    /// # Errors
    ///
    /// Fails if a registered descriptor set cannot be decoded, or if the TLS
    /// configuration is rejected.
    pub fn build(mut self) -> anyhow::Result<GrpcServer> {
        let health = if self.health {
            let (reporter, mut service) = tonic_health::server::health_reporter();
            if let Some(encoding) = self.compression {
                service = service
                    .accept_compressed(encoding)
                    .send_compressed(encoding);
            }
            self.routes.add_service(service);
            Some(reporter)
        } else {
            None
        };

        if self.reflection {
            let mut reflection = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
                .register_encoded_file_descriptor_set(
                    tonic_reflection::pb::v1::FILE_DESCRIPTOR_SET,
                );
            for encoded in self.file_descriptor_sets {
                reflection = reflection.register_encoded_file_descriptor_set(encoded);
            }
            let mut reflection = reflection.build_v1()?;
            if let Some(encoding) = self.compression {
                reflection = reflection
                    .accept_compressed(encoding)
                    .send_compressed(encoding);
            }
            self.routes.add_service(reflection);
        }

        let mut server = Server::builder();
        if let Some((interval, timeout)) = self.keep_alive {
            server = server
                .http2_keepalive_interval(Some(interval))
                .http2_keepalive_timeout(Some(timeout));
        }
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls {
            server = server.tls_config(tls)?;
        }
        let server = server.layer(RpcMetricsLayer::new(self.metrics));

        Ok(GrpcServer {
            server,
            routes: self.routes.routes(),
            health,
            health_services: self.health_services,
        })
    }
}

/// A configured server, ready to listen.
pub struct GrpcServer {
    server: Server<Stack<RpcMetricsLayer, Identity>>,
    routes: Routes,
    health: Option<HealthReporter>,
    health_services: Vec<String>,
}

impl GrpcServer {
    /// Handle for changing health statuses while the server runs. `None`
    /// when health is disabled.
    pub fn health_reporter(&self) -> Option<HealthReporter> {
        self.health.clone()
    }

    /// Binds `addr` and serves until `signal` resolves.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the server stops abnormally.
    pub async fn serve_with_shutdown<F>(self, addr: SocketAddr, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            mut server,
            routes,
            health,
            health_services,
        } = self;

        mark(health.as_ref(), &health_services, ServingStatus::Serving).await;

        #[cfg(feature = "tracing")]
        tracing::info!(%addr, "Serving gRPC");

        server
            .add_routes(routes)
            .serve_with_shutdown(addr, drain(signal, health, health_services))
            .await?;
        Ok(())
    }

    /// Serves connections from `incoming` until `signal` resolves.
    ///
    /// # Errors
    ///
    /// Fails if the server stops abnormally.
    pub async fn serve_with_incoming_shutdown<I, IO, IE, F>(
        self,
        incoming: I,
        signal: F,
    ) -> anyhow::Result<()>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<tower::BoxError>,
        F: Future<Output = ()>,
    {
        let Self {
            mut server,
            routes,
            health,
            health_services,
        } = self;

        mark(health.as_ref(), &health_services, ServingStatus::Serving).await;

        server
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, drain(signal, health, health_services))
            .await?;
        Ok(())
    }
}

async fn mark(health: Option<&HealthReporter>, services: &[String], status: ServingStatus) {
    let Some(reporter) = health else {
        return;
    };
    reporter.set_service_status(OVERALL, status).await;
    for service in services {
        reporter.set_service_status(service, status).await;
    }
}

/// Waits for `signal`, then reports `NOT_SERVING` before the server drains.
pub(crate) async fn drain<F>(signal: F, health: Option<HealthReporter>, services: Vec<String>)
where
    F: Future<Output = ()>,
{
    signal.await;

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    mark(health.as_ref(), &services, ServingStatus::NotServing).await;
}

/// Resolves on Ctrl+C, `SIGTERM` or, on unix, `SIGHUP`.
///
/// # Panics
///
/// If the signal handlers cannot be installed.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        _name = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received {} signal", _name);
        },
    }
}
