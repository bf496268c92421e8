//! Per-RPC server instrumentation.
//!
//! [`RpcMetricsLayer`] wraps every route of a [`GrpcServer`](crate::GrpcServer)
//! built with [`enable_metrics`](crate::ServerBuilder::enable_metrics). With the
//! `metrics` feature it records, once [`init`] has installed the instruments:
//!
//! | Instrument                  | Kind      | Unit | Attributes                          |
//! |-----------------------------|-----------|------|-------------------------------------|
//! | `rpc.server.requests`       | counter   |      | `rpc.method`, `rpc.grpc.status_code` |
//! | `rpc.server.handling_time`  | histogram | `ms` | `rpc.method`, `rpc.grpc.status_code` |

use core::{
    task::{Context, Poll},
    time::Duration,
};
use futures::future::BoxFuture;
use std::time::Instant;
use tonic::{
    Code,
    codegen::http::{HeaderMap, Request, Response},
};
use tower::{Layer, Service};

#[cfg(feature = "metrics")]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static HANDLING_TIME_MS: OnceLock<Histogram<f64>> = OnceLock::new();

/// Installs the server instruments on `meter`. Later calls are ignored.
#[cfg(feature = "metrics")]
pub fn init(meter: &Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("rpc.server.requests")
            .with_description("RPCs handled, by method and status code")
            .build(),
    );
    let _ = HANDLING_TIME_MS.set(
        meter
            .f64_histogram("rpc.server.handling_time")
            .with_unit("ms")
            .with_description("Time from request to response headers")
            .build(),
    );
}

#[cfg(feature = "metrics")]
fn record(method: &str, code: Code, elapsed: Duration) {
    let attributes = [
        KeyValue::new("rpc.method", method.to_owned()),
        KeyValue::new("rpc.grpc.status_code", i64::from(i32::from(code))),
    ];
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &attributes);
    }
    if let Some(histogram) = HANDLING_TIME_MS.get() {
        histogram.record(elapsed.as_secs_f64() * 1_000.0, &attributes);
    }
}

#[cfg(not(feature = "metrics"))]
fn record(_method: &str, _code: Code, _elapsed: Duration) {}

/// Status code of a response as seen at its headers.
///
/// tonic answers a failed handler trailers-only, so its `grpc-status` is in
/// the headers. A status sent in trailers after a body is counted as `OK`.
pub(crate) fn response_code(headers: &HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .map_or(Code::Ok, |value| Code::from_bytes(value.as_bytes()))
}

/// Layer producing [`RpcMetrics`]. A disabled layer passes calls through
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcMetricsLayer {
    enabled: bool,
}

impl RpcMetricsLayer {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetrics<S>;

    fn layer(&self, inner: S) -> RpcMetrics<S> {
        RpcMetrics {
            inner,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcMetrics<S> {
    inner: S,
    enabled: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RpcMetrics<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        if !self.enabled {
            return Box::pin(self.inner.call(request));
        }

        let method = request.uri().path().to_owned();
        let started = Instant::now();
        let response = self.inner.call(request);

        Box::pin(async move {
            let response = response.await;
            let code = match &response {
                Ok(response) => response_code(response.headers()),
                Err(_) => Code::Unknown,
            };
            record(&method, code, started.elapsed());
            response
        })
    }
}
