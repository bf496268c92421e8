//! Service routing table and call dispatcher.
//!
//! Routing is configured in two phases. A [`ServicePoolBuilder`] collects which
//! services each endpoint hosts; [`ServicePoolBuilder::start`] then creates one
//! [`ConnectionPool`] per distinct endpoint and freezes the `service -> pool`
//! table into a [`ServicePool`]. The table never changes after that, so
//! lookups need no synchronization.
//!
//! ```no_run
//! use muxpool::{CallContext, CallOptions, Headers, PoolConfig, ServicePoolBuilder};
//!
//! # async fn run() -> muxpool::Result<()> {
//! let pools = ServicePoolBuilder::grpc(PoolConfig::default())
//!     .register_endpoint_services("10.0.0.7:50051", ["billing.Invoices", "billing.Refunds"])
//!     .register_endpoint_services("10.0.0.9:50051", ["users.Accounts"])
//!     .start();
//!
//! let ctx = CallContext::new();
//! let headers = Headers::from([("x-tenant".to_owned(), "acme".to_owned())]);
//! let _reply: () = pools
//!     .invoke(&ctx, "/users.Accounts/Ping", &headers, (), CallOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    CallContext, Error, Headers, Result,
    config::PoolConfig,
    grpc::GrpcDialer,
    pool::{ConnectionPool, PoolStats},
    transport::{CallOptions, Connection, Dialer},
};
use core::{fmt, time::Duration};
use std::{collections::HashMap, sync::Arc};
use tonic::{Request, Status, codegen::http::uri::PathAndQuery};

#[cfg(test)]
mod tests;

/// Collects endpoint to service registrations before the table is frozen.
#[derive(Debug, Clone)]
pub struct ServicePoolBuilder<D: Dialer = GrpcDialer> {
    config: PoolConfig,
    dialer: D,
    // Insertion order is kept so `start` is deterministic.
    endpoints: Vec<(String, Vec<String>)>,
}

impl ServicePoolBuilder<GrpcDialer> {
    /// A builder whose pools dial tonic channels.
    pub fn grpc(config: PoolConfig) -> Self {
        Self::new(config, GrpcDialer)
    }
}

impl<D: Dialer> ServicePoolBuilder<D> {
    pub fn new(config: PoolConfig, dialer: D) -> Self {
        Self {
            config,
            dialer,
            endpoints: Vec::new(),
        }
    }

    /// Declares that `endpoint` hosts `services`.
    ///
    /// An empty `services` list is ignored. Registering the same endpoint again
    /// appends to its service list.
    #[must_use]
    pub fn register_endpoint_services<I, S>(mut self, endpoint: impl Into<String>, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: Vec<String> = services.into_iter().map(Into::into).collect();
        if services.is_empty() {
            return self;
        }

        let endpoint = endpoint.into();
        match self.endpoints.iter_mut().find(|(e, _)| *e == endpoint) {
            Some((_, existing)) => existing.extend(services),
            None => self.endpoints.push((endpoint, services)),
        }
        self
    }

    /// Builds one pool per registered endpoint and publishes the routing
    /// table. No connection is dialed here.
    ///
    /// A service registered under several endpoints is routed to the one
    /// registered last.
    pub fn start(self) -> ServicePool<D> {
        let mut services = HashMap::new();
        let mut pools = Vec::with_capacity(self.endpoints.len());

        for (endpoint, names) in self.endpoints {
            let pool = Arc::new(ConnectionPool::new(
                endpoint,
                self.config,
                self.dialer.clone(),
            ));

            for name in names {
                if let Some(_previous) = services.insert(name, Arc::clone(&pool)) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        previous = _previous.endpoint(),
                        endpoint = pool.endpoint(),
                        "Service registered under more than one endpoint; routing to the latest"
                    );
                }
            }
            pools.push(pool);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoints = pools.len(),
            services = services.len(),
            "Started service routing table"
        );

        ServicePool { services, pools }
    }
}

/// Immutable `service -> pool` table plus the dispatcher over it.
///
/// Share it behind an [`Arc`]; every method takes `&self`.
pub struct ServicePool<D: Dialer = GrpcDialer> {
    services: HashMap<String, Arc<ConnectionPool<D>>>,
    // One entry per endpoint; used to close each pool exactly once.
    pools: Vec<Arc<ConnectionPool<D>>>,
}

/// Extracts the service from a full method name `/<service>/<method>`.
///
/// Anything that does not split into exactly `""`, service and method yields
/// the empty string, which no service is registered under.
pub fn resolve_service_name(full_method: &str) -> &str {
    let mut parts = full_method.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(service), Some(_method), None) => service,
        _ => "",
    }
}

impl<D: Dialer> ServicePool<D> {
    /// The pool serving `service`, if it is registered.
    pub fn pool(&self, service: &str) -> Option<&Arc<ConnectionPool<D>>> {
        self.services.get(service)
    }

    /// Registered service names, in no particular order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// One pool per endpoint, in registration order.
    pub fn pools(&self) -> &[Arc<ConnectionPool<D>>] {
        &self.pools
    }

    /// A connection to the endpoint hosting `service`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the service is not registered. Nothing is
    ///   dialed in that case.
    /// - [`Error::DialFailed`] if the pool had to dial and could not.
    pub async fn get_client(&self, service: &str) -> Result<Arc<D::Connection>> {
        self.lookup(service)?.acquire().await
    }

    /// Like [`get_client`](Self::get_client), resolving the service from a
    /// full method name first.
    pub async fn get_client_for_method(&self, full_method: &str) -> Result<Arc<D::Connection>> {
        self.get_client(resolve_service_name(full_method)).await
    }

    fn lookup(&self, service: &str) -> Result<&Arc<ConnectionPool<D>>> {
        self.services.get(service).ok_or_else(|| Error::NotFound {
            service: service.to_owned(),
        })
    }

    /// Performs the unary call `full_method` on a pooled connection.
    ///
    /// The outgoing metadata is a copy of the context's with `headers` set on
    /// top; `ctx` itself is never modified. The call deadline is the shorter of
    /// the context timeout and `options.timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unregistered service or malformed method.
    /// - [`Error::InvalidMetadata`] if a header cannot be encoded. The call is
    ///   not attempted.
    /// - [`Error::DialFailed`] if no connection could be obtained.
    /// - [`Error::Rpc`] with the status returned by the remote or transport.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, ctx, headers, request, options))
    )]
    pub async fn invoke<M1, M2>(
        &self,
        ctx: &CallContext,
        full_method: &str,
        headers: &Headers,
        request: M1,
        options: CallOptions,
    ) -> Result<M2>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        let pool = self.lookup(resolve_service_name(full_method))?;
        let path = PathAndQuery::try_from(full_method).map_err(|e| {
            Error::Rpc(Status::invalid_argument(format!(
                "invalid method path `{full_method}`: {e}"
            )))
        })?;
        let metadata = ctx.merged_metadata(headers)?;

        let conn = pool.acquire().await?;

        let mut request = Request::new(request);
        *request.metadata_mut() = metadata;
        let options = CallOptions {
            timeout: shorter(ctx.timeout(), options.timeout),
            ..options
        };

        let response = conn.unary(path, request, options).await?;
        Ok(response.into_inner())
    }

    /// Closes the pool serving `service`. Other services hosted on the same
    /// endpoint share that pool and are affected too. Unknown services are
    /// ignored.
    pub async fn close_service(&self, service: &str) {
        if let Some(pool) = self.services.get(service) {
            pool.close_all().await;
        }
    }

    /// Closes every pool. Idempotent; pools redial on the next call.
    pub async fn close_all(&self) {
        for pool in &self.pools {
            pool.close_all().await;
        }
    }

    /// Stats of every pool, keyed by endpoint.
    pub fn stats(&self) -> Vec<(&str, PoolStats)> {
        self.pools
            .iter()
            .map(|pool| (pool.endpoint(), pool.stats()))
            .collect()
    }
}

fn shorter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl<D: Dialer> fmt::Debug for ServicePool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePool")
            .field("services", &self.services.len())
            .field("pools", &self.pools)
            .finish()
    }
}
