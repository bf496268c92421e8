//! `grpc.health.v1.Health/Check` through a [`ServicePool`].

use muxpool::{
    CallContext, CallOptions, Dialer, Headers, ServicePool,
    retry::{RetryConfig, RetryError, retry_if},
};
use tokio_util::sync::CancellationToken;
use tonic_health::pb::{
    HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus,
};

/// Service name to register the checked endpoint under.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";
pub const CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

/// Asks for the health of `service` (`""` for the server as a whole).
///
/// Only transient failures are retried. A status the server answered with,
/// such as `NOT_FOUND` for an unknown service, ends the check at once.
///
/// # Errors
///
/// - [`RetryError::Permanent`] for a failure another attempt cannot fix.
/// - [`RetryError::Exhausted`] when every attempt failed transiently.
/// - [`RetryError::Cancelled`] once `cancel` fires.
pub async fn check_health<D: Dialer>(
    pools: &ServicePool<D>,
    ctx: &CallContext,
    headers: &Headers,
    retry: RetryConfig,
    cancel: &CancellationToken,
    service: &str,
) -> Result<ServingStatus, RetryError<muxpool::Error>> {
    let response: HealthCheckResponse =
        retry_if(retry, cancel, muxpool::Error::is_transient, || async {
            let request = HealthCheckRequest {
                service: service.to_owned(),
            };
            pools
                .invoke(ctx, CHECK_METHOD, headers, request, CallOptions::default())
                .await
        })
        .await?;

    Ok(response.status())
}
