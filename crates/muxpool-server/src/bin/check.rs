//! Queries `grpc.health.v1.Health/Check` through a `muxpool` service pool.
//!
//! Every `--service` is checked concurrently over the same pool. Transport
//! failures are retried; a definitive answer from the server is not. The exit
//! code is non-zero unless every service reports `SERVING`.

use clap::Parser;
use futures::future::join_all;
use muxpool::{CallContext, ServicePoolBuilder};
use muxpool_server::{
    config::{CheckArgs, CheckConfig},
    health::{HEALTH_SERVICE, check_health},
    shutdown_signal,
    telemetry::init_telemetry,
};
use std::{process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tonic_health::pb::health_check_response::ServingStatus;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let args = CheckArgs::parse();
    let config = Arc::new(CheckConfig::try_from(args)?);

    let providers = init_telemetry("muxpool-check")?;

    let pools = Arc::new(
        ServicePoolBuilder::grpc(config.pool)
            .register_endpoint_services(config.endpoint.clone(), [HEALTH_SERVICE])
            .start(),
    );

    // Ctrl+C aborts outstanding retries instead of waiting them out.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let checks = config.services.iter().map(|service| {
        let pools = Arc::clone(&pools);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        let service = service.clone();
        async move {
            let ctx = CallContext::new().with_timeout(config.timeout);
            let outcome = check_health(
                &pools,
                &ctx,
                &config.headers,
                config.retry,
                &cancel,
                &service,
            )
            .await;
            (service, outcome)
        }
    });
    let results = join_all(checks).await;

    let mut healthy = true;
    println!("{:<40} | {:>12}", "Service", "Status");
    println!("{}", "-".repeat(55));
    for (service, outcome) in &results {
        let label = if service.is_empty() { "<server>" } else { service };
        match outcome {
            Ok(status) => {
                healthy &= *status == ServingStatus::Serving;
                println!("{:<40} | {:>12}", label, status.as_str_name());
            }
            Err(err) => {
                healthy = false;
                println!("{:<40} | {:>12}", label, "ERROR");
                eprintln!("  {label}: {err}");
            }
        }
    }

    #[cfg(feature = "tracing")]
    for (endpoint, stats) in pools.stats() {
        tracing::info!("Pool {}: {}", endpoint, stats);
    }

    pools.close_all().await;
    providers.shutdown();

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
