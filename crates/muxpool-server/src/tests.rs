use crate::{ServerBuilder, health::check_health};
use core::time::Duration;
use muxpool::{
    CallContext, CallOptions, Error, Headers, PoolConfig, ServicePool, ServicePoolBuilder,
    retry::{RetryConfig, RetryError},
};
use std::net::SocketAddr;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, codec::CompressionEncoding};
use tonic_health::{
    ServingStatus as ReportedStatus,
    pb::{HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus},
};

const HEALTH: &str = "grpc.health.v1.Health";
const CHECK: &str = "/grpc.health.v1.Health/Check";

struct Running {
    addr: SocketAddr,
    reporter: tonic_health::server::HealthReporter,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(builder: ServerBuilder) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = builder.build().unwrap();
    let reporter = server.health_reporter().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    let task = tokio::spawn(server.serve_with_incoming_shutdown(
        TcpListenerStream::new(listener),
        async move {
            let _ = stopped.await;
        },
    ));

    Running {
        addr,
        reporter,
        stop,
        task,
    }
}

fn pools(addr: SocketAddr) -> ServicePool {
    ServicePoolBuilder::grpc(
        PoolConfig::default()
            .with_pool_size(2)
            .with_dial_timeout(Duration::from_secs(2)),
    )
    .register_endpoint_services(addr.to_string(), [HEALTH])
    .start()
}

async fn check(pools: &ServicePool, service: &str) -> muxpool::Result<ServingStatus> {
    let response: HealthCheckResponse = pools
        .invoke(
            &CallContext::new().with_timeout(Duration::from_secs(5)),
            CHECK,
            &Headers::from([("x-check".to_owned(), "e2e".to_owned())]),
            HealthCheckRequest {
                service: service.to_owned(),
            },
            CallOptions::default(),
        )
        .await?;
    Ok(response.status())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_check_round_trips_through_the_pool() {
    let server = start(
        ServerBuilder::new()
            .enable_health()
            .enable_reflection()
            .health_services(["billing.Invoices"]),
    )
    .await;
    let pools = pools(server.addr);

    assert_eq!(check(&pools, "").await.unwrap(), ServingStatus::Serving);
    assert_eq!(
        check(&pools, "billing.Invoices").await.unwrap(),
        ServingStatus::Serving
    );

    // Unknown services come back as a NOT_FOUND status, passed through as-is.
    match check(&pools, "nobody.Home").await {
        Err(Error::Rpc(status)) => assert_eq!(status.code(), Code::NotFound),
        other => panic!("expected an RPC error, got {other:?}"),
    }

    // Status changes made through the reporter are visible to the next call.
    server
        .reporter
        .set_service_status("billing.Invoices", ReportedStatus::NotServing)
        .await;
    assert_eq!(
        check(&pools, "billing.Invoices").await.unwrap(),
        ServingStatus::NotServing
    );

    // Both slots were used, each dialed once.
    let stats = pools.pool(HEALTH).unwrap().stats();
    assert_eq!(stats.dials, 2);
    assert_eq!(stats.dial_failures, 0);

    pools.close_all().await;
    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn draining_reports_not_serving_for_every_managed_service() {
    let server = start(ServerBuilder::new().enable_health().health_services(["a.B"])).await;
    let pools = pools(server.addr);
    assert_eq!(check(&pools, "a.B").await.unwrap(), ServingStatus::Serving);

    // The same hook runs when the real shutdown signal fires; calling it with
    // a ready signal keeps the server up so the flip can be observed.
    crate::builder::drain(
        async {},
        Some(server.reporter.clone()),
        vec!["a.B".to_owned()],
    )
    .await;

    assert_eq!(check(&pools, "").await.unwrap(), ServingStatus::NotServing);
    assert_eq!(check(&pools, "a.B").await.unwrap(), ServingStatus::NotServing);

    pools.close_all().await;
    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_server_surfaces_dial_failure() {
    // Bind and immediately drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let pools = pools(addr);

    match check(&pools, "").await {
        Err(Error::DialFailed { endpoint, .. }) => assert_eq!(endpoint, addr.to_string()),
        other => panic!("expected DialFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn server_without_health_has_no_reporter() {
    let server = ServerBuilder::new().enable_reflection().build().unwrap();
    assert!(server.health_reporter().is_none());
}

const QUICK_RETRY: RetryConfig = RetryConfig::new(4, Duration::from_millis(10));

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_is_answered_without_retrying() {
    let server = start(ServerBuilder::new().enable_health()).await;
    let pools = pools(server.addr);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let status = check_health(&pools, &ctx, &Headers::new(), QUICK_RETRY, &cancel, "")
        .await
        .unwrap();
    assert_eq!(status, ServingStatus::Serving);

    match check_health(&pools, &ctx, &Headers::new(), QUICK_RETRY, &cancel, "nobody.Home").await {
        Err(RetryError::Permanent { attempt, error }) => {
            assert_eq!(attempt, 1);
            assert_eq!(error.status().map(|s| s.code()), Some(Code::NotFound));
        }
        other => panic!("expected a permanent failure, got {other:?}"),
    }

    pools.close_all().await;
    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_server_is_retried_until_exhausted() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let pools = pools(addr);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));

    let err = check_health(
        &pools,
        &ctx,
        &Headers::new(),
        QUICK_RETRY,
        &CancellationToken::new(),
        "",
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RetryError::Exhausted {
            attempts: 4,
            last: Error::DialFailed { .. }
        }
    ));
    assert_eq!(pools.pool(HEALTH).unwrap().stats().dial_failures, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_layer_and_compression_keep_calls_intact() {
    let server = start(
        ServerBuilder::new()
            .enable_health()
            .enable_metrics()
            .compression(CompressionEncoding::Gzip)
            .health_services(["billing.Invoices"]),
    )
    .await;
    let pools = pools(server.addr);

    for service in ["", "billing.Invoices"] {
        let response: HealthCheckResponse = pools
            .invoke(
                &CallContext::new().with_timeout(Duration::from_secs(5)),
                CHECK,
                &Headers::new(),
                HealthCheckRequest {
                    service: service.to_owned(),
                },
                CallOptions::default().with_compression(CompressionEncoding::Gzip),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), ServingStatus::Serving);
    }

    // Failed handlers still surface their status through the layer.
    match check(&pools, "nobody.Home").await {
        Err(Error::Rpc(status)) => assert_eq!(status.code(), Code::NotFound),
        other => panic!("expected an RPC error, got {other:?}"),
    }

    pools.close_all().await;
    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}
