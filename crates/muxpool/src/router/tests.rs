use super::*;
use crate::{
    testing::MockDialer,
    transport::ConnectivityState,
};
use core::time::Duration;

const BILLING: &str = "10.0.0.7:50051";
const USERS: &str = "10.0.0.9:50051";

fn table(dialer: &MockDialer) -> ServicePool<MockDialer> {
    ServicePoolBuilder::new(PoolConfig::default().with_pool_size(2), dialer.clone())
        .register_endpoint_services(BILLING, ["billing.Invoices", "billing.Refunds"])
        .register_endpoint_services(USERS, ["users.Accounts"])
        .start()
}

fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn resolves_only_three_segment_methods() {
    assert_eq!(resolve_service_name("/pkg.Service/Method"), "pkg.Service");
    assert_eq!(resolve_service_name("/grpc.health.v1.Health/Check"), "grpc.health.v1.Health");
    assert_eq!(resolve_service_name("bad"), "");
    assert_eq!(resolve_service_name("/onlyone"), "");
    assert_eq!(resolve_service_name("pkg.Service/Method"), "");
    assert_eq!(resolve_service_name("/pkg.Service/Method/extra"), "");
    assert_eq!(resolve_service_name(""), "");
}

#[tokio::test]
async fn unregistered_service_is_not_found_without_dialing() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);

    let err = pools.get_client("unregistered-service").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { ref service } if service == "unregistered-service"));

    for method in ["bad", "/onlyone"] {
        let err = pools.get_client_for_method(method).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { ref service } if service.is_empty()));
    }

    assert_eq!(dialer.dials(), 0);
}

#[tokio::test]
async fn services_on_one_endpoint_share_a_pool() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);

    let invoices = pools.pool("billing.Invoices").unwrap();
    let refunds = pools.pool("billing.Refunds").unwrap();
    let accounts = pools.pool("users.Accounts").unwrap();

    assert!(Arc::ptr_eq(invoices, refunds));
    assert!(!Arc::ptr_eq(invoices, accounts));
    assert_eq!(pools.pools().len(), 2);
    assert_eq!(invoices.endpoint(), BILLING);
    assert_eq!(invoices.capacity(), 2);

    // Starting the table dials nothing.
    assert_eq!(dialer.dials(), 0);

    let mut services: Vec<_> = pools.services().collect();
    services.sort_unstable();
    assert_eq!(services, ["billing.Invoices", "billing.Refunds", "users.Accounts"]);
}

#[tokio::test]
async fn registration_appends_and_ignores_empty_lists() {
    let dialer = MockDialer::new();
    let pools = ServicePoolBuilder::new(PoolConfig::default(), dialer.clone())
        .register_endpoint_services(BILLING, ["billing.Invoices"])
        .register_endpoint_services(USERS, Vec::<String>::new())
        .register_endpoint_services(BILLING, ["billing.Refunds"])
        .start();

    assert_eq!(pools.pools().len(), 1);
    assert!(pools.pool("billing.Refunds").is_some());
    assert!(matches!(
        pools.get_client("users.Accounts").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn later_endpoint_wins_for_a_duplicate_service() {
    let dialer = MockDialer::new();
    let pools = ServicePoolBuilder::new(PoolConfig::default(), dialer)
        .register_endpoint_services(BILLING, ["shared.Service"])
        .register_endpoint_services(USERS, ["shared.Service"])
        .start();

    assert_eq!(pools.pool("shared.Service").unwrap().endpoint(), USERS);
}

#[tokio::test]
async fn invoke_routes_by_service_and_sends_the_full_path() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);
    let ctx = CallContext::new();

    let (): () = pools
        .invoke(
            &ctx,
            "/users.Accounts/Get",
            &Headers::new(),
            (),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let calls = dialer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "/users.Accounts/Get");
    assert_eq!(pools.pool("users.Accounts").unwrap().stats().dials, 1);
    assert_eq!(pools.pool("billing.Invoices").unwrap().stats().dials, 0);
}

#[tokio::test]
async fn invoke_rotates_across_the_pooled_connections() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);
    let ctx = CallContext::new();

    for _ in 0..4 {
        pools
            .invoke::<(), ()>(
                &ctx,
                "/billing.Refunds/Issue",
                &Headers::new(),
                (),
                CallOptions::default(),
            )
            .await
            .unwrap();
    }

    let used: Vec<usize> = dialer.calls().iter().map(|call| call.connection).collect();
    assert_eq!(used, vec![0, 1, 0, 1]);
    assert_eq!(dialer.dials(), 2);
}

#[tokio::test]
async fn headers_never_leak_between_calls_sharing_a_context() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);

    let mut ctx = CallContext::new();
    ctx.insert("x-tenant", "acme").unwrap();

    pools
        .invoke::<(), ()>(
            &ctx,
            "/billing.Invoices/List",
            &headers(&[("x-first", "1")]),
            (),
            CallOptions::default(),
        )
        .await
        .unwrap();
    pools
        .invoke::<(), ()>(
            &ctx,
            "/billing.Invoices/List",
            &headers(&[("x-second", "2"), ("x-tenant", "override")]),
            (),
            CallOptions::default(),
        )
        .await
        .unwrap();

    let calls = dialer.calls();
    assert_eq!(calls.len(), 2);

    let first = &calls[0].metadata;
    assert_eq!(first.get("x-tenant").unwrap(), "acme");
    assert_eq!(first.get("x-first").unwrap(), "1");
    assert!(first.get("x-second").is_none());

    let second = &calls[1].metadata;
    assert_eq!(second.get("x-tenant").unwrap(), "override");
    assert_eq!(second.get("x-second").unwrap(), "2");
    assert!(second.get("x-first").is_none());

    // The caller's context is untouched.
    assert_eq!(ctx.metadata().len(), 1);
    assert_eq!(ctx.metadata().get("x-tenant").unwrap(), "acme");
}

#[tokio::test]
async fn invalid_header_is_rejected_before_dialing() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);

    let err = pools
        .invoke::<(), ()>(
            &CallContext::new(),
            "/users.Accounts/Get",
            &headers(&[("not a header", "v")]),
            (),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidMetadata { .. }));
    assert_eq!(dialer.dials(), 0);
    assert!(dialer.calls().is_empty());
}

#[tokio::test]
async fn deadline_is_the_shorter_of_context_and_options() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(5));

    pools
        .invoke::<(), ()>(
            &ctx,
            "/users.Accounts/Get",
            &Headers::new(),
            (),
            CallOptions::default().with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    pools
        .invoke::<(), ()>(&ctx, "/users.Accounts/Get", &Headers::new(), (), CallOptions::default())
        .await
        .unwrap();

    let timeouts = dialer.timeouts();
    assert_eq!(
        timeouts,
        vec![Some(Duration::from_secs(1)), Some(Duration::from_secs(5))]
    );
}

#[tokio::test]
async fn rpc_status_passes_through_unchanged() {
    let dialer = MockDialer::new();
    let pools = ServicePoolBuilder::new(PoolConfig::default().with_pool_size(1), dialer.clone())
        .register_endpoint_services(USERS, ["users.Accounts"])
        .start();

    // The connection stays usable; the remote status is returned as-is and
    // nothing is redialed.
    pools.get_client("users.Accounts").await.unwrap();
    dialer.fail_calls(tonic::Code::ResourceExhausted);

    let err = pools
        .invoke::<(), ()>(
            &CallContext::new(),
            "/users.Accounts/Get",
            &Headers::new(),
            (),
            CallOptions::default(),
        )
        .await
        .unwrap_err();

    let status = err.status().unwrap();
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn close_all_twice_leaves_every_slot_empty() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);
    pools.get_client("billing.Invoices").await.unwrap();
    pools.get_client("users.Accounts").await.unwrap();

    pools.close_all().await;
    pools.close_all().await;

    for pool in pools.pools() {
        assert!(pool.slot_states().iter().all(Option::is_none));
    }
    assert_eq!(dialer.state_of(0), ConnectivityState::Shutdown);
    assert_eq!(dialer.state_of(1), ConnectivityState::Shutdown);
}

#[tokio::test]
async fn close_service_closes_only_its_endpoint() {
    let dialer = MockDialer::new();
    let pools = table(&dialer);
    let billing = pools.get_client("billing.Refunds").await.unwrap();
    let users = pools.get_client("users.Accounts").await.unwrap();

    pools.close_service("billing.Invoices").await;
    pools.close_service("unknown.Service").await;

    assert_eq!(billing.state(), ConnectivityState::Shutdown);
    assert_eq!(users.state(), ConnectivityState::Ready);
}
