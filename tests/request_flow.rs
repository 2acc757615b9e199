//! End-to-end request flow through a full container tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harbor::container::Container;
use harbor::dispatch::Dispatcher;
use harbor::interceptor::MappingTarget;
use harbor::routing::UrlPattern;
use harbor::{Handler, Request, Response, Result};

mod common;

use common::{body, echo_factory, standard_server, FlakyHandler, ParkingHandler, TaggingInterceptor};

#[tokio::test]
async fn test_routing_end_to_end() {
    let server = standard_server().await;

    // Exact beats prefix.
    let mut req = Request::new("http", "localhost", "GET", "/app/reports/summary");
    let res = server.invoke(&mut req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body(&res), "exact|/reports/summary|-");
    assert_eq!(req.context_path(), "/app");

    // Prefix match yields path info.
    let mut req = Request::new("http", "localhost", "GET", "/app/reports/q1/details");
    let res = server.invoke(&mut req).await;
    assert_eq!(body(&res), "prefix|/reports|/q1/details");

    // Extension match outside the prefix subtree.
    let mut req = Request::new("http", "localhost", "GET", "/app/export.csv");
    let res = server.invoke(&mut req).await;
    assert_eq!(body(&res), "ext|/export.csv|-");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_alias_and_default_host_routing() {
    let server = standard_server().await;

    // Alias resolves to the same host, case-insensitively.
    let mut req = Request::new("http", "WWW.Localhost", "GET", "/app/export.csv");
    assert_eq!(server.invoke(&mut req).await.status(), 200);

    // An unknown server name falls back to the designated default host.
    let mut req = Request::new("http", "elsewhere.example", "GET", "/app/export.csv");
    assert_eq!(server.invoke(&mut req).await.status(), 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_misses_produce_404s() {
    let server = standard_server().await;

    // No context for the path.
    let mut req = Request::new("http", "localhost", "GET", "/elsewhere/x");
    assert_eq!(server.invoke(&mut req).await.status(), 404);

    // Context matches but no handler pattern does.
    let mut req = Request::new("http", "localhost", "GET", "/app/unmapped");
    assert_eq!(server.invoke(&mut req).await.status(), 404);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_interceptors_wrap_the_handler_in_order() {
    let server = standard_server().await;
    let engine = server.engine();
    let ctx = engine
        .find_child("localhost")
        .unwrap()
        .find_child("app")
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ctx.interceptors().unwrap();
    registry.define(
        "outer",
        Arc::new(TaggingInterceptor {
            tag: "outer",
            log: log.clone(),
        }),
        Default::default(),
    );
    registry.define(
        "inner",
        Arc::new(TaggingInterceptor {
            tag: "inner",
            log: log.clone(),
        }),
        Default::default(),
    );
    registry.add_mapping(
        "outer",
        MappingTarget::Pattern(UrlPattern::parse("/reports/*").unwrap()),
    );
    registry.add_mapping("inner", MappingTarget::Handler("prefix".into()));

    let mut req = Request::new("http", "localhost", "GET", "/app/reports/q1");
    let res = server.invoke(&mut req).await;
    assert_eq!(body(&res), "prefix|/reports|/q1");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer:in", "inner:in", "inner:out", "outer:out"]
    );

    // A request for a different wrapper skips both mappings.
    log.lock().unwrap().clear();
    let mut req = Request::new("http", "localhost", "GET", "/app/export.csv");
    server.invoke(&mut req).await;
    assert!(log.lock().unwrap().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_interceptor_pattern_narrower_than_the_wrapper_mapping() {
    let server = standard_server().await;
    let ctx = server
        .engine()
        .find_child("localhost")
        .unwrap()
        .find_child("app")
        .unwrap();

    // The wrapper is mapped at /reports/*; the interceptor only covers
    // the /reports/q1 subtree, so it must select on the full
    // context-relative path, not the matched prefix.
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ctx.interceptors().unwrap();
    registry.define(
        "quarterly",
        Arc::new(TaggingInterceptor {
            tag: "q1",
            log: log.clone(),
        }),
        Default::default(),
    );
    registry.add_mapping(
        "quarterly",
        MappingTarget::Pattern(UrlPattern::parse("/reports/q1/*").unwrap()),
    );

    let mut req = Request::new("http", "localhost", "GET", "/app/reports/q1/details");
    let res = server.invoke(&mut req).await;
    assert_eq!(body(&res), "prefix|/reports|/q1/details");
    assert_eq!(*log.lock().unwrap(), vec!["q1:in", "q1:out"]);

    // Same wrapper, outside the interceptor's subtree.
    log.lock().unwrap().clear();
    let mut req = Request::new("http", "localhost", "GET", "/app/reports/q2");
    assert_eq!(server.invoke(&mut req).await.status(), 200);
    assert!(log.lock().unwrap().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_handler_503_and_recovery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = Container::engine("engine");
    let host = Container::host("localhost");
    engine.add_child(host.clone()).await.unwrap();
    let ctx = Container::context("app", "/app");
    let calls2 = calls.clone();
    ctx.add_child(Container::wrapper("flaky", Arc::new(move || -> Result<
        Arc<dyn Handler>,
    > {
        Ok(Arc::new(FlakyHandler {
            calls: calls2.clone(),
            retry_after: 30,
        }))
    })))
    .await
    .unwrap();
    ctx.add_handler_mapping("/flaky", "flaky").unwrap();
    host.add_child(ctx).await.unwrap();
    let server = harbor::Server::new(engine);
    server.start().await.unwrap();

    // First call: the handler declares a 30s window, the stage answers
    // 503 with a Retry-After hint.
    let mut req = Request::new("http", "localhost", "GET", "/app/flaky");
    let res = server.invoke(&mut req).await;
    assert_eq!(res.status(), 503);
    assert_eq!(res.header("Retry-After"), Some("30"));

    // Inside the window the wrapper rejects without reaching the handler.
    let mut req = Request::new("http", "localhost", "GET", "/app/flaky");
    assert_eq!(server.invoke(&mut req).await.status(), 503);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the window the wrapper restores itself lazily.
    tokio::time::advance(Duration::from_secs(31)).await;
    let mut req = Request::new("http", "localhost", "GET", "/app/flaky");
    let res = server.invoke(&mut req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(body(&res), "recovered");

    server.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exclusive_pool_bounds_concurrency() {
    let entered = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(tokio::sync::Notify::new());

    let ctx = Container::context("app", "/app");
    let entered2 = entered.clone();
    let release2 = release.clone();
    let wrapper = Container::wrapper("park", Arc::new(move || -> Result<Arc<dyn Handler>> {
        Ok(Arc::new(ParkingHandler {
            entered: entered2.clone(),
            release: release2.clone(),
        }))
    }));
    wrapper.set_max_instances(2).unwrap();
    ctx.add_child(wrapper.clone()).await.unwrap();
    ctx.add_handler_mapping("/park", "park").unwrap();
    ctx.start().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut req = Request::new("http", "localhost", "GET", "/app/park");
            let mut res = Response::new();
            ctx.invoke(&mut req, &mut res).await
        }));
    }

    // Only two instances ever run concurrently; the rest wait on the
    // pool permit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 2);

    release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(entered.load(Ordering::SeqCst), 4);
    release.notify_waiters();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_forward_and_include_against_a_live_tree() {
    let server = standard_server().await;
    let ctx = server
        .engine()
        .find_child("localhost")
        .unwrap()
        .find_child("app")
        .unwrap();

    let forward = Dispatcher::for_path(&ctx, "/reports/summary").unwrap();
    let mut req = Request::new("http", "localhost", "GET", "/app/export.csv");
    let mut res = Response::new();
    res.write(b"discarded").unwrap();
    forward.forward(&mut req, &mut res).await.unwrap();
    assert_eq!(body(&res), "exact|/reports/summary|-");
    assert!(res.is_closed());

    let include = Dispatcher::for_path(&ctx, "/reports/q2").unwrap();
    let mut req = Request::new("http", "localhost", "GET", "/app/export.csv");
    let mut res = Response::new();
    res.write(b"kept|").unwrap();
    include.include(&mut req, &mut res).await.unwrap();
    res.flush();
    assert_eq!(body(&res), "kept|prefix|/reports|/q2");

    server.stop().await.unwrap();
}
