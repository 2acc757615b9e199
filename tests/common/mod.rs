//! Shared utilities for integration testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use harbor::container::Container;
use harbor::error::ContainerError;
use harbor::interceptor::InterceptorChain;
use harbor::{Handler, HandlerFactory, Request, Response, Result, Server};

/// Handler that writes `name|handler_path|path_info` so tests can assert
/// which wrapper served the request and what the router computed.
pub struct EchoHandler {
    pub name: &'static str,
}

#[async_trait]
impl Handler for EchoHandler {
    async fn service(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        let line = format!(
            "{}|{}|{}",
            self.name,
            req.handler_path(),
            req.path_info().unwrap_or("-")
        );
        res.write(line.as_bytes())?;
        Ok(())
    }
}

pub fn echo_factory(name: &'static str) -> Arc<dyn HandlerFactory> {
    Arc::new(move || -> Result<Arc<dyn Handler>> { Ok(Arc::new(EchoHandler { name })) })
}

/// Exclusive handler that parks in service until released, for pool tests.
pub struct ParkingHandler {
    pub entered: Arc<AtomicUsize>,
    pub release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Handler for ParkingHandler {
    async fn service(&self, _req: &mut Request, res: &mut Response) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        res.write(b"parked")?;
        Ok(())
    }

    fn single_instance(&self) -> bool {
        true
    }
}

/// Handler that declares itself unavailable on the first call and serves
/// normally afterwards.
pub struct FlakyHandler {
    pub calls: Arc<AtomicUsize>,
    pub retry_after: u64,
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn service(&self, _req: &mut Request, res: &mut Response) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ContainerError::unavailable(self.retry_after));
        }
        res.write(b"recovered")?;
        Ok(())
    }
}

/// Interceptor that logs entry and exit around the rest of the chain.
pub struct TaggingInterceptor {
    pub tag: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl harbor::interceptor::Interceptor for TaggingInterceptor {
    async fn intercept(
        &self,
        req: &mut Request,
        res: &mut Response,
        chain: &InterceptorChain,
    ) -> Result<()> {
        self.log.lock().unwrap().push(format!("{}:in", self.tag));
        let out = chain.proceed(req, res).await;
        self.log.lock().unwrap().push(format!("{}:out", self.tag));
        out
    }
}

/// A started server with one host (`localhost` + alias `www.localhost`),
/// one context at `/app` and three echo wrappers exercising each pattern
/// kind.
#[allow(dead_code)]
pub async fn standard_server() -> Server {
    let engine = Container::engine("engine");
    let host = Container::host("localhost");
    engine.add_child(host.clone()).await.unwrap();
    host.add_alias("www.localhost").unwrap();
    engine.set_default_host("localhost").unwrap();

    let ctx = Container::context("app", "/app");
    ctx.add_child(Container::wrapper("exact", echo_factory("exact")))
        .await
        .unwrap();
    ctx.add_child(Container::wrapper("prefix", echo_factory("prefix")))
        .await
        .unwrap();
    ctx.add_child(Container::wrapper("ext", echo_factory("ext")))
        .await
        .unwrap();
    ctx.add_handler_mapping("/reports/summary", "exact").unwrap();
    ctx.add_handler_mapping("/reports/*", "prefix").unwrap();
    ctx.add_handler_mapping("*.csv", "ext").unwrap();
    host.add_child(ctx).await.unwrap();

    let server = Server::new(engine);
    server.start().await.unwrap();
    server
}

/// Body bytes as a string for assertions.
#[allow(dead_code)]
pub fn body(res: &Response) -> String {
    String::from_utf8_lossy(res.body()).into_owned()
}
