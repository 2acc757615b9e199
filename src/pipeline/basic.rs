//! The distinguished terminal stage of each container kind's pipeline.
//!
//! # Responsibilities
//! - Engine: select the host, account the request, 404 on a miss
//! - Host: select the context by path prefix, 404 on a miss
//! - Context: pause/availability gating, in-flight accounting, wrapper
//!   selection
//! - Wrapper: allocate an instance, run the interceptor chain, translate
//!   unavailability into 503 + Retry-After
//!
//! # Design Decisions
//! - Each stage holds a `Weak` back-reference to its container; the
//!   container owns the pipeline that owns the stage, so a strong
//!   reference would leak the whole subtree
//! - Routing misses produce error responses, never `Err`: a 404 is a
//!   normal outcome of a well-formed request

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::container::Container;
use crate::error::{ContainerError, Result};
use crate::interceptor::{ChainTarget, InterceptorChain};
use crate::observability::metrics;
use crate::pipeline::{PipelineCursor, Stage, StageAnchor};
use crate::request::Request;
use crate::response::Response;

const PAUSE_POLLS: u32 = 100;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

fn upgrade(container: &Weak<Container>) -> Result<Arc<Container>> {
    container
        .upgrade()
        .ok_or_else(|| ContainerError::IllegalState("container was dropped".into()))
}

/// Terminal stage of an engine pipeline.
pub struct EngineStage {
    container: Weak<Container>,
    anchor: StageAnchor,
}

impl EngineStage {
    pub(crate) fn new(container: Weak<Container>) -> Self {
        Self {
            container,
            anchor: StageAnchor::new(),
        }
    }
}

#[async_trait]
impl Stage for EngineStage {
    fn name(&self) -> &str {
        "engine-basic"
    }

    fn anchor(&self) -> &StageAnchor {
        &self.anchor
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        _next: &PipelineCursor,
    ) -> Result<()> {
        let engine = upgrade(&self.container)?;
        let started = std::time::Instant::now();
        let outcome = match engine.map(req, true) {
            Some(host) => host.invoke(req, res).await,
            None => {
                tracing::debug!(
                    request_id = %req.id(),
                    server_name = req.server_name(),
                    "no host matched"
                );
                res.send_error(404, "no matching host");
                Ok(())
            }
        };
        metrics::record_request(req.method(), res.status(), started);
        outcome
    }
}

/// Terminal stage of a host pipeline.
pub struct HostStage {
    container: Weak<Container>,
    anchor: StageAnchor,
}

impl HostStage {
    pub(crate) fn new(container: Weak<Container>) -> Self {
        Self {
            container,
            anchor: StageAnchor::new(),
        }
    }
}

#[async_trait]
impl Stage for HostStage {
    fn name(&self) -> &str {
        "host-basic"
    }

    fn anchor(&self) -> &StageAnchor {
        &self.anchor
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        _next: &PipelineCursor,
    ) -> Result<()> {
        let host = upgrade(&self.container)?;
        match host.map(req, true) {
            Some(context) => context.invoke(req, res).await,
            None => {
                tracing::debug!(request_id = %req.id(), uri = req.uri(), "no context matched");
                res.send_error(404, "no matching context");
                Ok(())
            }
        }
    }
}

/// Terminal stage of a context pipeline.
pub struct ContextStage {
    container: Weak<Container>,
    anchor: StageAnchor,
}

impl ContextStage {
    pub(crate) fn new(container: Weak<Container>) -> Self {
        Self {
            container,
            anchor: StageAnchor::new(),
        }
    }
}

#[async_trait]
impl Stage for ContextStage {
    fn name(&self) -> &str {
        "context-basic"
    }

    fn anchor(&self) -> &StageAnchor {
        &self.anchor
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        _next: &PipelineCursor,
    ) -> Result<()> {
        let context = upgrade(&self.container)?;

        // A reload in progress holds requests back for a bounded time.
        let mut polls = 0;
        while context.is_paused() && polls < PAUSE_POLLS {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            polls += 1;
        }

        if !context.is_available() {
            res.send_error(503, "application unavailable");
            return Ok(());
        }

        context.begin_request();
        let outcome = match context.map(req, true) {
            Some(wrapper) => wrapper.invoke(req, res).await,
            None => {
                tracing::debug!(request_id = %req.id(), uri = req.uri(), "no handler matched");
                res.send_error(404, "no matching handler");
                Ok(())
            }
        };
        context.end_request();
        outcome
    }
}

/// Terminal stage of a wrapper pipeline: the handler call itself.
pub struct WrapperStage {
    container: Weak<Container>,
    anchor: StageAnchor,
}

impl WrapperStage {
    pub(crate) fn new(container: Weak<Container>) -> Self {
        Self {
            container,
            anchor: StageAnchor::new(),
        }
    }
}

fn reject_unavailable(res: &mut Response, err: &ContainerError) {
    if let ContainerError::Unavailable {
        retry_after: Some(secs),
        ..
    } = err
    {
        res.set_header("Retry-After", secs.to_string());
    }
    res.send_error(503, "handler unavailable");
}

#[async_trait]
impl Stage for WrapperStage {
    fn name(&self) -> &str {
        "wrapper-basic"
    }

    fn anchor(&self) -> &StageAnchor {
        &self.anchor
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        _next: &PipelineCursor,
    ) -> Result<()> {
        let wrapper = upgrade(&self.container)?;

        let lease = match wrapper.allocate().await {
            Ok(lease) => lease,
            Err(err) if err.is_unavailable() => {
                metrics::record_unavailable(wrapper.name());
                reject_unavailable(res, &err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let target = ChainTarget::new(wrapper.clone(), lease.instance().clone());
        // Pattern mappings select on the context-relative request path,
        // not the matched handler path alone. For a prefix-routed wrapper
        // those differ by the path info suffix.
        let path = match req.path_info() {
            Some(info) => format!("{}{}", req.handler_path(), info),
            None => req.handler_path().to_string(),
        };
        let chain = match wrapper.parent().as_ref().and_then(|c| c.interceptors()) {
            Some(registry) => registry.build(&path, wrapper.name(), Some(target)),
            None => InterceptorChain::new(Vec::new(), Some(target)),
        };

        let outcome = chain.proceed(req, res).await;
        wrapper.deallocate(lease);

        match outcome {
            Ok(()) => Ok(()),
            Err(ContainerError::Unavailable {
                retry_after,
                permanent,
            }) => {
                // The handler declared itself unavailable mid-service.
                let window = if permanent {
                    None
                } else {
                    Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS))
                };
                wrapper.mark_unavailable(window)?;
                metrics::record_unavailable(wrapper.name());
                reject_unavailable(
                    res,
                    &ContainerError::Unavailable {
                        retry_after: window,
                        permanent,
                    },
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    request_id = %req.id(),
                    wrapper = wrapper.name(),
                    error = %err,
                    "handler failed"
                );
                Err(err)
            }
        }
    }
}
