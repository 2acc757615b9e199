//! Per-request interceptor chain ending at the allocated handler.
//!
//! # Design Decisions
//! - The chain is built fresh per request and advanced by an index with
//!   exactly-once stepping, mirroring the pipeline cursor
//! - Service notifications (before/after) fire around the terminal call
//!   even when the handler errors, so listeners always see a pair

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::container::wrapper::InstanceEvent;
use crate::container::Container;
use crate::error::Result;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;

use super::Interceptor;

/// The handler call at the end of the chain.
pub struct ChainTarget {
    pub(crate) wrapper: Arc<Container>,
    pub(crate) instance: Arc<dyn Handler>,
}

impl ChainTarget {
    pub(crate) fn new(wrapper: Arc<Container>, instance: Arc<dyn Handler>) -> Self {
        Self { wrapper, instance }
    }
}

/// One request's ordered walk over its interceptors.
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    target: Option<ChainTarget>,
    position: AtomicUsize,
}

impl InterceptorChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn Interceptor>>, target: Option<ChainTarget>) -> Self {
        Self {
            interceptors,
            target,
            position: AtomicUsize::new(0),
        }
    }

    /// Advance to the next interceptor, or the handler past the end.
    /// A chain with no target falls off the end as a no-op.
    pub fn proceed<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pos = self.position.fetch_add(1, Ordering::SeqCst);
            if let Some(interceptor) = self.interceptors.get(pos) {
                return interceptor.intercept(req, res, self).await;
            }
            if pos == self.interceptors.len() {
                if let Some(target) = &self.target {
                    target
                        .wrapper
                        .notify_instance(InstanceEvent::BeforeService, &target.instance);
                    let outcome = target.instance.service(req, res).await;
                    target
                        .wrapper
                        .notify_instance(InstanceEvent::AfterService, &target.instance);
                    return outcome;
                }
            }
            Ok(())
        })
    }
}
