//! In-container re-entry: forward and include.
//!
//! # Responsibilities
//! - Resolve a dispatch target inside a context, by path or by name
//! - Forward: discard uncommitted output and hand the response over
//! - Include: run the target with the response metadata frozen
//! - Maintain the request's overlay frame across the nested invocation
//!
//! # Design Decisions
//! - A dispatcher is resolved ahead of the call and borrows nothing from
//!   the request, so a handler can resolve one and use it later
//! - Path dispatch records the caller's view under the reserved
//!   attribute keys; named dispatch records nothing, the target sees the
//!   caller's paths untouched

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::container::Container;
use crate::error::{ContainerError, Result};
use crate::observability::metrics;
use crate::request::{keys, DispatchFrame, DispatchMode, Request};
use crate::response::Response;

/// A resolved dispatch target inside one context.
pub struct Dispatcher {
    context: Arc<Container>,
    wrapper: Arc<Container>,
    uri: String,
    query: Option<String>,
    handler_path: String,
    path_info: Option<String>,
    named: bool,
}

impl Dispatcher {
    /// Resolve a context-relative path (which may carry a query string)
    /// against the context's pattern mappings. `None` when nothing maps.
    pub fn for_path(context: &Arc<Container>, path: &str) -> Option<Dispatcher> {
        let router = context.pattern_router()?;
        let (path_only, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (path, None),
        };
        let (wrapper, matched) = router.match_path(path_only)?;
        let context_path = context.context_path().unwrap_or_default();
        Some(Dispatcher {
            context: context.clone(),
            wrapper,
            uri: format!("{context_path}{path_only}"),
            query,
            handler_path: matched.handler_path,
            path_info: matched.path_info,
            named: false,
        })
    }

    /// Resolve a wrapper by name. The target sees the caller's paths.
    pub fn for_name(context: &Arc<Container>, name: &str) -> Option<Dispatcher> {
        let wrapper = context.find_child(name)?;
        Some(Dispatcher {
            context: context.clone(),
            wrapper,
            uri: String::new(),
            query: None,
            handler_path: String::new(),
            path_info: None,
            named: true,
        })
    }

    /// Hand the response over to the target.
    ///
    /// Fails on a committed response before touching any state. Buffered
    /// output is discarded; headers set so far survive. The response is
    /// closed when the target returns, whether or not it succeeded.
    pub async fn forward(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        if res.is_committed() {
            return Err(ContainerError::IllegalState(
                "cannot forward after the response is committed".into(),
            ));
        }
        res.reset_buffer()?;

        req.push_frame(self.frame(DispatchMode::Forward, req));
        metrics::record_dispatch("forward");
        tracing::debug!(request_id = %req.id(), target = self.wrapper.name(), "forward");

        let outcome = self.wrapper.invoke(req, res).await;
        req.pop_frame();
        res.close();
        outcome
    }

    /// Run the target and merge its output into the current response.
    /// The target cannot change status, headers or commit state.
    pub async fn include(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        req.push_frame(self.frame(DispatchMode::Include, req));
        res.begin_include();
        metrics::record_dispatch("include");
        tracing::debug!(request_id = %req.id(), target = self.wrapper.name(), "include");

        let outcome = self.wrapper.invoke(req, res).await;
        res.end_include();
        req.pop_frame();
        outcome
    }

    fn frame(&self, mode: DispatchMode, req: &Request) -> DispatchFrame {
        let mut attributes = HashMap::new();
        if mode == DispatchMode::Include && !self.named {
            // The included resource's own view, scoped to the frame.
            attributes.insert(keys::INCLUDE_REQUEST_URI.into(), Value::from(self.uri.clone()));
            attributes.insert(
                keys::INCLUDE_CONTEXT_PATH.into(),
                Value::from(self.context.context_path().unwrap_or_default()),
            );
            attributes.insert(
                keys::INCLUDE_HANDLER_PATH.into(),
                Value::from(self.handler_path.clone()),
            );
            attributes.insert(
                keys::INCLUDE_PATH_INFO.into(),
                self.path_info.clone().map(Value::from).unwrap_or(Value::Null),
            );
            attributes.insert(
                keys::INCLUDE_QUERY_STRING.into(),
                self.query.clone().map(Value::from).unwrap_or(Value::Null),
            );
        }

        // The caller's view, preserved across the outermost path-based
        // forward only. Scoped to the frame, so it detaches on pop.
        if mode == DispatchMode::Forward
            && !self.named
            && req.attribute(keys::FORWARD_REQUEST_URI).is_none()
        {
            attributes.insert(keys::FORWARD_REQUEST_URI.into(), Value::from(req.uri().to_string()));
            attributes.insert(
                keys::FORWARD_CONTEXT_PATH.into(),
                Value::from(req.context_path().to_string()),
            );
            attributes.insert(
                keys::FORWARD_HANDLER_PATH.into(),
                Value::from(req.handler_path().to_string()),
            );
            attributes.insert(
                keys::FORWARD_PATH_INFO.into(),
                req.path_info().map(Value::from).unwrap_or(Value::Null),
            );
            attributes.insert(
                keys::FORWARD_QUERY_STRING.into(),
                req.query().map(Value::from).unwrap_or(Value::Null),
            );
        }

        if self.named {
            // Named dispatch: the target sees the caller's paths.
            DispatchFrame {
                mode,
                uri: req.uri().to_string(),
                query: req.query().map(str::to_string),
                context_path: req.context_path().to_string(),
                handler_path: req.handler_path().to_string(),
                path_info: req.path_info().map(str::to_string),
                attributes,
                parameters: HashMap::new(),
            }
        } else {
            DispatchFrame {
                mode,
                uri: self.uri.clone(),
                query: self.query.clone(),
                context_path: self.context.context_path().unwrap_or_default(),
                handler_path: self.handler_path.clone(),
                path_info: self.path_info.clone(),
                attributes,
                parameters: HashMap::new(),
            }
        }
    }
}
