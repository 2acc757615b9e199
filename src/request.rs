//! The request object the connector hands to the container tree.
//!
//! # Responsibilities
//! - Carry the routing-relevant view of one inbound request (server name,
//!   decoded URI, query, parameters, attributes)
//! - Record the routing results written by the tables as the request
//!   descends (context path, handler path, path info)
//! - Hold the dispatch overlay stack used by forward/include re-entry
//!
//! # Design Decisions
//! - Request ID generated at construction for end-to-end tracing
//! - Forward overlays override the path accessors; include overlays never
//!   do, their paths are exposed only under reserved attribute keys
//! - Attribute reads search overlays top-down, writes land in the top
//!   overlay so they vanish when the dispatch returns

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

/// Reserved attribute names used by the dispatcher.
///
/// `include.*` keys describe the included resource; `forward.*` keys
/// preserve the original request's view across the outermost forward.
pub mod keys {
    pub const INCLUDE_REQUEST_URI: &str = "harbor.include.request_uri";
    pub const INCLUDE_CONTEXT_PATH: &str = "harbor.include.context_path";
    pub const INCLUDE_HANDLER_PATH: &str = "harbor.include.handler_path";
    pub const INCLUDE_PATH_INFO: &str = "harbor.include.path_info";
    pub const INCLUDE_QUERY_STRING: &str = "harbor.include.query_string";

    pub const FORWARD_REQUEST_URI: &str = "harbor.forward.request_uri";
    pub const FORWARD_CONTEXT_PATH: &str = "harbor.forward.context_path";
    pub const FORWARD_HANDLER_PATH: &str = "harbor.forward.handler_path";
    pub const FORWARD_PATH_INFO: &str = "harbor.forward.path_info";
    pub const FORWARD_QUERY_STRING: &str = "harbor.forward.query_string";
}

/// Kind of dispatch that produced an overlay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Forward,
    Include,
}

/// One synthetic request view layered over the original by a dispatch call.
///
/// Pushing and popping a frame is this crate's rendition of "insert one
/// wrapper pair ahead of the first container-native request, detach it when
/// the dispatch returns".
#[derive(Debug, Clone)]
pub(crate) struct DispatchFrame {
    pub mode: DispatchMode,
    pub uri: String,
    pub query: Option<String>,
    pub context_path: String,
    pub handler_path: String,
    pub path_info: Option<String>,
    pub attributes: HashMap<String, Value>,
    pub parameters: HashMap<String, Vec<String>>,
}

/// In-process request handed to `Container::invoke`.
#[derive(Debug)]
pub struct Request {
    id: Uuid,
    protocol: String,
    server_name: String,
    method: String,
    uri: String,
    query: Option<String>,
    parameters: HashMap<String, Vec<String>>,
    attributes: HashMap<String, Value>,

    // Routing results, written by the tables on the way down.
    context_path: String,
    handler_path: String,
    path_info: Option<String>,

    frames: Vec<DispatchFrame>,
}

impl Request {
    /// Create a request for the given decoded URI. The URI may carry a
    /// query string; it is split off here.
    pub fn new(
        protocol: impl Into<String>,
        server_name: impl Into<String>,
        method: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        let raw: String = uri.into();
        let (path, query) = match raw.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (raw, None),
        };
        let parameters = query.as_deref().map(parse_query).unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            protocol: protocol.into(),
            server_name: server_name.into(),
            method: method.into(),
            uri: path,
            query,
            parameters,
            attributes: HashMap::new(),
            context_path: String::new(),
            handler_path: String::new(),
            path_info: None,
            frames: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Effective decoded request URI. A forward overlay overrides it;
    /// include overlays do not.
    pub fn uri(&self) -> &str {
        match self.forward_frame() {
            Some(f) => &f.uri,
            None => &self.uri,
        }
    }

    /// Effective query string.
    pub fn query(&self) -> Option<&str> {
        match self.forward_frame() {
            Some(f) => f.query.as_deref(),
            None => self.query.as_deref(),
        }
    }

    /// Effective context path (empty string for the root context).
    pub fn context_path(&self) -> &str {
        match self.forward_frame() {
            Some(f) => &f.context_path,
            None => &self.context_path,
        }
    }

    /// Effective handler path: the pattern-matched portion of the URI.
    pub fn handler_path(&self) -> &str {
        match self.forward_frame() {
            Some(f) => &f.handler_path,
            None => &self.handler_path,
        }
    }

    /// Effective path info: the remainder after a prefix-pattern match.
    pub fn path_info(&self) -> Option<&str> {
        match self.forward_frame() {
            Some(f) => f.path_info.as_deref(),
            None => self.path_info.as_deref(),
        }
    }

    /// Effective parameter multimap. Dispatch overlays merge their own
    /// query parameters over the view they were created from.
    pub fn parameters(&self) -> &HashMap<String, Vec<String>> {
        match self.frames.last() {
            Some(f) => &f.parameters,
            None => &self.parameters,
        }
    }

    /// All values for one parameter, dispatch-aware.
    pub fn parameter_values(&self, name: &str) -> Option<&[String]> {
        self.parameters().get(name).map(Vec::as_slice)
    }

    /// Read an attribute, searching overlays top-down then the base map.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.attributes.get(name) {
                return Some(value);
            }
        }
        self.attributes.get(name)
    }

    /// Write an attribute. During a dispatch the write lands in the top
    /// overlay and vanishes when the dispatch returns.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.attributes.insert(name.into(), value);
            }
            None => {
                self.attributes.insert(name.into(), value);
            }
        }
    }

    /// Remove an attribute from the current view.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        match self.frames.last_mut() {
            Some(frame) => frame.attributes.remove(name),
            None => self.attributes.remove(name),
        }
    }

    pub(crate) fn set_context_path(&mut self, path: impl Into<String>) {
        self.context_path = path.into();
    }

    pub(crate) fn set_handler_path(&mut self, path: impl Into<String>) {
        self.handler_path = path.into();
    }

    pub(crate) fn set_path_info(&mut self, info: Option<String>) {
        self.path_info = info;
    }

    /// Depth of the dispatch overlay stack (0 outside any dispatch).
    pub fn dispatch_depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn push_frame(&mut self, mut frame: DispatchFrame) {
        // Merge the frame's own query parameters over the current view.
        let mut merged = self.parameters().clone();
        if let Some(q) = frame.query.as_deref() {
            for (name, values) in parse_query(q) {
                let entry = merged.entry(name).or_default();
                // New values take precedence: prepend them.
                let mut combined = values;
                combined.extend(entry.drain(..));
                *entry = combined;
            }
        }
        frame.parameters = merged;
        self.frames.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) -> Option<DispatchFrame> {
        self.frames.pop()
    }

    fn forward_frame(&self) -> Option<&DispatchFrame> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.mode == DispatchMode::Forward)
    }
}

/// Parse an `a=1&b=2&a=3` style query string into a multimap.
pub(crate) fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n, v),
            None => (pair, ""),
        };
        out.entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }
    out
}
