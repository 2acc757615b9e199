//! Longest-prefix context routing.
//!
//! # Responsibilities
//! - Map a request path to the context with the longest matching path
//! - Fall back to the empty-path default context
//! - Track context registration via tree-change notifications
//!
//! # Design Decisions
//! - Probing strips the trailing `/segment` and retries rather than
//!   scanning all registrations; cost is bounded by path depth

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::container::{Container, ContainerEvent, ContainerKind, ContainerListener};
use crate::request::Request;
use crate::routing::RoutingTable;

/// Context lookup by longest registered path prefix.
pub struct PathRouter {
    protocol: String,
    contexts: RwLock<HashMap<String, Arc<Container>>>,
}

impl PathRouter {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, path: impl Into<String>, context: Arc<Container>) {
        self.contexts.write().unwrap().insert(path.into(), context);
    }

    pub fn unregister(&self, path: &str) {
        self.contexts.write().unwrap().remove(path);
    }

    /// Longest-prefix lookup. Returns the context and the matched path.
    pub fn match_path(&self, path: &str) -> Option<(Arc<Container>, String)> {
        let contexts = self.contexts.read().unwrap();
        let mut candidate = path.to_string();
        loop {
            if let Some(context) = contexts.get(&candidate) {
                return Some((context.clone(), candidate));
            }
            if candidate.is_empty() {
                return None;
            }
            // Strip the last /segment and retest.
            match candidate.rfind('/') {
                Some(idx) => candidate.truncate(idx),
                None => candidate.clear(),
            }
        }
    }
}

impl RoutingTable for PathRouter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn map(&self, req: &mut Request, update: bool) -> Option<Arc<Container>> {
        let (context, matched) = self.match_path(req.uri())?;
        if update {
            req.set_context_path(matched);
        }
        Some(context)
    }
}

impl ContainerListener for PathRouter {
    fn container_event(&self, event: &ContainerEvent) {
        match event {
            ContainerEvent::ChildAdded(child) if child.kind() == ContainerKind::Context => {
                if let Some(path) = child.context_path() {
                    self.register(path, child.clone());
                }
            }
            ContainerEvent::ChildRemoved(child) if child.kind() == ContainerKind::Context => {
                if let Some(path) = child.context_path() {
                    self.unregister(&path);
                }
            }
            _ => {}
        }
    }
}
