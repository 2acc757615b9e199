//! Hostname routing with an alias-aware result cache.
//!
//! # Responsibilities
//! - Map a server name (exact or alias, case-insensitive) to a Host
//! - Fall back to the designated default host on a miss
//! - Keep the cache consistent with the tree via change notifications
//!
//! # Design Decisions
//! - DashMap result cache: read-heavy and invalidated entry-by-entry,
//!   never wholesale
//! - A miss caches the default-host fallback for that name. A host or
//!   alias registered later does NOT retroactively fix such entries; only
//!   an explicit removal event invalidates them. Compatibility quirk,
//!   preserved as-is.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::container::{Container, ContainerEvent, ContainerKind, ContainerListener};
use crate::request::Request;
use crate::routing::RoutingTable;

/// Server-name to Host lookup for one engine.
pub struct HostRouter {
    protocol: String,
    // Canonical names and aliases, lowercased.
    hosts: RwLock<HashMap<String, Arc<Container>>>,
    default_host: RwLock<Option<String>>,
    cache: DashMap<String, Arc<Container>>,
}

impl HostRouter {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            hosts: RwLock::new(HashMap::new()),
            default_host: RwLock::new(None),
            cache: DashMap::new(),
        }
    }

    /// Designate the default host for unmatched server names.
    pub fn set_default_host(&self, name: impl Into<String>) {
        *self.default_host.write().unwrap() = Some(name.into().to_lowercase());
    }

    pub fn default_host(&self) -> Option<String> {
        self.default_host.read().unwrap().clone()
    }

    fn lookup(&self, key: &str) -> Option<Arc<Container>> {
        if let Some(hit) = self.cache.get(key) {
            return Some(hit.clone());
        }
        let hosts = self.hosts.read().unwrap();
        if let Some(host) = hosts.get(key) {
            self.cache.insert(key.to_string(), host.clone());
            return Some(host.clone());
        }
        // Fall back to the default host and cache that fallback too.
        let default = self.default_host.read().unwrap().clone()?;
        let host = hosts.get(&default)?.clone();
        drop(hosts);
        self.cache.insert(key.to_string(), host.clone());
        Some(host)
    }

    fn register(&self, name: &str, host: Arc<Container>) {
        self.hosts
            .write()
            .unwrap()
            .insert(name.to_lowercase(), host);
    }

    fn unregister(&self, name: &str) {
        let key = name.to_lowercase();
        self.hosts.write().unwrap().remove(&key);
        self.cache.remove(&key);
    }
}

impl RoutingTable for HostRouter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn map(&self, req: &mut Request, _update: bool) -> Option<Arc<Container>> {
        let key = req.server_name().to_lowercase();
        self.lookup(&key)
    }
}

impl ContainerListener for HostRouter {
    fn container_event(&self, event: &ContainerEvent) {
        match event {
            ContainerEvent::ChildAdded(child) if child.kind() == ContainerKind::Host => {
                self.register(child.name(), child.clone());
                for alias in child.aliases() {
                    self.register(&alias, child.clone());
                }
            }
            ContainerEvent::ChildRemoved(child) if child.kind() == ContainerKind::Host => {
                self.unregister(child.name());
                for alias in child.aliases() {
                    self.unregister(&alias);
                }
            }
            ContainerEvent::AliasAdded { host, alias } => {
                let target = self.hosts.read().unwrap().get(&host.to_lowercase()).cloned();
                if let Some(target) = target {
                    self.register(alias, target);
                }
            }
            ContainerEvent::AliasRemoved { alias, .. } => {
                self.unregister(alias);
            }
            _ => {}
        }
    }
}
