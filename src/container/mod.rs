//! The container tree: engine → host → context → wrapper.
//!
//! # Responsibilities
//! - Generic parent/child tree with per-sibling name uniqueness
//! - One pipeline and a per-protocol routing-table set per node
//! - Ordered start/stop across subordinates, routers, children, pipeline
//! - Synchronous tree-change notifications for routing-cache consistency
//!
//! # Design Decisions
//! - One concrete `Container` type with a kind tag and a per-kind
//!   extension, not an inheritance chain; the constructors install the
//!   kind's basic stage and routing table
//! - Children live in a `Vec` to preserve declaration order (preload
//!   ordering and event order depend on it); sibling counts are small,
//!   so name lookup is a scan
//! - Inherited properties (loader, resources, realm) resolve by walking
//!   parents on demand, never by denormalized pointers

pub mod context;
pub mod lifecycle;
pub mod wrapper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::{ContainerError, Result};
use crate::handler::HandlerFactory;
use crate::pipeline::basic;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::response::Response;
use crate::routing::{HostRouter, PathRouter, PatternRouter, RoutingTable};

use context::ContextExt;
use lifecycle::{LifecycleEvent, LifecycleListener, LifecycleState};
use wrapper::WrapperExt;

/// Protocol tag used by the built-in routing tables.
pub const DEFAULT_PROTOCOL: &str = "http";

/// Position of a container in the 4-level tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Engine,
    Host,
    Context,
    Wrapper,
}

impl ContainerKind {
    /// The only kind accepted as a child, if any.
    fn expected_child(self) -> Option<ContainerKind> {
        match self {
            ContainerKind::Engine => Some(ContainerKind::Host),
            ContainerKind::Host => Some(ContainerKind::Context),
            ContainerKind::Context => Some(ContainerKind::Wrapper),
            ContainerKind::Wrapper => None,
        }
    }
}

/// Tree-change notification, delivered synchronously on the mutating task.
#[derive(Clone)]
pub enum ContainerEvent {
    ChildAdded(Arc<Container>),
    ChildRemoved(Arc<Container>),
    AliasAdded { host: String, alias: String },
    AliasRemoved { host: String, alias: String },
}

/// Observer of tree changes. Listeners must not assume async delivery.
pub trait ContainerListener: Send + Sync {
    fn container_event(&self, event: &ContainerEvent);
}

/// Subordinate component seam (class-loader boundary, resource store,
/// access-control realm). The real implementations live outside the core.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Kind-specific state.
pub(crate) enum Ext {
    Engine(EngineExt),
    Host(HostExt),
    Context(ContextExt),
    Wrapper(WrapperExt),
}

pub(crate) struct EngineExt {
    pub host_router: Arc<HostRouter>,
}

pub(crate) struct HostExt {
    pub aliases: RwLock<Vec<String>>,
    pub path_router: Arc<PathRouter>,
}

/// A node in the routing tree.
pub struct Container {
    name: String,
    kind: ContainerKind,
    parent: RwLock<Weak<Container>>,
    children: RwLock<Vec<Arc<Container>>>,
    pipeline: Pipeline,
    routers: RwLock<HashMap<String, Arc<dyn RoutingTable>>>,
    /// Protocol of the table consulted when the request's protocol has no
    /// exact entry. Set by the first registration, cleared by the second.
    default_protocol: RwLock<Option<String>>,
    state: Mutex<LifecycleState>,
    lifecycle_listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
    container_listeners: RwLock<Vec<Arc<dyn ContainerListener>>>,
    loader: RwLock<Option<Arc<dyn Component>>>,
    resources: RwLock<Option<Arc<dyn Component>>>,
    realm: RwLock<Option<Arc<dyn Component>>>,
    pub(crate) ext: Ext,
}

impl Container {
    fn base(name: impl Into<String>, kind: ContainerKind, ext: Ext) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            pipeline: Pipeline::new(),
            routers: RwLock::new(HashMap::new()),
            default_protocol: RwLock::new(None),
            state: Mutex::new(LifecycleState::New),
            lifecycle_listeners: RwLock::new(Vec::new()),
            container_listeners: RwLock::new(Vec::new()),
            loader: RwLock::new(None),
            resources: RwLock::new(None),
            realm: RwLock::new(None),
            ext,
        }
    }

    /// Root container. Routes by server name via a [`HostRouter`] that
    /// listens for tree changes on this node.
    pub fn engine(name: impl Into<String>) -> Arc<Container> {
        let router = Arc::new(HostRouter::new(DEFAULT_PROTOCOL));
        let container = Arc::new(Self::base(
            name,
            ContainerKind::Engine,
            Ext::Engine(EngineExt {
                host_router: router.clone(),
            }),
        ));
        container.add_container_listener(router.clone());
        container.add_router(router);
        container
            .pipeline
            .install_basic(Arc::new(basic::EngineStage::new(Arc::downgrade(
                &container,
            ))))
            .expect("fresh pipeline accepts its basic stage");
        container
    }

    /// Virtual host. Routes by longest context-path prefix.
    pub fn host(name: impl Into<String>) -> Arc<Container> {
        let router = Arc::new(PathRouter::new(DEFAULT_PROTOCOL));
        let container = Arc::new(Self::base(
            name,
            ContainerKind::Host,
            Ext::Host(HostExt {
                aliases: RwLock::new(Vec::new()),
                path_router: router.clone(),
            }),
        ));
        container.add_container_listener(router.clone());
        container.add_router(router);
        container
            .pipeline
            .install_basic(Arc::new(basic::HostStage::new(Arc::downgrade(&container))))
            .expect("fresh pipeline accepts its basic stage");
        container
    }

    /// Application context mounted at `path` (empty string for the root
    /// context). Routes by URL pattern.
    pub fn context(name: impl Into<String>, path: impl Into<String>) -> Arc<Container> {
        let router = Arc::new(PatternRouter::new(DEFAULT_PROTOCOL));
        let container = Arc::new(Self::base(
            name,
            ContainerKind::Context,
            Ext::Context(ContextExt::new(path.into(), router.clone())),
        ));
        container.add_container_listener(Arc::new(context::MappingCleanup::new(router.clone())));
        container.add_router(router);
        container
            .pipeline
            .install_basic(Arc::new(basic::ContextStage::new(Arc::downgrade(
                &container,
            ))))
            .expect("fresh pipeline accepts its basic stage");
        container
    }

    /// Leaf container owning one handler's lifecycle and instance pool.
    pub fn wrapper(
        name: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Arc<Container> {
        let container = Arc::new(Self::base(
            name,
            ContainerKind::Wrapper,
            Ext::Wrapper(WrapperExt::new(factory)),
        ));
        container
            .pipeline
            .install_basic(Arc::new(basic::WrapperStage::new(Arc::downgrade(
                &container,
            ))))
            .expect("fresh pipeline accepts its basic stage");
        container
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.read().unwrap().upgrade()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    // ---- tree operations -------------------------------------------------

    /// Attach a child. The child's parent link is set before insertion;
    /// a name collision rejects the child and leaves this node unchanged.
    /// If this container is already started the child is started too.
    pub async fn add_child(self: &Arc<Self>, child: Arc<Container>) -> Result<()> {
        match self.kind.expected_child() {
            Some(expected) if expected == child.kind => {}
            _ => {
                return Err(ContainerError::IllegalState(format!(
                    "{:?} container cannot hold a {:?} child",
                    self.kind, child.kind
                )))
            }
        }
        {
            let mut children = self.children.write().unwrap();
            if children.iter().any(|c| c.name == child.name) {
                return Err(ContainerError::DuplicateChild(child.name.clone()));
            }
            if child.parent.read().unwrap().upgrade().is_some() {
                return Err(ContainerError::IllegalState(format!(
                    "container '{}' already has a parent",
                    child.name
                )));
            }
            *child.parent.write().unwrap() = Arc::downgrade(self);
            children.push(child.clone());
        }
        tracing::debug!(parent = %self.name, child = %child.name, "child added");
        self.fire_container_event(&ContainerEvent::ChildAdded(child.clone()));
        if self.is_started() {
            child.start().await?;
        }
        Ok(())
    }

    /// Detach a child by name, stopping it first if it was started.
    pub async fn remove_child(self: &Arc<Self>, name: &str) -> Result<Arc<Container>> {
        let child = {
            let mut children = self.children.write().unwrap();
            let pos = children
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| {
                    ContainerError::IllegalState(format!("no child named '{name}'"))
                })?;
            children.remove(pos)
        };
        if child.is_started() {
            if let Err(err) = child.stop().await {
                tracing::warn!(child = %child.name, error = %err, "child stop failed during removal");
            }
        }
        *child.parent.write().unwrap() = Weak::new();
        self.fire_container_event(&ContainerEvent::ChildRemoved(child.clone()));
        Ok(child)
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Container>> {
        self.children
            .read()
            .unwrap()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Children in declaration order.
    pub fn children(&self) -> Vec<Arc<Container>> {
        self.children.read().unwrap().clone()
    }

    // ---- routing tables --------------------------------------------------

    /// Register a routing table for its protocol.
    ///
    /// The first registration becomes the default; registering a second
    /// protocol invalidates the default designation.
    pub fn add_router(&self, table: Arc<dyn RoutingTable>) {
        let protocol = table.protocol().to_string();
        let mut routers = self.routers.write().unwrap();
        let mut default = self.default_protocol.write().unwrap();
        if routers.is_empty() {
            *default = Some(protocol.clone());
        } else if !routers.contains_key(&protocol) {
            *default = None;
        }
        routers.insert(protocol, table);
    }

    pub fn router(&self, protocol: &str) -> Option<Arc<dyn RoutingTable>> {
        let routers = self.routers.read().unwrap();
        if let Some(table) = routers.get(protocol) {
            return Some(table.clone());
        }
        let default = self.default_protocol.read().unwrap().clone()?;
        routers.get(&default).cloned()
    }

    /// Select the next child container for the request using the table
    /// registered for the request's protocol.
    pub fn map(&self, req: &mut Request, update: bool) -> Option<Arc<Container>> {
        let protocol = req.protocol().to_string();
        let table = self.router(&protocol)?;
        table.map(req, update)
    }

    // ---- listeners -------------------------------------------------------

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.lifecycle_listeners.write().unwrap().push(listener);
    }

    pub fn add_container_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.container_listeners.write().unwrap().push(listener);
    }

    pub(crate) fn fire_container_event(&self, event: &ContainerEvent) {
        let listeners = self.container_listeners.read().unwrap().clone();
        for listener in listeners {
            listener.container_event(event);
        }
    }

    fn fire_lifecycle_event(&self, event: LifecycleEvent) {
        let listeners = self.lifecycle_listeners.read().unwrap().clone();
        for listener in listeners {
            listener.lifecycle_event(self, event);
        }
    }

    // ---- host-specific ---------------------------------------------------

    fn host_ext(&self) -> Result<&HostExt> {
        match &self.ext {
            Ext::Host(ext) => Ok(ext),
            _ => Err(ContainerError::IllegalState(format!(
                "container '{}' is not a host",
                self.name
            ))),
        }
    }

    /// Register an alias for this host. The event propagates to the parent
    /// engine so its hostname cache can pick it up.
    pub fn add_alias(&self, alias: impl Into<String>) -> Result<()> {
        let alias: String = alias.into();
        let ext = self.host_ext()?;
        ext.aliases.write().unwrap().push(alias.to_lowercase());
        let event = ContainerEvent::AliasAdded {
            host: self.name.clone(),
            alias,
        };
        self.fire_container_event(&event);
        if let Some(parent) = self.parent() {
            parent.fire_container_event(&event);
        }
        Ok(())
    }

    /// Remove an alias; the corresponding hostname-cache entry is dropped.
    pub fn remove_alias(&self, alias: &str) -> Result<()> {
        let ext = self.host_ext()?;
        let key = alias.to_lowercase();
        ext.aliases.write().unwrap().retain(|a| *a != key);
        let event = ContainerEvent::AliasRemoved {
            host: self.name.clone(),
            alias: key,
        };
        self.fire_container_event(&event);
        if let Some(parent) = self.parent() {
            parent.fire_container_event(&event);
        }
        Ok(())
    }

    /// Aliases of a host container; empty for every other kind.
    pub fn aliases(&self) -> Vec<String> {
        match &self.ext {
            Ext::Host(ext) => ext.aliases.read().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    /// Designate the default host on an engine.
    pub fn set_default_host(&self, name: &str) -> Result<()> {
        match &self.ext {
            Ext::Engine(ext) => {
                ext.host_router.set_default_host(name);
                Ok(())
            }
            _ => Err(ContainerError::IllegalState(format!(
                "container '{}' is not an engine",
                self.name
            ))),
        }
    }

    // ---- subordinate components -----------------------------------------

    pub fn set_loader(&self, loader: Arc<dyn Component>) {
        *self.loader.write().unwrap() = Some(loader);
    }

    pub fn set_resources(&self, resources: Arc<dyn Component>) {
        *self.resources.write().unwrap() = Some(resources);
    }

    pub fn set_realm(&self, realm: Arc<dyn Component>) {
        *self.realm.write().unwrap() = Some(realm);
    }

    /// Loader for this node, inherited from the nearest ancestor if unset.
    pub fn loader(&self) -> Option<Arc<dyn Component>> {
        self.resolve(|c| c.loader.read().unwrap().clone())
    }

    /// Resource store, inherited from the nearest ancestor if unset.
    pub fn resources(&self) -> Option<Arc<dyn Component>> {
        self.resolve(|c| c.resources.read().unwrap().clone())
    }

    /// Access-control realm, inherited from the nearest ancestor if unset.
    pub fn realm(&self) -> Option<Arc<dyn Component>> {
        self.resolve(|c| c.realm.read().unwrap().clone())
    }

    fn resolve<T>(&self, get: impl Fn(&Container) -> Option<T>) -> Option<T> {
        if let Some(found) = get(self) {
            return Some(found);
        }
        let mut node = self.parent();
        while let Some(current) = node {
            if let Some(found) = get(&current) {
                return Some(found);
            }
            node = current.parent();
        }
        None
    }

    fn own_subordinates(&self) -> Vec<Arc<dyn Component>> {
        // Start order: loader, resources, realm. Stop order is the reverse.
        [&self.loader, &self.resources, &self.realm]
            .iter()
            .filter_map(|slot| slot.read().unwrap().clone())
            .collect()
    }

    // ---- request processing ----------------------------------------------

    /// Single entry point per tree level: run the request through this
    /// container's pipeline.
    pub async fn invoke(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        if !self.is_started() {
            return Err(ContainerError::Lifecycle(format!(
                "container '{}' is not started",
                self.name
            )));
        }
        self.pipeline.invoke(req, res).await
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start this container and its subtree.
    ///
    /// Order: subordinates, routing tables, children, pipeline, then the
    /// kind-specific post-start hook (context preload). A failing child is
    /// logged and skipped; a failing subordinate or pipeline aborts.
    pub fn start<'a>(self: &'a Arc<Self>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                match *state {
                    LifecycleState::Started | LifecycleState::Starting => {
                        return Err(ContainerError::Lifecycle(format!(
                            "container '{}' is already started",
                            self.name
                        )))
                    }
                    _ => *state = LifecycleState::Starting,
                }
            }
            tracing::info!(container = %self.name, kind = ?self.kind, "starting");
            self.fire_lifecycle_event(LifecycleEvent::BeforeStart);

            for component in self.own_subordinates() {
                component.start().await?;
            }
            // Routing tables are passive; registration happened at build time.

            for child in self.children() {
                if let Err(err) = child.start().await {
                    tracing::warn!(
                        container = %self.name,
                        child = %child.name,
                        error = %err,
                        "child failed to start; continuing with siblings"
                    );
                }
            }

            self.pipeline.start().await?;

            *self.state.lock().unwrap() = LifecycleState::Started;
            self.fire_lifecycle_event(LifecycleEvent::Start);

            if let Ext::Context(_) = self.ext {
                self.post_start_context().await;
            }

            self.fire_lifecycle_event(LifecycleEvent::AfterStart);
            Ok(())
        })
    }

    /// Stop this container and its subtree, reverse of `start`.
    /// The node is marked unavailable to new requests before teardown.
    pub fn stop<'a>(self: &'a Arc<Self>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if *state != LifecycleState::Started {
                    return Err(ContainerError::Lifecycle(format!(
                        "container '{}' is not started",
                        self.name
                    )));
                }
                *state = LifecycleState::Stopping;
            }
            tracing::info!(container = %self.name, kind = ?self.kind, "stopping");
            self.fire_lifecycle_event(LifecycleEvent::BeforeStop);

            if let Err(err) = self.pipeline.stop().await {
                tracing::warn!(container = %self.name, error = %err, "pipeline stop failed");
            }

            if let Ext::Wrapper(_) = self.ext {
                if let Err(err) = self.unload().await {
                    tracing::warn!(container = %self.name, error = %err, "unload during stop failed");
                }
            }

            for child in self.children().into_iter().rev() {
                if child.is_started() {
                    if let Err(err) = child.stop().await {
                        tracing::warn!(
                            container = %self.name,
                            child = %child.name,
                            error = %err,
                            "child stop failed"
                        );
                    }
                }
            }

            if let Ext::Context(_) = self.ext {
                self.post_stop_context().await;
            }

            for component in self.own_subordinates().into_iter().rev() {
                if let Err(err) = component.stop().await {
                    tracing::warn!(
                        container = %self.name,
                        component = component.name(),
                        error = %err,
                        "subordinate stop failed"
                    );
                }
            }

            *self.state.lock().unwrap() = LifecycleState::Stopped;
            self.fire_lifecycle_event(LifecycleEvent::Stop);
            self.fire_lifecycle_event(LifecycleEvent::AfterStop);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_child_name_is_rejected_atomically() {
        let engine = Container::engine("engine");
        engine.add_child(Container::host("h1")).await.unwrap();
        let err = engine.add_child(Container::host("h1")).await.unwrap_err();
        assert!(matches!(err, ContainerError::DuplicateChild(_)));
        assert_eq!(engine.children().len(), 1);
    }

    #[tokio::test]
    async fn test_child_kind_is_enforced() {
        let engine = Container::engine("engine");
        let err = engine
            .add_child(Container::context("ctx", "/app"))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_parent_link_set_on_add_and_cleared_on_remove() {
        let engine = Container::engine("engine");
        let host = Container::host("h");
        engine.add_child(host.clone()).await.unwrap();
        assert_eq!(host.parent().unwrap().name(), "engine");

        engine.remove_child("h").await.unwrap();
        assert!(host.parent().is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let engine = Container::engine("engine");
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
        assert!(engine.stop().await.is_err());
        // A stopped container may start again.
        engine.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_cascades_to_children() {
        let engine = Container::engine("engine");
        let host = Container::host("h");
        engine.add_child(host.clone()).await.unwrap();
        engine.start().await.unwrap();
        assert!(host.is_started());

        // A child added to a started parent starts immediately.
        let late = Container::host("late");
        engine.add_child(late.clone()).await.unwrap();
        assert!(late.is_started());
    }

    #[tokio::test]
    async fn test_second_protocol_clears_default_designation() {
        let ctx = Container::context("ctx", "/app");
        // Context constructor registered the "http" pattern router.
        assert!(ctx.router("anything").is_some());

        let other = Arc::new(PatternRouter::new("h2"));
        ctx.add_router(other);
        // No exact match and no default designation any more.
        assert!(ctx.router("anything").is_none());
        assert!(ctx.router("h2").is_some());
    }

    #[tokio::test]
    async fn test_loader_resolves_through_ancestors() {
        struct FakeLoader;
        #[async_trait]
        impl Component for FakeLoader {
            fn name(&self) -> &str {
                "fake-loader"
            }
            async fn start(&self) -> Result<()> {
                Ok(())
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let engine = Container::engine("engine");
        let host = Container::host("h");
        engine.add_child(host.clone()).await.unwrap();
        engine.set_loader(Arc::new(FakeLoader));
        assert_eq!(host.loader().unwrap().name(), "fake-loader");
    }
}
