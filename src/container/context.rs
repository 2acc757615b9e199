//! Context-specific state and operations.
//!
//! # Responsibilities
//! - Own the application scope shared by the context's handlers
//! - Own the interceptor registry and the handler-pattern mappings
//! - Pause/availability gating and in-flight accounting for reload
//! - Preload eagerly-loaded wrappers at start, in priority order
//!
//! # Design Decisions
//! - Reload is in-place: the context's identity (and every reference to
//!   it held by routing tables) survives, only the application state is
//!   torn down and rebuilt
//! - A failing interceptor init makes the context unavailable rather
//!   than failing the container start

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ContainerError, Result};
use crate::interceptor::InterceptorRegistry;
use crate::routing::PatternRouter;
use crate::scope::AppScope;

use super::lifecycle::LifecycleEvent;
use super::{Container, ContainerEvent, ContainerKind, ContainerListener, Ext};

pub(crate) struct ContextExt {
    path: String,
    scope: Arc<AppScope>,
    interceptors: InterceptorRegistry,
    pattern_router: Arc<PatternRouter>,
    paused: AtomicBool,
    available: AtomicBool,
    in_flight: AtomicUsize,
}

impl ContextExt {
    pub(crate) fn new(path: String, pattern_router: Arc<PatternRouter>) -> Self {
        Self {
            path,
            scope: Arc::new(AppScope::new()),
            interceptors: InterceptorRegistry::new(),
            pattern_router,
            paused: AtomicBool::new(false),
            available: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }
}

/// Drops a removed wrapper's pattern registrations.
pub(crate) struct MappingCleanup {
    router: Arc<PatternRouter>,
}

impl MappingCleanup {
    pub(crate) fn new(router: Arc<PatternRouter>) -> Self {
        Self { router }
    }
}

impl ContainerListener for MappingCleanup {
    fn container_event(&self, event: &ContainerEvent) {
        if let ContainerEvent::ChildRemoved(child) = event {
            if child.kind() == ContainerKind::Wrapper {
                self.router.unregister_target(child.name());
            }
        }
    }
}

impl Container {
    fn context_ext(&self) -> Result<&ContextExt> {
        match &self.ext {
            Ext::Context(ext) => Ok(ext),
            _ => Err(ContainerError::IllegalState(format!(
                "container '{}' is not a context",
                self.name
            ))),
        }
    }

    /// Mount path of a context (empty string for the root context);
    /// `None` for every other kind.
    pub fn context_path(&self) -> Option<String> {
        match &self.ext {
            Ext::Context(ext) => Some(ext.path.clone()),
            _ => None,
        }
    }

    /// Application scope of a context.
    pub fn scope(&self) -> Option<Arc<AppScope>> {
        match &self.ext {
            Ext::Context(ext) => Some(ext.scope.clone()),
            _ => None,
        }
    }

    /// Interceptor registry of a context.
    pub fn interceptors(&self) -> Option<&InterceptorRegistry> {
        match &self.ext {
            Ext::Context(ext) => Some(&ext.interceptors),
            _ => None,
        }
    }

    pub(crate) fn pattern_router(&self) -> Option<Arc<PatternRouter>> {
        match &self.ext {
            Ext::Context(ext) => Some(ext.pattern_router.clone()),
            _ => None,
        }
    }

    /// Map a URL pattern onto one of this context's wrapper children.
    pub fn add_handler_mapping(&self, pattern: &str, wrapper_name: &str) -> Result<()> {
        let ext = self.context_ext()?;
        let wrapper = self.find_child(wrapper_name).ok_or_else(|| {
            ContainerError::IllegalState(format!("no wrapper named '{wrapper_name}'"))
        })?;
        ext.pattern_router.register(pattern, wrapper)
    }

    /// True while a reload holds new requests back.
    pub fn is_paused(&self) -> bool {
        match &self.ext {
            Ext::Context(ext) => ext.paused.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// True when the context accepts requests. False turns every request
    /// into a 503 at the context stage.
    pub fn is_available(&self) -> bool {
        match &self.ext {
            Ext::Context(ext) => ext.available.load(Ordering::SeqCst),
            _ => true,
        }
    }

    pub fn set_available(&self, available: bool) -> Result<()> {
        self.context_ext()?
            .available
            .store(available, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn begin_request(&self) {
        if let Ext::Context(ext) = &self.ext {
            ext.in_flight.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn end_request(&self) {
        if let Ext::Context(ext) = &self.ext {
            ext.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Requests currently inside this context's subtree.
    pub fn in_flight(&self) -> usize {
        match &self.ext {
            Ext::Context(ext) => ext.in_flight.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Context start hook: bring the scope live, initialize interceptors
    /// and preload eager wrappers.
    pub(crate) async fn post_start_context(&self) {
        let ext = match &self.ext {
            Ext::Context(ext) => ext,
            _ => return,
        };
        ext.scope.mark_initialized();
        if let Err(err) = ext.interceptors.init_all(&ext.scope).await {
            tracing::error!(
                context = %self.name,
                error = %err,
                "interceptor init failed; context marked unavailable"
            );
            ext.available.store(false, Ordering::SeqCst);
            return;
        }
        self.preload_handlers().await;
    }

    /// Context stop hook: destroy interceptors, then tear the scope down.
    pub(crate) async fn post_stop_context(&self) {
        let ext = match &self.ext {
            Ext::Context(ext) => ext,
            _ => return,
        };
        ext.interceptors.destroy_all().await;
        ext.scope.tear_down();
    }

    /// Load every wrapper with a non-negative startup priority. Lower
    /// values load first; zero sorts after every positive value; ties
    /// load in declaration order. A failing load is logged and skipped.
    async fn preload_handlers(&self) {
        let mut eager: Vec<(i32, usize, Arc<Container>)> = self
            .children()
            .into_iter()
            .enumerate()
            .filter_map(|(idx, child)| {
                let priority = child.load_on_startup();
                if priority < 0 {
                    return None;
                }
                let key = if priority == 0 { i32::MAX } else { priority };
                Some((key, idx, child))
            })
            .collect();
        eager.sort_by_key(|(key, idx, _)| (*key, *idx));

        for (_, _, wrapper) in eager {
            if let Err(err) = wrapper.load().await {
                tracing::warn!(
                    context = %self.name,
                    wrapper = %wrapper.name,
                    error = %err,
                    "preload failed"
                );
            }
        }
    }

    /// Reload the application in place: tear down handlers, interceptors
    /// and scope attributes, restart the loader, then rebuild. The
    /// context object itself (and every routing-table reference to it)
    /// stays the same.
    pub async fn reload(&self) -> Result<()> {
        let ext = self.context_ext()?;
        tracing::info!(context = %self.name, "reloading");
        ext.paused.store(true, Ordering::SeqCst);

        let outcome = self.reload_inner(ext).await;

        ext.paused.store(false, Ordering::SeqCst);
        match &outcome {
            Ok(()) => self.fire_lifecycle_event(LifecycleEvent::Reload),
            Err(err) => {
                tracing::error!(
                    context = %self.name,
                    error = %err,
                    "reload failed; context marked unavailable"
                );
                ext.available.store(false, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn reload_inner(&self, ext: &ContextExt) -> Result<()> {
        for wrapper in self.children() {
            if let Err(err) = wrapper.unload().await {
                tracing::warn!(wrapper = %wrapper.name, error = %err, "unload during reload failed");
            }
        }
        ext.interceptors.destroy_all().await;
        ext.scope.tear_down();

        let loader = self.loader.read().unwrap().clone();
        if let Some(loader) = loader {
            loader.stop().await?;
            loader.start().await?;
        }

        ext.scope.mark_initialized();
        ext.interceptors.init_all(&ext.scope).await?;
        self.preload_handlers().await;
        ext.available.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerConfig};
    use crate::request::Request;
    use crate::response::Response;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        inits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn init(&self, _config: &HandlerConfig) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn service(&self, _req: &mut Request, _res: &mut Response) -> Result<()> {
            Ok(())
        }
    }

    fn counting_wrapper(name: &str, inits: Arc<AtomicUsize>) -> Arc<Container> {
        Container::wrapper(name, Arc::new(move || -> Result<Arc<dyn Handler>> {
            Ok(Arc::new(CountingHandler {
                inits: inits.clone(),
            }))
        }))
    }

    #[tokio::test]
    async fn test_preload_order_zero_sorts_last() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct OrderedHandler {
            tag: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        #[async_trait]
        impl Handler for OrderedHandler {
            async fn init(&self, _config: &HandlerConfig) -> Result<()> {
                self.order.lock().unwrap().push(self.tag);
                Ok(())
            }
            async fn service(&self, _req: &mut Request, _res: &mut Response) -> Result<()> {
                Ok(())
            }
        }

        let ctx = Container::context("app", "/app");
        for (name, tag, priority) in [
            ("w-zero", "zero", 0),
            ("w-two", "two", 2),
            ("w-skip", "skip", -1),
            ("w-one", "one", 1),
        ] {
            let order = order.clone();
            let wrapper = Container::wrapper(name, Arc::new(move || -> Result<Arc<dyn Handler>> {
                Ok(Arc::new(OrderedHandler {
                    tag,
                    order: order.clone(),
                }))
            }));
            wrapper.set_load_on_startup(priority).unwrap();
            ctx.add_child(wrapper).await.unwrap();
        }

        ctx.start().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["one", "two", "zero"]);
        ctx.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_keeps_identity_and_init_params() {
        let inits = Arc::new(AtomicUsize::new(0));
        let ctx = Container::context("app", "/app");
        let wrapper = counting_wrapper("w", inits.clone());
        wrapper.set_load_on_startup(1).unwrap();
        ctx.add_child(wrapper).await.unwrap();

        let scope = ctx.scope().unwrap();
        scope.set_init_param("mode", "demo");
        ctx.start().await.unwrap();
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        scope.set_attribute("transient", Value::from(1));
        let before = Arc::as_ptr(&ctx.scope().unwrap());
        ctx.reload().await.unwrap();

        // Same scope object, attributes wiped, parameters kept, handler
        // re-initialized by the post-reload preload.
        assert_eq!(before, Arc::as_ptr(&ctx.scope().unwrap()));
        assert!(scope.attribute("transient").is_none());
        assert_eq!(scope.init_param("mode").as_deref(), Some("demo"));
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert!(ctx.is_available());
        assert!(!ctx.is_paused());
        ctx.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_event_fires_only_on_success() {
        use crate::interceptor::{Interceptor, InterceptorChain};

        struct ReloadCounter {
            reloads: Arc<AtomicUsize>,
        }
        impl crate::container::lifecycle::LifecycleListener for ReloadCounter {
            fn lifecycle_event(&self, _source: &Container, event: LifecycleEvent) {
                if event == LifecycleEvent::Reload {
                    self.reloads.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        struct BrokenInterceptor;
        #[async_trait]
        impl Interceptor for BrokenInterceptor {
            async fn init(&self, _config: &HandlerConfig) -> Result<()> {
                Err(ContainerError::IllegalState("broken".into()))
            }
            async fn intercept(
                &self,
                req: &mut Request,
                res: &mut Response,
                chain: &InterceptorChain,
            ) -> Result<()> {
                chain.proceed(req, res).await
            }
        }

        let reloads = Arc::new(AtomicUsize::new(0));
        let ctx = Container::context("app", "/app");
        ctx.add_lifecycle_listener(Arc::new(ReloadCounter {
            reloads: reloads.clone(),
        }));
        ctx.start().await.unwrap();

        ctx.reload().await.unwrap();
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        // A failing rebuild reports the error and fires no notification.
        ctx.interceptors()
            .unwrap()
            .define("broken", Arc::new(BrokenInterceptor), Default::default());
        assert!(ctx.reload().await.is_err());
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert!(!ctx.is_available());
    }

    #[tokio::test]
    async fn test_reload_rejected_on_non_context() {
        let host = Container::host("h");
        assert!(host.reload().await.is_err());
    }

    #[tokio::test]
    async fn test_removed_wrapper_loses_its_mappings() {
        let inits = Arc::new(AtomicUsize::new(0));
        let ctx = Container::context("app", "/app");
        ctx.add_child(counting_wrapper("w", inits)).await.unwrap();
        ctx.add_handler_mapping("/w/*", "w").unwrap();
        assert!(ctx.pattern_router().unwrap().match_path("/w/x").is_some());

        ctx.remove_child("w").await.unwrap();
        assert!(ctx.pattern_router().unwrap().match_path("/w/x").is_none());
    }
}
