//! Wrapper-specific state: one handler's lifecycle and instance pool.
//!
//! # Responsibilities
//! - Lazy-load handler instances through the wrapper's factory
//! - Serve shared handlers from a singleton, exclusive ones from a
//!   bounded pool gated by a semaphore
//! - Track unavailability windows and translate them into errors the
//!   wrapper stage can turn into 503s
//! - Drain and destroy instances on unload
//!
//! # Design Decisions
//! - The concurrency mode is discovered from the first instance, not
//!   configured: the handler implementation declares `single_instance`
//! - Pool capacity is enforced by permits, so a caller over the bound
//!   waits on the semaphore instead of spinning
//! - Unavailability is checked lazily against the clock at allocation;
//!   no timer task ever re-arms a wrapper

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{ContainerError, Result};
use crate::handler::{Handler, HandlerConfig, HandlerFactory};
use crate::scope::AppScope;

use super::{Container, Ext};

const DEFAULT_MAX_INSTANCES: usize = 20;
const UNLOAD_POLLS: u32 = 20;
const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the wrapper may hand out instances right now.
#[derive(Debug, Clone, Copy)]
enum Availability {
    Available,
    /// Unavailable until the instant passes; restored lazily on the next
    /// allocation attempt.
    Until(Instant),
    /// Never coming back (init failure or operator action).
    Permanent,
}

/// Instance lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    BeforeInit,
    AfterInit,
    BeforeService,
    AfterService,
    BeforeDestroy,
    AfterDestroy,
}

/// Observer of a wrapper's instance lifecycle.
pub trait InstanceListener: Send + Sync {
    fn instance_event(&self, wrapper: &Container, event: InstanceEvent, instance: &Arc<dyn Handler>);
}

/// An allocated handler instance. For exclusive handlers the lease holds
/// the pool permit; dropping it without `deallocate` still frees the slot,
/// but skips returning the instance to the pool.
pub struct HandlerLease {
    instance: Arc<dyn Handler>,
    permit: Option<OwnedSemaphorePermit>,
}

impl HandlerLease {
    pub fn instance(&self) -> &Arc<dyn Handler> {
        &self.instance
    }
}

impl std::fmt::Debug for HandlerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerLease").finish_non_exhaustive()
    }
}

pub(crate) struct WrapperExt {
    factory: Arc<dyn HandlerFactory>,
    load_on_startup: AtomicI32,
    max_instances: AtomicUsize,
    availability: Mutex<Availability>,
    unloading: AtomicBool,
    allocated: AtomicUsize,
    // Discovered from the first instance: true means exclusive (pooled).
    single: AtomicBool,
    loaded: AtomicBool,
    load_lock: AsyncMutex<()>,
    singleton: RwLock<Option<Arc<dyn Handler>>>,
    pool: Mutex<Vec<Arc<dyn Handler>>>,
    permits: RwLock<Arc<Semaphore>>,
    // Every live instance, for destruction at unload.
    instances: Mutex<Vec<Arc<dyn Handler>>>,
    instance_listeners: RwLock<Vec<Arc<dyn InstanceListener>>>,
    init_params: RwLock<HashMap<String, String>>,
}

impl WrapperExt {
    pub(crate) fn new(factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            factory,
            load_on_startup: AtomicI32::new(-1),
            max_instances: AtomicUsize::new(DEFAULT_MAX_INSTANCES),
            availability: Mutex::new(Availability::Available),
            unloading: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
            single: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            load_lock: AsyncMutex::new(()),
            singleton: RwLock::new(None),
            pool: Mutex::new(Vec::new()),
            permits: RwLock::new(Arc::new(Semaphore::new(DEFAULT_MAX_INSTANCES))),
            instances: Mutex::new(Vec::new()),
            instance_listeners: RwLock::new(Vec::new()),
            init_params: RwLock::new(HashMap::new()),
        }
    }
}

impl Container {
    fn wrapper_ext(&self) -> Result<&WrapperExt> {
        match &self.ext {
            Ext::Wrapper(ext) => Ok(ext),
            _ => Err(ContainerError::IllegalState(format!(
                "container '{}' is not a wrapper",
                self.name
            ))),
        }
    }

    /// Startup priority: negative means lazy, lower positive values load
    /// first, zero loads after every positive value.
    pub fn load_on_startup(&self) -> i32 {
        match &self.ext {
            Ext::Wrapper(ext) => ext.load_on_startup.load(Ordering::SeqCst),
            _ => -1,
        }
    }

    pub fn set_load_on_startup(&self, priority: i32) -> Result<()> {
        self.wrapper_ext()?
            .load_on_startup
            .store(priority, Ordering::SeqCst);
        Ok(())
    }

    /// Pool bound for exclusive handlers. Takes effect at the next load.
    pub fn set_max_instances(&self, max: usize) -> Result<()> {
        let ext = self.wrapper_ext()?;
        ext.max_instances.store(max.max(1), Ordering::SeqCst);
        if !ext.loaded.load(Ordering::SeqCst) {
            *ext.permits.write().unwrap() = Arc::new(Semaphore::new(max.max(1)));
        }
        Ok(())
    }

    /// Set an init parameter merged over the context-level ones when the
    /// handler config is built.
    pub fn set_init_param(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.wrapper_ext()?
            .init_params
            .write()
            .unwrap()
            .insert(name.into(), value.into());
        Ok(())
    }

    pub fn add_instance_listener(&self, listener: Arc<dyn InstanceListener>) -> Result<()> {
        self.wrapper_ext()?
            .instance_listeners
            .write()
            .unwrap()
            .push(listener);
        Ok(())
    }

    pub(crate) fn notify_instance(&self, event: InstanceEvent, instance: &Arc<dyn Handler>) {
        if let Ext::Wrapper(ext) = &self.ext {
            let listeners = ext.instance_listeners.read().unwrap().clone();
            for listener in listeners {
                listener.instance_event(self, event, instance);
            }
        }
    }

    /// Mark the wrapper unavailable. `Some(secs)` opens a window restored
    /// lazily once it elapses; `None` is permanent.
    pub fn mark_unavailable(&self, retry_after_secs: Option<u64>) -> Result<()> {
        let ext = self.wrapper_ext()?;
        let state = match retry_after_secs {
            Some(secs) => Availability::Until(Instant::now() + Duration::from_secs(secs)),
            None => Availability::Permanent,
        };
        tracing::warn!(wrapper = %self.name, retry_after = ?retry_after_secs, "marked unavailable");
        *ext.availability.lock().unwrap() = state;
        Ok(())
    }

    pub fn mark_available(&self) -> Result<()> {
        *self.wrapper_ext()?.availability.lock().unwrap() = Availability::Available;
        Ok(())
    }

    fn check_available(&self, ext: &WrapperExt) -> Result<()> {
        let mut availability = ext.availability.lock().unwrap();
        match *availability {
            Availability::Available => Ok(()),
            Availability::Permanent => Err(ContainerError::permanently_unavailable()),
            Availability::Until(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    *availability = Availability::Available;
                    Ok(())
                } else {
                    let remaining = (deadline - now).as_secs().max(1);
                    Err(ContainerError::unavailable(remaining))
                }
            }
        }
    }

    /// Borrow a handler instance.
    ///
    /// Shared handlers return the singleton immediately. Exclusive ones
    /// take a pool permit, waiting if every instance is out.
    pub async fn allocate(&self) -> Result<HandlerLease> {
        let ext = self.wrapper_ext()?;
        if ext.unloading.load(Ordering::SeqCst) {
            return Err(ContainerError::unavailable(1));
        }
        self.check_available(ext)?;
        self.ensure_loaded(ext).await?;

        if !ext.single.load(Ordering::SeqCst) {
            let instance = ext
                .singleton
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| ContainerError::IllegalState("wrapper lost its instance".into()))?;
            ext.allocated.fetch_add(1, Ordering::SeqCst);
            return Ok(HandlerLease {
                instance,
                permit: None,
            });
        }

        let semaphore = ext.permits.read().unwrap().clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ContainerError::IllegalState("instance pool closed".into()))?;
        let pooled = ext.pool.lock().unwrap().pop();
        let instance = match pooled {
            Some(instance) => instance,
            None => self.create_instance(ext).await?,
        };
        ext.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerLease {
            instance,
            permit: Some(permit),
        })
    }

    /// Return a lease. Exclusive instances go back to the pool unless the
    /// wrapper is unloading; the permit is released either way.
    pub fn deallocate(&self, lease: HandlerLease) {
        if let Ext::Wrapper(ext) = &self.ext {
            ext.allocated.fetch_sub(1, Ordering::SeqCst);
            if ext.single.load(Ordering::SeqCst) && !ext.unloading.load(Ordering::SeqCst) {
                ext.pool.lock().unwrap().push(lease.instance.clone());
            }
        }
        drop(lease);
    }

    /// Eagerly load the handler (preload path). Idempotent.
    pub async fn load(&self) -> Result<()> {
        let ext = self.wrapper_ext()?;
        self.check_available(ext)?;
        self.ensure_loaded(ext).await
    }

    /// Drain the pool and destroy every instance. Waits a bounded time
    /// for in-service instances, then destroys regardless.
    pub async fn unload(&self) -> Result<()> {
        let ext = self.wrapper_ext()?;
        if !ext.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        ext.unloading.store(true, Ordering::SeqCst);

        let mut polls = 0;
        while ext.allocated.load(Ordering::SeqCst) > 0 && polls < UNLOAD_POLLS {
            tokio::time::sleep(UNLOAD_POLL_INTERVAL).await;
            polls += 1;
        }
        let busy = ext.allocated.load(Ordering::SeqCst);
        if busy > 0 {
            tracing::warn!(wrapper = %self.name, busy, "destroying instances still in service");
        }

        let instances: Vec<Arc<dyn Handler>> =
            ext.instances.lock().unwrap().drain(..).collect();
        for instance in instances {
            self.notify_instance(InstanceEvent::BeforeDestroy, &instance);
            instance.destroy().await;
            self.notify_instance(InstanceEvent::AfterDestroy, &instance);
        }

        ext.pool.lock().unwrap().clear();
        *ext.singleton.write().unwrap() = None;
        ext.loaded.store(false, Ordering::SeqCst);
        ext.unloading.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Config handed to `Handler::init`: context init parameters with the
    /// wrapper's own merged over them, plus the context scope.
    fn handler_config(&self, ext: &WrapperExt) -> HandlerConfig {
        let scope = self
            .parent()
            .and_then(|p| p.scope())
            .unwrap_or_else(|| Arc::new(AppScope::new()));
        let mut params = scope.init_params();
        for (name, value) in ext.init_params.read().unwrap().iter() {
            params.insert(name.clone(), value.clone());
        }
        HandlerConfig::new(self.name.clone(), params, scope)
    }

    async fn ensure_loaded(&self, ext: &WrapperExt) -> Result<()> {
        if ext.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = ext.load_lock.lock().await;
        if ext.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }

        let instance = self.create_instance(ext).await?;
        let single = instance.single_instance();
        ext.single.store(single, Ordering::SeqCst);
        if single {
            *ext.permits.write().unwrap() =
                Arc::new(Semaphore::new(ext.max_instances.load(Ordering::SeqCst)));
            ext.pool.lock().unwrap().push(instance);
        } else {
            *ext.singleton.write().unwrap() = Some(instance);
        }
        ext.loaded.store(true, Ordering::SeqCst);
        tracing::debug!(wrapper = %self.name, exclusive = single, "handler loaded");
        Ok(())
    }

    /// Create and initialize one instance. A failing init marks this
    /// wrapper permanently unavailable.
    async fn create_instance(&self, ext: &WrapperExt) -> Result<Arc<dyn Handler>> {
        let instance = ext.factory.create()?;
        let config = self.handler_config(ext);
        self.notify_instance(InstanceEvent::BeforeInit, &instance);
        if let Err(err) = instance.init(&config).await {
            tracing::error!(
                wrapper = %self.name,
                error = %err,
                "handler init failed; wrapper permanently unavailable"
            );
            *ext.availability.lock().unwrap() = Availability::Permanent;
            self.notify_instance(InstanceEvent::AfterInit, &instance);
            return Err(ContainerError::permanently_unavailable());
        }
        self.notify_instance(InstanceEvent::AfterInit, &instance);
        ext.instances.lock().unwrap().push(instance.clone());
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::response::Response;
    use async_trait::async_trait;

    struct SharedHandler;

    #[async_trait]
    impl Handler for SharedHandler {
        async fn service(&self, _req: &mut Request, _res: &mut Response) -> Result<()> {
            Ok(())
        }
    }

    struct ExclusiveHandler {
        destroys: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for ExclusiveHandler {
        async fn service(&self, _req: &mut Request, _res: &mut Response) -> Result<()> {
            Ok(())
        }
        async fn destroy(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        fn single_instance(&self) -> bool {
            true
        }
    }

    fn shared_wrapper() -> Arc<Container> {
        Container::wrapper("w", Arc::new(|| -> Result<Arc<dyn Handler>> {
            Ok(Arc::new(SharedHandler))
        }))
    }

    fn exclusive_wrapper(destroys: Arc<AtomicUsize>) -> Arc<Container> {
        Container::wrapper("w", Arc::new(move || -> Result<Arc<dyn Handler>> {
            Ok(Arc::new(ExclusiveHandler {
                destroys: destroys.clone(),
            }))
        }))
    }

    #[tokio::test]
    async fn test_shared_handler_is_a_singleton() {
        let wrapper = shared_wrapper();
        let a = wrapper.allocate().await.unwrap();
        let b = wrapper.allocate().await.unwrap();
        assert!(Arc::ptr_eq(a.instance(), b.instance()));
        wrapper.deallocate(a);
        wrapper.deallocate(b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_pool_blocks_at_the_bound() {
        let wrapper = exclusive_wrapper(Arc::new(AtomicUsize::new(0)));
        wrapper.set_max_instances(2).unwrap();

        let a = wrapper.allocate().await.unwrap();
        let b = wrapper.allocate().await.unwrap();
        assert!(!Arc::ptr_eq(a.instance(), b.instance()));

        // The third caller waits on the pool permit.
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), wrapper.allocate()).await;
        assert!(blocked.is_err());

        wrapper.deallocate(a);
        let c = tokio::time::timeout(Duration::from_millis(100), wrapper.allocate())
            .await
            .expect("a freed slot unblocks the waiter")
            .unwrap();
        wrapper.deallocate(b);
        wrapper.deallocate(c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailability_window_restores_lazily() {
        let wrapper = shared_wrapper();
        wrapper.mark_unavailable(Some(30)).unwrap();

        let err = wrapper.allocate().await.unwrap_err();
        assert!(err.is_unavailable());

        tokio::time::advance(Duration::from_secs(31)).await;
        let lease = wrapper.allocate().await.unwrap();
        wrapper.deallocate(lease);
    }

    #[tokio::test]
    async fn test_failing_init_is_permanent() {
        struct BrokenHandler;
        #[async_trait]
        impl Handler for BrokenHandler {
            async fn init(&self, _config: &HandlerConfig) -> Result<()> {
                Err(ContainerError::IllegalState("bad wiring".into()))
            }
            async fn service(&self, _req: &mut Request, _res: &mut Response) -> Result<()> {
                Ok(())
            }
        }
        let wrapper = Container::wrapper("w", Arc::new(|| -> Result<Arc<dyn Handler>> {
            Ok(Arc::new(BrokenHandler))
        }));

        let err = wrapper.allocate().await.unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Unavailable {
                permanent: true,
                ..
            }
        ));
        // Still permanent on the next attempt; the factory is not retried.
        assert!(wrapper.allocate().await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_unload_destroys_every_instance() {
        let destroys = Arc::new(AtomicUsize::new(0));
        let wrapper = exclusive_wrapper(destroys.clone());
        wrapper.set_max_instances(3).unwrap();

        let a = wrapper.allocate().await.unwrap();
        let b = wrapper.allocate().await.unwrap();
        wrapper.deallocate(a);
        wrapper.deallocate(b);

        wrapper.unload().await.unwrap();
        assert_eq!(destroys.load(Ordering::SeqCst), 2);

        // A fresh allocation reloads from the factory.
        let lease = wrapper.allocate().await.unwrap();
        wrapper.deallocate(lease);
    }

    #[tokio::test]
    async fn test_wrapper_params_override_context_params() {
        let ctx = Container::context("app", "/app");
        ctx.scope().unwrap().set_init_param("mode", "context");
        ctx.scope().unwrap().set_init_param("region", "eu");
        let wrapper = shared_wrapper();
        wrapper.set_init_param("mode", "wrapper").unwrap();
        ctx.add_child(wrapper.clone()).await.unwrap();

        let ext = wrapper.wrapper_ext().unwrap();
        let config = wrapper.handler_config(ext);
        assert_eq!(config.init_param("mode"), Some("wrapper"));
        assert_eq!(config.init_param("region"), Some("eu"));
    }
}
