//! The contract the core needs from application handlers.
//!
//! # Responsibilities
//! - Define the handler lifecycle surface (init, service, destroy)
//! - Expose the declared concurrency mode (shared vs exclusive instances)
//! - Carry per-handler configuration into `init`
//!
//! # Design Decisions
//! - Instantiation goes through a factory so the deployer, not the core,
//!   owns class/implementation resolution
//! - `single_instance` is declared by the handler implementation; it is
//!   not a configuration knob

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;
use crate::scope::AppScope;

/// Configuration passed to [`Handler::init`].
///
/// Init parameters are the wrapper's own parameters merged over the
/// context-level ones (wrapper values win).
#[derive(Clone)]
pub struct HandlerConfig {
    name: String,
    init_params: HashMap<String, String>,
    scope: Arc<AppScope>,
}

impl HandlerConfig {
    pub(crate) fn new(
        name: String,
        init_params: HashMap<String, String>,
        scope: Arc<AppScope>,
    ) -> Self {
        Self {
            name,
            init_params,
            scope,
        }
    }

    /// Name of the wrapper this handler is mounted under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_param(&self, name: &str) -> Option<&str> {
        self.init_params.get(name).map(String::as_str)
    }

    pub fn init_params(&self) -> &HashMap<String, String> {
        &self.init_params
    }

    /// Application scope of the owning context.
    pub fn scope(&self) -> &Arc<AppScope> {
        &self.scope
    }
}

/// The leaf unit of application logic invoked at the end of an
/// interceptor chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called once per instance before the first service call. A failing
    /// init marks the owning wrapper permanently unavailable.
    async fn init(&self, config: &HandlerConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    /// Handle one request.
    async fn service(&self, req: &mut Request, res: &mut Response) -> Result<()>;

    /// Called once per instance when the wrapper unloads it.
    async fn destroy(&self) {}

    /// True when the implementation forbids concurrent reentry and must be
    /// served from a bounded instance pool.
    fn single_instance(&self) -> bool {
        false
    }
}

/// Creates handler instances on behalf of a wrapper.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Handler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Result<Arc<dyn Handler>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Handler>> {
        self()
    }
}
