//! Interceptors: cross-cutting request processing around a handler.
//!
//! # Responsibilities
//! - Define the interceptor lifecycle surface (init, intercept, destroy)
//! - Hold a context's interceptor definitions and their mappings
//! - Build the per-request chain for a matched wrapper
//!
//! # Design Decisions
//! - Chain order is mapping-registration order, URL-pattern mappings
//!   first, then handler-name mappings; a mapping naming an undefined
//!   interceptor is logged and skipped, never a request failure
//! - Interceptors are initialized at context start and destroyed at
//!   context stop or reload, exactly once per definition

pub mod chain;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::handler::HandlerConfig;
use crate::request::Request;
use crate::response::Response;
use crate::routing::UrlPattern;
use crate::scope::AppScope;

pub use chain::{ChainTarget, InterceptorChain};

/// A unit of cross-cutting logic invoked ahead of the handler. Calling
/// `chain.proceed` continues toward the handler; not calling it
/// short-circuits the request.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Called once at context start, before any request reaches the
    /// interceptor. A failing init marks the whole context unavailable.
    async fn init(&self, config: &HandlerConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }

    async fn intercept(
        &self,
        req: &mut Request,
        res: &mut Response,
        chain: &InterceptorChain,
    ) -> Result<()>;

    /// Called once at context stop or reload.
    async fn destroy(&self) {}
}

/// Creates interceptor instances on behalf of the deployer.
pub trait InterceptorFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Interceptor>>;
}

impl<F> InterceptorFactory for F
where
    F: Fn() -> Result<Arc<dyn Interceptor>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Interceptor>> {
        self()
    }
}

/// A named interceptor registered on a context.
struct InterceptorDef {
    name: String,
    instance: Arc<dyn Interceptor>,
    init_params: HashMap<String, String>,
}

/// What a mapping applies to.
pub enum MappingTarget {
    /// Requests whose handler path matches the pattern.
    Pattern(UrlPattern),
    /// Requests routed to the named wrapper.
    Handler(String),
}

struct InterceptorMapping {
    interceptor: String,
    target: MappingTarget,
}

/// A context's interceptor definitions plus the mappings that select
/// them per request.
pub struct InterceptorRegistry {
    defs: RwLock<Vec<InterceptorDef>>,
    mappings: RwLock<Vec<InterceptorMapping>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(Vec::new()),
            mappings: RwLock::new(Vec::new()),
        }
    }

    /// Register a named interceptor. A second definition under the same
    /// name replaces the first.
    pub fn define(
        &self,
        name: impl Into<String>,
        instance: Arc<dyn Interceptor>,
        init_params: HashMap<String, String>,
    ) {
        let name = name.into();
        let mut defs = self.defs.write().unwrap();
        defs.retain(|d| d.name != name);
        defs.push(InterceptorDef {
            name,
            instance,
            init_params,
        });
    }

    /// Map a defined interceptor onto a URL pattern or a wrapper name.
    pub fn add_mapping(&self, interceptor: impl Into<String>, target: MappingTarget) {
        self.mappings.write().unwrap().push(InterceptorMapping {
            interceptor: interceptor.into(),
            target,
        });
    }

    /// Assemble the chain for one request: pattern mappings matching the
    /// context-relative request path first, then name mappings for the
    /// wrapper, each group in registration order.
    pub(crate) fn build(
        &self,
        path: &str,
        wrapper_name: &str,
        target: Option<ChainTarget>,
    ) -> InterceptorChain {
        let defs = self.defs.read().unwrap();
        let mappings = self.mappings.read().unwrap();
        let mut selected = Vec::new();

        let mut push = |name: &str| match defs.iter().find(|d| d.name == name) {
            Some(def) => selected.push(def.instance.clone()),
            None => {
                tracing::warn!(interceptor = name, "mapping names an undefined interceptor");
            }
        };

        for mapping in mappings.iter() {
            if let MappingTarget::Pattern(pattern) = &mapping.target {
                if pattern.matches(path) {
                    push(&mapping.interceptor);
                }
            }
        }
        for mapping in mappings.iter() {
            if let MappingTarget::Handler(name) = &mapping.target {
                if name == wrapper_name {
                    push(&mapping.interceptor);
                }
            }
        }

        InterceptorChain::new(selected, target)
    }

    /// Initialize every definition, in registration order. The first
    /// failure aborts and is returned to the caller.
    pub(crate) async fn init_all(&self, scope: &Arc<AppScope>) -> Result<()> {
        let defs: Vec<(String, Arc<dyn Interceptor>, HashMap<String, String>)> = self
            .defs
            .read()
            .unwrap()
            .iter()
            .map(|d| (d.name.clone(), d.instance.clone(), d.init_params.clone()))
            .collect();
        for (name, instance, params) in defs {
            let config = HandlerConfig::new(name.clone(), params, scope.clone());
            instance.init(&config).await.map_err(|err| {
                tracing::error!(interceptor = %name, error = %err, "interceptor init failed");
                err
            })?;
        }
        Ok(())
    }

    /// Destroy every definition, reverse of registration order.
    pub(crate) async fn destroy_all(&self) {
        let defs: Vec<Arc<dyn Interceptor>> = self
            .defs
            .read()
            .unwrap()
            .iter()
            .rev()
            .map(|d| d.instance.clone())
            .collect();
        for instance in defs {
            instance.destroy().await;
        }
    }
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
