//! Assembles a container tree from a validated configuration.
//!
//! # Responsibilities
//! - Resolve handler and interceptor kinds against the registry
//! - Build engine → hosts → contexts → wrappers in declaration order
//! - Wire aliases, pattern mappings, interceptors and init parameters
//!
//! # Design Decisions
//! - The registry maps config-level `kind` strings to factories, so the
//!   deployer owns implementation resolution and the core never sees a
//!   kind name
//! - Assembly happens on a stopped tree; the caller starts the server

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::schema::{ContainerConfig, ContextConfig};
use crate::container::Container;
use crate::error::{ContainerError, Result};
use crate::handler::HandlerFactory;
use crate::interceptor::{InterceptorFactory, MappingTarget};
use crate::routing::UrlPattern;
use crate::server::Server;

/// Maps config `kind` strings to handler and interceptor factories.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn HandlerFactory>>,
    interceptors: HashMap<String, Arc<dyn InterceptorFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(
        &mut self,
        kind: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
    ) -> &mut Self {
        self.handlers.insert(kind.into(), factory);
        self
    }

    pub fn register_interceptor(
        &mut self,
        kind: impl Into<String>,
        factory: Arc<dyn InterceptorFactory>,
    ) -> &mut Self {
        self.interceptors.insert(kind.into(), factory);
        self
    }

    fn handler(&self, kind: &str) -> Result<Arc<dyn HandlerFactory>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownFactory(kind.to_string()))
    }

    fn interceptor(&self, kind: &str) -> Result<Arc<dyn InterceptorFactory>> {
        self.interceptors
            .get(kind)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownFactory(kind.to_string()))
    }
}

/// Build a stopped server from a validated configuration.
pub async fn build(config: &ContainerConfig, registry: &HandlerRegistry) -> Result<Server> {
    let engine = Container::engine(&config.name);

    for host_config in &config.hosts {
        let host = Container::host(&host_config.name);
        engine.add_child(host.clone()).await?;
        for alias in &host_config.aliases {
            host.add_alias(alias)?;
        }

        for context_config in &host_config.contexts {
            let context = build_context(context_config, registry).await?;
            host.add_child(context).await?;
        }
    }

    if let Some(default) = &config.default_host {
        engine.set_default_host(default)?;
    }

    tracing::info!(
        engine = %config.name,
        hosts = config.hosts.len(),
        "container tree assembled"
    );
    Ok(Server::new(engine))
}

async fn build_context(
    config: &ContextConfig,
    registry: &HandlerRegistry,
) -> Result<Arc<Container>> {
    let context = Container::context(config.container_name(), &config.path);

    let scope = context.scope().expect("fresh context has a scope");
    for (name, value) in &config.init_params {
        scope.set_init_param(name, value);
    }

    for handler in &config.handlers {
        let wrapper = Container::wrapper(&handler.name, registry.handler(&handler.kind)?);
        wrapper.set_load_on_startup(handler.load_on_startup)?;
        wrapper.set_max_instances(handler.max_instances)?;
        for (name, value) in &handler.init_params {
            wrapper.set_init_param(name, value)?;
        }
        context.add_child(wrapper).await?;
        for pattern in &handler.patterns {
            context.add_handler_mapping(pattern, &handler.name)?;
        }
    }

    let interceptors = context.interceptors().expect("fresh context has a registry");
    for def in &config.interceptors {
        let instance = registry.interceptor(&def.kind)?.create()?;
        interceptors.define(&def.name, instance, def.init_params.clone());
    }
    for mapping in &config.interceptor_mappings {
        let target = match (&mapping.pattern, &mapping.handler) {
            (Some(pattern), None) => MappingTarget::Pattern(UrlPattern::parse(pattern)?),
            (None, Some(handler)) => MappingTarget::Handler(handler.clone()),
            _ => {
                // Validation rejects this ahead of deploy.
                return Err(ContainerError::IllegalState(format!(
                    "mapping for '{}' must set exactly one target",
                    mapping.interceptor
                )));
            }
        };
        interceptors.add_mapping(&mapping.interceptor, target);
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::request::Request;
    use crate::response::Response;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn service(&self, req: &mut Request, res: &mut Response) -> Result<()> {
            res.write(req.uri().as_bytes())?;
            Ok(())
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_handler("echo", Arc::new(|| -> Result<Arc<dyn Handler>> {
            Ok(Arc::new(EchoHandler))
        }));
        registry
    }

    fn demo_config() -> ContainerConfig {
        toml::from_str(
            r#"
            name = "edge"
            default_host = "localhost"

            [[hosts]]
            name = "localhost"
            aliases = ["www.localhost"]

            [[hosts.contexts]]
            path = "/app"

            [[hosts.contexts.handlers]]
            name = "echo"
            kind = "echo"
            patterns = ["/echo/*"]
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_assembles_the_tree() {
        let server = build(&demo_config(), &registry()).await.unwrap();
        let engine = server.engine();
        assert_eq!(engine.name(), "edge");
        let host = engine.find_child("localhost").unwrap();
        assert_eq!(host.aliases(), vec!["www.localhost"]);
        let context = host.find_child("app").unwrap();
        assert!(context.find_child("echo").is_some());
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_the_build() {
        let mut config = demo_config();
        config.hosts[0].contexts[0].handlers[0].kind = "ghost".into();
        let err = build(&config, &registry()).await.unwrap_err();
        assert!(matches!(err, ContainerError::UnknownFactory(_)));
    }
}
