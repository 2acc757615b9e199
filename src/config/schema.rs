//! Configuration schema definitions.
//!
//! This module defines the complete deployment structure for the
//! container tree. All types derive Serde traits for deserialization
//! from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration: one engine and its hosts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Engine name, used in logs.
    pub name: String,

    /// Host selected when the server name matches nothing.
    pub default_host: Option<String>,

    /// Virtual host definitions.
    pub hosts: Vec<HostConfig>,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "harbor".to_string(),
            default_host: None,
            hosts: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Virtual host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Primary host name, matched case-insensitively.
    pub name: String,

    /// Additional names routed to this host.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Applications mounted on this host.
    #[serde(default)]
    pub contexts: Vec<ContextConfig>,
}

/// Application context configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Mount path; empty string for the root context.
    pub path: String,

    /// Container name; derived from the path when absent.
    pub name: Option<String>,

    /// Context-level init parameters, visible to every handler.
    #[serde(default)]
    pub init_params: HashMap<String, String>,

    /// Handler definitions.
    #[serde(default)]
    pub handlers: Vec<HandlerDefConfig>,

    /// Interceptor definitions.
    #[serde(default)]
    pub interceptors: Vec<InterceptorDefConfig>,

    /// Mappings selecting interceptors per request.
    #[serde(default)]
    pub interceptor_mappings: Vec<InterceptorMappingConfig>,
}

impl ContextConfig {
    /// Container name for this context.
    pub fn container_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None if self.path.is_empty() => "ROOT".to_string(),
            None => self.path.trim_start_matches('/').replace('/', "-"),
        }
    }
}

/// One handler and its wrapper settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandlerDefConfig {
    /// Wrapper name, unique within the context.
    pub name: String,

    /// Factory key resolved against the handler registry.
    pub kind: String,

    /// URL patterns routed to this handler.
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Startup priority; negative means lazy (default: -1).
    #[serde(default = "default_load_on_startup")]
    pub load_on_startup: i32,

    /// Pool bound for exclusive handlers (default: 20).
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Handler-level init parameters, merged over the context's.
    #[serde(default)]
    pub init_params: HashMap<String, String>,
}

/// A named interceptor and its factory key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptorDefConfig {
    pub name: String,

    /// Factory key resolved against the handler registry.
    pub kind: String,

    #[serde(default)]
    pub init_params: HashMap<String, String>,
}

/// Applies a defined interceptor to a URL pattern or a handler name.
/// Exactly one of `pattern` and `handler` must be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptorMappingConfig {
    /// Name of a defined interceptor.
    pub interceptor: String,

    pub pattern: Option<String>,

    pub handler: Option<String>,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter (e.g., "info", "harbor=debug").
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_load_on_startup() -> i32 {
    -1
}

fn default_max_instances() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let config: ContainerConfig = toml::from_str("").unwrap();
        assert_eq!(config.name, "harbor");
        assert!(config.hosts.is_empty());
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_handler_defaults() {
        let config: ContainerConfig = toml::from_str(
            r#"
            [[hosts]]
            name = "localhost"

            [[hosts.contexts]]
            path = "/app"

            [[hosts.contexts.handlers]]
            name = "echo"
            kind = "echo"
            patterns = ["/echo/*"]
            "#,
        )
        .unwrap();
        let handler = &config.hosts[0].contexts[0].handlers[0];
        assert_eq!(handler.load_on_startup, -1);
        assert_eq!(handler.max_instances, 20);
    }

    #[test]
    fn test_context_name_derivation() {
        let root = ContextConfig {
            path: String::new(),
            name: None,
            init_params: HashMap::new(),
            handlers: Vec::new(),
            interceptors: Vec::new(),
            interceptor_mappings: Vec::new(),
        };
        assert_eq!(root.container_name(), "ROOT");

        let nested = ContextConfig {
            path: "/shop/admin".to_string(),
            ..root
        };
        assert_eq!(nested.container_name(), "shop-admin");
    }
}
