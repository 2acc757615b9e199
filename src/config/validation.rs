//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (default host, interceptor mappings)
//! - Validate URL patterns before they reach a routing table
//! - Detect duplicate names that the tree would reject at build time
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function over the parsed config
//! - Runs before the config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::ContainerConfig;
use crate::routing::UrlPattern;

/// One semantic problem in a parsed configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration. Empty result means the config is
/// deployable.
pub fn validate(config: &ContainerConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |field: &str, message: String| {
        errors.push(ValidationError {
            field: field.to_string(),
            message,
        });
    };

    let mut host_names = HashSet::new();
    for host in &config.hosts {
        if !host_names.insert(host.name.to_lowercase()) {
            push("hosts.name", format!("duplicate host '{}'", host.name));
        }
    }

    if let Some(default) = &config.default_host {
        if !host_names.contains(&default.to_lowercase()) {
            push(
                "default_host",
                format!("'{default}' does not name a configured host"),
            );
        }
    }

    for host in &config.hosts {
        let mut paths = HashSet::new();
        for context in &host.contexts {
            if !context.path.is_empty() && !context.path.starts_with('/') {
                push(
                    "contexts.path",
                    format!(
                        "'{}' on host '{}' must start with '/' or be empty",
                        context.path, host.name
                    ),
                );
            }
            if !paths.insert(context.path.clone()) {
                push(
                    "contexts.path",
                    format!("duplicate path '{}' on host '{}'", context.path, host.name),
                );
            }

            let mut handler_names = HashSet::new();
            for handler in &context.handlers {
                if !handler_names.insert(handler.name.clone()) {
                    push(
                        "handlers.name",
                        format!(
                            "duplicate handler '{}' in context '{}'",
                            handler.name, context.path
                        ),
                    );
                }
                for pattern in &handler.patterns {
                    if let Err(err) = UrlPattern::parse(pattern) {
                        push("handlers.patterns", err.to_string());
                    }
                }
                if handler.max_instances == 0 {
                    push(
                        "handlers.max_instances",
                        format!("handler '{}' needs at least one instance", handler.name),
                    );
                }
            }

            let interceptor_names: HashSet<&str> = context
                .interceptors
                .iter()
                .map(|i| i.name.as_str())
                .collect();
            for mapping in &context.interceptor_mappings {
                if !interceptor_names.contains(mapping.interceptor.as_str()) {
                    push(
                        "interceptor_mappings.interceptor",
                        format!("'{}' is not a defined interceptor", mapping.interceptor),
                    );
                }
                match (&mapping.pattern, &mapping.handler) {
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => push(
                        "interceptor_mappings",
                        format!(
                            "mapping for '{}' must set exactly one of pattern and handler",
                            mapping.interceptor
                        ),
                    ),
                }
                if let Some(pattern) = &mapping.pattern {
                    if let Err(err) = UrlPattern::parse(pattern) {
                        push("interceptor_mappings.pattern", err.to_string());
                    }
                }
                if let Some(handler) = &mapping.handler {
                    if !handler_names.contains(handler) {
                        push(
                            "interceptor_mappings.handler",
                            format!("'{handler}' is not a defined handler"),
                        );
                    }
                }
            }
        }
    }

    errors
}
