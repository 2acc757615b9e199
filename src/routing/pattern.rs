//! URL pattern matching.
//!
//! # Responsibilities
//! - Parse and validate the four pattern forms (exact, prefix, extension,
//!   default)
//! - Best-match selection for wrapper routing
//! - Single-pattern match tests for interceptor selection
//!
//! # Design Decisions
//! - Precedence is exact > longest prefix > extension > default
//! - An extension pattern only applies when the final path segment carries
//!   the dot (no `/` after the last `.`)
//! - No regex; matching is O(patterns) string comparison

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::container::Container;
use crate::error::{ContainerError, Result};
use crate::request::Request;
use crate::routing::RoutingTable;

/// A validated URL pattern.
///
/// Valid forms: `/exact/path`, `/prefix/*`, `*.ext`, `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Exact(String),
    /// Stored without the trailing `/*`; `/*` itself is the empty prefix.
    Prefix(String),
    Extension(String),
    Default,
}

impl UrlPattern {
    /// Parse a pattern string, rejecting anything outside the four forms.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == "/" {
            return Ok(UrlPattern::Default);
        }
        if let Some(ext) = raw.strip_prefix("*.") {
            if ext.is_empty() || ext.contains('/') {
                return Err(ContainerError::InvalidPattern(raw.to_string()));
            }
            return Ok(UrlPattern::Extension(ext.to_string()));
        }
        if !raw.starts_with('/') {
            return Err(ContainerError::InvalidPattern(raw.to_string()));
        }
        if let Some(prefix) = raw.strip_suffix("/*") {
            return Ok(UrlPattern::Prefix(prefix.to_string()));
        }
        Ok(UrlPattern::Exact(raw.to_string()))
    }

    /// True when this pattern matches the (context-relative) path.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Exact(p) => path == p,
            UrlPattern::Prefix(p) => {
                path == p || (path.len() > p.len() && path[p.len()..].starts_with('/'))
            }
            UrlPattern::Extension(ext) => extension_of(path) == Some(ext.as_str()),
            UrlPattern::Default => true,
        }
    }
}

impl std::fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlPattern::Exact(p) => write!(f, "{p}"),
            UrlPattern::Prefix(p) => write!(f, "{p}/*"),
            UrlPattern::Extension(e) => write!(f, "*.{e}"),
            UrlPattern::Default => write!(f, "/"),
        }
    }
}

/// Extension of the final path segment, if the final segment has one.
fn extension_of(path: &str) -> Option<&str> {
    let dot = path.rfind('.')?;
    let rest = &path[dot + 1..];
    if rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Result of a best-match lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Matched portion relative to the context.
    pub handler_path: String,
    /// Remainder after a prefix match, `None` otherwise.
    pub path_info: Option<String>,
}

struct PatternTables {
    exact: HashMap<String, Arc<Container>>,
    // Kept sorted by prefix length, longest first.
    prefixes: Vec<(String, Arc<Container>)>,
    extensions: HashMap<String, Arc<Container>>,
    default: Option<Arc<Container>>,
}

/// Pattern set selecting a wrapper for a context-relative path.
pub struct PatternRouter {
    protocol: String,
    tables: RwLock<PatternTables>,
}

impl PatternRouter {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            tables: RwLock::new(PatternTables {
                exact: HashMap::new(),
                prefixes: Vec::new(),
                extensions: HashMap::new(),
                default: None,
            }),
        }
    }

    /// Register a pattern for a target wrapper.
    pub fn register(&self, raw: &str, target: Arc<Container>) -> Result<()> {
        let pattern = UrlPattern::parse(raw)?;
        let mut tables = self.tables.write().unwrap();
        match pattern {
            UrlPattern::Exact(p) => {
                tables.exact.insert(p, target);
            }
            UrlPattern::Prefix(p) => {
                tables.prefixes.retain(|(existing, _)| *existing != p);
                tables.prefixes.push((p, target));
                tables.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            UrlPattern::Extension(e) => {
                tables.extensions.insert(e, target);
            }
            UrlPattern::Default => {
                tables.default = Some(target);
            }
        }
        Ok(())
    }

    /// Drop every registration pointing at the named wrapper. Used when a
    /// wrapper is removed from its context.
    pub fn unregister_target(&self, wrapper_name: &str) {
        let mut tables = self.tables.write().unwrap();
        tables.exact.retain(|_, c| c.name() != wrapper_name);
        tables.prefixes.retain(|(_, c)| c.name() != wrapper_name);
        tables.extensions.retain(|_, c| c.name() != wrapper_name);
        if tables
            .default
            .as_ref()
            .is_some_and(|c| c.name() == wrapper_name)
        {
            tables.default = None;
        }
    }

    /// Best-match lookup on a context-relative path.
    pub fn match_path(&self, path: &str) -> Option<(Arc<Container>, PatternMatch)> {
        let tables = self.tables.read().unwrap();

        if let Some(target) = tables.exact.get(path) {
            return Some((
                target.clone(),
                PatternMatch {
                    handler_path: path.to_string(),
                    path_info: None,
                },
            ));
        }

        // Longest prefix first; the list is kept sorted.
        for (prefix, target) in &tables.prefixes {
            let pattern = UrlPattern::Prefix(prefix.clone());
            if pattern.matches(path) {
                let info = &path[prefix.len()..];
                return Some((
                    target.clone(),
                    PatternMatch {
                        handler_path: prefix.clone(),
                        path_info: if info.is_empty() {
                            None
                        } else {
                            Some(info.to_string())
                        },
                    },
                ));
            }
        }

        if let Some(ext) = extension_of(path) {
            if let Some(target) = tables.extensions.get(ext) {
                return Some((
                    target.clone(),
                    PatternMatch {
                        handler_path: path.to_string(),
                        path_info: None,
                    },
                ));
            }
        }

        tables.default.as_ref().map(|target| {
            (
                target.clone(),
                PatternMatch {
                    handler_path: path.to_string(),
                    path_info: None,
                },
            )
        })
    }
}

impl RoutingTable for PatternRouter {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn map(&self, req: &mut Request, update: bool) -> Option<Arc<Container>> {
        let context_path = req.context_path().to_string();
        let relative = req
            .uri()
            .strip_prefix(context_path.as_str())
            .unwrap_or(req.uri());
        let relative = if relative.is_empty() { "/" } else { relative };
        let (target, matched) = self.match_path(relative)?;
        if update {
            req.set_handler_path(matched.handler_path);
            req.set_path_info(matched.path_info);
        }
        Some(target)
    }
}
