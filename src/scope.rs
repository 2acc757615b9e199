//! Application-scope state owned by a context.
//!
//! # Responsibilities
//! - Per-context attribute store shared by all handlers in the context
//! - Context-level init parameters merged into handler configs
//! - Synchronous listener notification on attribute changes
//!
//! # Design Decisions
//! - DashMap for the attribute store: read-heavy, written by handlers at
//!   request time without a context-wide lock
//! - Listeners run on the mutating task; they must not assume async delivery

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;

/// Notification delivered to [`ScopeListener`]s.
#[derive(Debug, Clone)]
pub enum ScopeEvent {
    /// The scope became live (context start or reload).
    Initialized,
    /// The scope is being torn down (context stop or reload).
    Destroyed,
    AttributeAdded { name: String, value: Value },
    AttributeReplaced { name: String, old: Value },
    AttributeRemoved { name: String, value: Value },
}

/// Observer of application-scope changes.
pub trait ScopeListener: Send + Sync {
    fn scope_event(&self, event: &ScopeEvent);
}

/// Per-context attribute store plus init parameters and listeners.
pub struct AppScope {
    attributes: DashMap<String, Value>,
    init_params: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<Arc<dyn ScopeListener>>>,
}

impl AppScope {
    pub fn new() -> Self {
        Self {
            attributes: DashMap::new(),
            init_params: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name).map(|v| v.clone())
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let old = self.attributes.insert(name.clone(), value.clone());
        match old {
            Some(old) => self.notify(&ScopeEvent::AttributeReplaced { name, old }),
            None => self.notify(&ScopeEvent::AttributeAdded { name, value }),
        }
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        let removed = self.attributes.remove(name).map(|(_, v)| v);
        if let Some(value) = removed.clone() {
            self.notify(&ScopeEvent::AttributeRemoved {
                name: name.to_string(),
                value,
            });
        }
        removed
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn init_param(&self, name: &str) -> Option<String> {
        self.init_params.read().unwrap().get(name).cloned()
    }

    pub fn init_params(&self) -> HashMap<String, String> {
        self.init_params.read().unwrap().clone()
    }

    pub fn set_init_param(&self, name: impl Into<String>, value: impl Into<String>) {
        self.init_params
            .write()
            .unwrap()
            .insert(name.into(), value.into());
    }

    pub fn add_listener(&self, listener: Arc<dyn ScopeListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Drop all attributes and listeners, notifying `Destroyed` first.
    /// Used by context stop and reload; init parameters survive.
    pub(crate) fn tear_down(&self) {
        self.notify(&ScopeEvent::Destroyed);
        self.attributes.clear();
        self.listeners.write().unwrap().clear();
    }

    pub(crate) fn mark_initialized(&self) {
        self.notify(&ScopeEvent::Initialized);
    }

    fn notify(&self, event: &ScopeEvent) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners {
            listener.scope_event(event);
        }
    }
}

impl Default for AppScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ScopeListener for Recorder {
        fn scope_event(&self, event: &ScopeEvent) {
            let tag = match event {
                ScopeEvent::Initialized => "init".to_string(),
                ScopeEvent::Destroyed => "destroy".to_string(),
                ScopeEvent::AttributeAdded { name, .. } => format!("add:{name}"),
                ScopeEvent::AttributeReplaced { name, .. } => format!("replace:{name}"),
                ScopeEvent::AttributeRemoved { name, .. } => format!("remove:{name}"),
            };
            self.events.lock().unwrap().push(tag);
        }
    }

    #[test]
    fn test_attribute_events_fire_in_order() {
        let scope = AppScope::new();
        let recorder = Arc::new(Recorder::default());
        scope.add_listener(recorder.clone());

        scope.set_attribute("k", Value::from(1));
        scope.set_attribute("k", Value::from(2));
        scope.remove_attribute("k");

        let events = recorder.events.lock().unwrap();
        assert_eq!(*events, vec!["add:k", "replace:k", "remove:k"]);
    }

    #[test]
    fn test_tear_down_clears_attributes_but_keeps_params() {
        let scope = AppScope::new();
        scope.set_init_param("greeting", "hello");
        scope.set_attribute("a", Value::from(true));
        scope.tear_down();
        assert!(scope.attribute("a").is_none());
        assert_eq!(scope.init_param("greeting").as_deref(), Some("hello"));
    }
}
