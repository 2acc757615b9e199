//! Container lifecycle state machine.
//!
//! # Data Flow
//! ```text
//! start():  NEW/STOPPED → STARTING → STARTED
//!           before-start → subordinates → routers → children → pipeline → after-start
//! stop():   STARTED → STOPPING → STOPPED
//!           before-stop → pipeline → children → routers → subordinates → after-stop
//! reload(): STARTED contexts only; the node itself survives
//! ```
//!
//! # Design Decisions
//! - Notifications are delivered synchronously on the mutating task
//! - Starting a started container (or stopping a stopped one) is an error,
//!   not a no-op

use crate::container::Container;

/// Discrete lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Notifications fired across a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeforeStart,
    Start,
    AfterStart,
    BeforeStop,
    Stop,
    AfterStop,
    /// Fired by a context after a successful reload.
    Reload,
}

/// Observer of lifecycle transitions.
pub trait LifecycleListener: Send + Sync {
    fn lifecycle_event(&self, source: &Container, event: LifecycleEvent);
}
