//! Error taxonomy for the container core.
//!
//! # Responsibilities
//! - Distinguish configuration-time errors from request-time failures
//! - Carry unavailability windows as data, not panics
//! - Keep routing misses out of the error path (they are normal outcomes)
//!
//! # Design Decisions
//! - One crate-level enum; callers match on variants they can handle
//! - Unavailability is a distinguished condition with a retry-after hint,
//!   translated to a 503 at the wrapper stage rather than propagated
//! - Handler failures are wrapped, never swallowed

use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Boxed error type for failures raised inside application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// All error conditions the container core can raise.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ContainerError {
    /// A sibling with the same name already exists. Raised at the mutating
    /// call; the parent's children are left unchanged.
    #[error("duplicate child name '{0}'")]
    DuplicateChild(String),

    /// A URL pattern that is neither `/...`, `/.../*`, `*.ext` nor `/`.
    #[error("invalid url pattern '{0}'")]
    InvalidPattern(String),

    /// A request reached a pipeline with no basic stage installed. Fatal
    /// for that request, not for the container.
    #[error("pipeline has no basic stage")]
    PipelineMisconfigured,

    /// The stage is already owned by another pipeline.
    #[error("stage '{0}' is already owned by a pipeline")]
    StageOwned(String),

    /// The handler or its context is inside an unavailability window.
    /// `retry_after` is the remaining window in seconds, when known.
    #[error("handler unavailable (permanent: {permanent}, retry_after: {retry_after:?})")]
    Unavailable {
        retry_after: Option<u64>,
        permanent: bool,
    },

    /// An operation was invoked in a state that forbids it, e.g. forwarding
    /// on a committed response or reloading a non-context container.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Lifecycle misuse: starting a started container, stopping a stopped one.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// The deployer has no factory registered under the requested name.
    #[error("no factory registered for '{0}'")]
    UnknownFactory(String),

    /// A failure raised by handler or interceptor code (init, service,
    /// intercept or destroy). Propagated to the pipeline caller unchanged.
    #[error("handler failure: {0}")]
    Handler(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// I/O failure on the underlying connection. Terminates the pipeline
    /// invocation for the affected request only.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl ContainerError {
    /// Wrap an application-level failure.
    pub fn handler(err: impl Into<HandlerError>) -> Self {
        ContainerError::Handler(Arc::from(err.into()))
    }

    /// Temporary unavailability with a retry hint in seconds.
    pub fn unavailable(retry_after_secs: u64) -> Self {
        ContainerError::Unavailable {
            retry_after: Some(retry_after_secs),
            permanent: false,
        }
    }

    /// Permanent unavailability (e.g. a handler whose init failed).
    pub fn permanently_unavailable() -> Self {
        ContainerError::Unavailable {
            retry_after: None,
            permanent: true,
        }
    }

    /// True for any unavailability condition, temporary or permanent.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ContainerError::Unavailable { .. })
    }
}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        ContainerError::Io(Arc::new(err))
    }
}
