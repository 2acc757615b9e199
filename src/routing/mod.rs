//! Per-container routing tables.
//!
//! # Data Flow
//! ```text
//! Engine basic stage  → HostRouter    (server name → Host)
//! Host basic stage    → PathRouter    (longest context-path prefix → Context)
//! Context basic stage → PatternRouter (URL pattern → Wrapper)
//! ```
//!
//! # Responsibilities
//! - Select the next child container for a request, per protocol
//! - Stay consistent with the container tree via change notifications
//!
//! # Design Decisions
//! - Tables are long-lived, read concurrently by all request workers;
//!   mutation happens only at deployment time under short lock sections
//! - Explicit no-match (`None`) rather than a silent default; the caller
//!   turns it into a 404

pub mod host;
pub mod path;
pub mod pattern;

use std::sync::Arc;

use crate::container::Container;
use crate::request::Request;

pub use host::HostRouter;
pub use path::PathRouter;
pub use pattern::{PatternRouter, UrlPattern};

/// Per-protocol lookup structure selecting a child container.
pub trait RoutingTable: Send + Sync {
    /// Protocol tag this table serves (e.g. "http").
    fn protocol(&self) -> &str;

    /// Select the child container for the request. When `update` is set
    /// the table records its routing result on the request (context path,
    /// handler path, path info).
    fn map(&self, req: &mut Request, update: bool) -> Option<Arc<Container>>;
}
