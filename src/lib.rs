//! Harbor: an embeddable application-hosting container core.
//!
//! # Architecture Overview
//!
//! ```text
//!              ┌─────────────────────────────────────────────┐
//!   Request ──▶│ ENGINE   pipeline ─▶ host routing (name)    │
//!              │ HOST     pipeline ─▶ context routing (path) │
//!              │ CONTEXT  pipeline ─▶ handler routing        │
//!   Response ◀─│ WRAPPER  pipeline ─▶ interceptors ─▶ handler│
//!              └─────────────────────────────────────────────┘
//! ```
//!
//! Every level is the same `Container` type with a kind tag; each owns a
//! pipeline of stages whose basic stage routes to the next level down.
//! Forward/include re-entry, instance pooling and in-place context
//! reload live in their own modules.

// Core tree and request processing
pub mod container;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod routing;
pub mod scope;

// Deployment and ownership
pub mod config;
pub mod deploy;
pub mod server;

// Cross-cutting concerns
pub mod observability;

pub use config::ContainerConfig;
pub use container::Container;
pub use error::{ContainerError, Result};
pub use handler::{Handler, HandlerConfig, HandlerFactory};
pub use request::Request;
pub use response::Response;
pub use server::{Server, Shutdown};
