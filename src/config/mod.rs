//! Declarative deployment configuration.
//!
//! # Data Flow
//! ```text
//! TOML file → loader (read + parse) → validation (all errors at once)
//!           → deploy (assemble the container tree)
//! ```

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ContainerConfig, ContextConfig, HandlerDefConfig, HostConfig, InterceptorDefConfig,
    InterceptorMappingConfig, LogFormat, ObservabilityConfig,
};
pub use validation::{validate, ValidationError};
