//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, file, remote)
//!     → Whatever metrics recorder the embedding binary installs
//! ```
//!
//! # Design Decisions
//! - Structured logging; request ID flows through all stages
//! - Metrics go through the `metrics` facade, so the embedder picks the
//!   exporter
//! - Metric updates are cheap (atomic increments)

pub mod logging;
pub mod metrics;
