//! The per-request processing unit a pipeline is built from.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::PipelineCursor;
use crate::request::Request;
use crate::response::Response;

/// Ownership marker embedded in every stage.
///
/// Exactly one pipeline may own a stage at a time; the anchor is claimed
/// when the stage is added and released when it is removed or replaced.
pub struct StageAnchor {
    owned: AtomicBool,
}

impl StageAnchor {
    pub fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
        }
    }

    pub(crate) fn claim(&self) -> bool {
        !self.owned.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        self.owned.store(false, Ordering::SeqCst);
    }
}

impl Default for StageAnchor {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of per-request processing within a pipeline.
///
/// Stages are stateless or request-scoped; the pipeline passes each stage
/// the per-invocation cursor as its continuation, and the stage decides
/// whether to call `next.invoke_next` or short-circuit.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Ownership marker; implementations embed a [`StageAnchor`] field.
    fn anchor(&self) -> &StageAnchor;

    /// Lifecycle hook, called when the owning pipeline starts.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Lifecycle hook, called when the owning pipeline stops.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        next: &PipelineCursor,
    ) -> Result<()>;
}
