//! Per-container processing pipeline.
//!
//! # Data Flow
//! ```text
//! Container::invoke
//!     → Pipeline::invoke (loads snapshot, builds one cursor)
//!     → Stage 1 → Stage 2 → ... → Basic Stage
//! ```
//!
//! # Responsibilities
//! - Hold the ordered stage list plus the distinguished basic stage
//! - Build one fresh cursor per invocation (never shared across requests)
//! - Enforce single-pipeline stage ownership
//!
//! # Design Decisions
//! - The stage list is an arc-swapped snapshot: request traffic reads it
//!   lock-free, configuration swaps it whole (mutation is expected only
//!   outside steady-state traffic)
//! - The cursor is a value created per call, so the traversal state is an
//!   immutable list plus a per-call index, never a shared iterator

pub mod basic;
pub mod stage;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;

use crate::error::{ContainerError, Result};
use crate::request::Request;
use crate::response::Response;

pub use stage::{Stage, StageAnchor};

/// Immutable view of the stage list taken per invocation.
struct Snapshot {
    stages: Vec<Arc<dyn Stage>>,
    basic: Option<Arc<dyn Stage>>,
}

/// Ordered chain of stages terminating in one basic stage.
pub struct Pipeline {
    snapshot: ArcSwap<Snapshot>,
    // Serializes configuration changes; never held across request traffic.
    mutation: Mutex<()>,
    started: AtomicBool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot {
                stages: Vec::new(),
                basic: None,
            }),
            mutation: Mutex::new(()),
            started: AtomicBool::new(false),
        }
    }

    /// Append a stage ahead of the basic stage.
    ///
    /// Fails if the stage is already owned by a pipeline. If this pipeline
    /// is already started the stage is started immediately.
    pub async fn add_stage(&self, stage: Arc<dyn Stage>) -> Result<()> {
        {
            let _guard = self.mutation.lock().unwrap();
            if !stage.anchor().claim() {
                return Err(ContainerError::StageOwned(stage.name().to_string()));
            }
            let current = self.snapshot.load();
            let mut stages = current.stages.clone();
            stages.push(stage.clone());
            self.snapshot.store(Arc::new(Snapshot {
                stages,
                basic: current.basic.clone(),
            }));
        }
        if self.started.load(Ordering::SeqCst) {
            stage.start().await?;
        }
        Ok(())
    }

    /// Remove a stage by name. Returns the removed stage, stopped if the
    /// pipeline was started, with its anchor released.
    pub async fn remove_stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        let removed = {
            let _guard = self.mutation.lock().unwrap();
            let current = self.snapshot.load();
            let mut stages = current.stages.clone();
            let pos = stages.iter().position(|s| s.name() == name)?;
            let removed = stages.remove(pos);
            self.snapshot.store(Arc::new(Snapshot {
                stages,
                basic: current.basic.clone(),
            }));
            removed
        };
        if self.started.load(Ordering::SeqCst) {
            if let Err(err) = removed.stop().await {
                tracing::warn!(stage = removed.name(), error = %err, "stage stop failed");
            }
        }
        removed.anchor().release();
        Some(removed)
    }

    /// Install the basic stage, replacing any previous one.
    ///
    /// The old basic stage is stopped (if the pipeline was started) and
    /// its pipeline association is released before the new one goes in.
    pub async fn set_basic(&self, stage: Arc<dyn Stage>) -> Result<()> {
        let old = self.install_basic(stage.clone())?;
        if let Some(old) = old {
            if self.started.load(Ordering::SeqCst) {
                if let Err(err) = old.stop().await {
                    tracing::warn!(stage = old.name(), error = %err, "old basic stage stop failed");
                }
            }
            old.anchor().release();
        }
        if self.started.load(Ordering::SeqCst) {
            stage.start().await?;
        }
        Ok(())
    }

    /// Synchronous basic-stage install used at construction time, before
    /// the pipeline has ever started.
    pub(crate) fn install_basic(&self, stage: Arc<dyn Stage>) -> Result<Option<Arc<dyn Stage>>> {
        let _guard = self.mutation.lock().unwrap();
        if !stage.anchor().claim() {
            return Err(ContainerError::StageOwned(stage.name().to_string()));
        }
        let current = self.snapshot.load();
        let old = current.basic.clone();
        self.snapshot.store(Arc::new(Snapshot {
            stages: current.stages.clone(),
            basic: Some(stage),
        }));
        Ok(old)
    }

    /// Names of the non-basic stages, in order.
    pub fn stage_names(&self) -> Vec<String> {
        self.snapshot
            .load()
            .stages
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn has_basic(&self) -> bool {
        self.snapshot.load().basic.is_some()
    }

    /// Run one request through the chain.
    ///
    /// Builds one fresh cursor per call; concurrent invocations share the
    /// same snapshot but never the cursor.
    pub async fn invoke(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        let cursor = PipelineCursor {
            snapshot: self.snapshot.load_full(),
            position: AtomicUsize::new(0),
        };
        cursor.invoke_next(req, res).await
    }

    pub(crate) async fn start(&self) -> Result<()> {
        let snapshot = self.snapshot.load_full();
        for stage in &snapshot.stages {
            stage.start().await?;
        }
        if let Some(basic) = &snapshot.basic {
            basic.start().await?;
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        let snapshot = self.snapshot.load_full();
        if let Some(basic) = &snapshot.basic {
            if let Err(err) = basic.stop().await {
                tracing::warn!(stage = basic.name(), error = %err, "basic stage stop failed");
            }
        }
        for stage in snapshot.stages.iter().rev() {
            if let Err(err) = stage.stop().await {
                tracing::warn!(stage = stage.name(), error = %err, "stage stop failed");
            }
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-invocation traversal state: the snapshot plus an index advanced
/// exactly once per step.
pub struct PipelineCursor {
    snapshot: Arc<Snapshot>,
    position: AtomicUsize,
}

impl PipelineCursor {
    /// Advance to the next stage, or the basic stage past the end.
    ///
    /// A request that runs off the end of a pipeline with no basic stage
    /// fails with `PipelineMisconfigured`; that is fatal for the request,
    /// not for the container.
    pub fn invoke_next<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pos = self.position.fetch_add(1, Ordering::SeqCst);
            if let Some(stage) = self.snapshot.stages.get(pos) {
                return stage.invoke(req, res, self).await;
            }
            if pos == self.snapshot.stages.len() {
                if let Some(basic) = &self.snapshot.basic {
                    return basic.invoke(req, res, self).await;
                }
            }
            Err(ContainerError::PipelineMisconfigured)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingStage {
        name: String,
        anchor: StageAnchor,
        log: Arc<StdMutex<Vec<String>>>,
        proceed: bool,
    }

    impl RecordingStage {
        fn new(name: &str, log: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                anchor: StageAnchor::new(),
                log,
                proceed: true,
            })
        }

        fn terminal(name: &str, log: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                anchor: StageAnchor::new(),
                log,
                proceed: false,
            })
        }
    }

    #[async_trait]
    impl Stage for RecordingStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn anchor(&self) -> &StageAnchor {
            &self.anchor
        }

        async fn invoke(
            &self,
            req: &mut Request,
            res: &mut Response,
            next: &PipelineCursor,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.proceed {
                next.invoke_next(req, res).await
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order_then_basic() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline
            .add_stage(RecordingStage::new("s1", log.clone()))
            .await
            .unwrap();
        pipeline
            .add_stage(RecordingStage::new("s2", log.clone()))
            .await
            .unwrap();
        pipeline
            .set_basic(RecordingStage::terminal("basic", log.clone()))
            .await
            .unwrap();

        let mut req = Request::new("http", "localhost", "GET", "/");
        let mut res = Response::new();
        pipeline.invoke(&mut req, &mut res).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["s1", "s2", "basic"]);

        // A second invocation gets a fresh cursor and replays the chain.
        pipeline.invoke(&mut req, &mut res).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_missing_basic_stage_fails_the_request() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        pipeline
            .add_stage(RecordingStage::new("s1", log.clone()))
            .await
            .unwrap();

        let mut req = Request::new("http", "localhost", "GET", "/");
        let mut res = Response::new();
        let err = pipeline.invoke(&mut req, &mut res).await.unwrap_err();
        assert!(matches!(err, ContainerError::PipelineMisconfigured));
    }

    #[tokio::test]
    async fn test_stage_cannot_join_two_pipelines() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let stage = RecordingStage::new("shared", log);
        let p1 = Pipeline::new();
        let p2 = Pipeline::new();
        p1.add_stage(stage.clone()).await.unwrap();
        let err = p2.add_stage(stage.clone()).await.unwrap_err();
        assert!(matches!(err, ContainerError::StageOwned(_)));

        // Removal releases the anchor; the stage may move on.
        p1.remove_stage("shared").await.unwrap();
        p2.add_stage(stage).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_basic_replaces_and_releases_old() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let old = RecordingStage::terminal("old", log.clone());
        let new = RecordingStage::terminal("new", log.clone());
        let pipeline = Pipeline::new();
        pipeline.set_basic(old.clone()).await.unwrap();
        pipeline.set_basic(new).await.unwrap();

        let mut req = Request::new("http", "localhost", "GET", "/");
        let mut res = Response::new();
        pipeline.invoke(&mut req, &mut res).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["new"]);

        // The replaced stage is free to join another pipeline.
        let other = Pipeline::new();
        other.set_basic(old).await.unwrap();
    }
}
