//! Top-level ownership of the container tree.
//!
//! # Responsibilities
//! - Own the engine and drive its lifecycle
//! - Offer the single request entry point to connector code
//! - Coordinate graceful shutdown across long-running tasks
//!
//! # Design Decisions
//! - The server turns handler failures into 500s at the boundary; inside
//!   the tree they stay typed errors
//! - Shutdown is a broadcast channel so any number of connector tasks
//!   can wait on it

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::container::Container;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can
/// subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled application server: one engine plus shutdown plumbing.
pub struct Server {
    engine: Arc<Container>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(engine: Arc<Container>) -> Self {
        Self {
            engine,
            shutdown: Shutdown::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Container> {
        &self.engine
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub async fn start(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Stop the tree and wake every shutdown subscriber.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.trigger();
        self.engine.stop().await
    }

    /// Process one request end to end. Failures that escape the tree
    /// are logged and become a 500 here.
    pub async fn invoke(&self, req: &mut Request) -> Response {
        let mut res = Response::new();
        if let Err(err) = self.engine.invoke(req, &mut res).await {
            tracing::error!(request_id = %req.id(), error = %err, "request failed");
            res.send_error(500, "internal error");
        }
        res.close();
        res
    }
}
