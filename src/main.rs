//! Harbor container daemon.
//!
//! Loads a deployment config, assembles the container tree with the
//! built-in demo handlers, starts it and runs until interrupted. SIGHUP
//! reloads every deployed context in place.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use harbor::config::{load_config, ContainerConfig};
use harbor::container::ContainerKind;
use harbor::deploy::{self, HandlerRegistry};
use harbor::{Handler, Request, Response, Result};

#[derive(Parser)]
#[command(name = "harbor", about = "Application-hosting container daemon")]
struct Args {
    /// Path to the deployment config (TOML). Defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Demo handler: echoes the effective request line back.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn service(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        res.set_header("Content-Type", "text/plain");
        res.write(format!("{} {}\n", req.method(), req.uri()).as_bytes())?;
        Ok(())
    }
}

fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_handler("echo", Arc::new(|| -> Result<Arc<dyn Handler>> {
        Ok(Arc::new(EchoHandler))
    }));
    registry
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ContainerConfig::default(),
    };
    harbor::observability::logging::init(&config.observability);

    tracing::info!(engine = %config.name, "harbor starting");

    let server = deploy::build(&config, &builtin_registry()).await?;
    server.start().await?;
    tracing::info!("container tree started");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = hup.recv() => reload_contexts(server.engine()).await,
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    server.stop().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Reload every context in the tree, in place.
async fn reload_contexts(engine: &Arc<harbor::Container>) {
    for host in engine.children() {
        for context in host.children() {
            if context.kind() == ContainerKind::Context {
                if let Err(err) = context.reload().await {
                    tracing::error!(context = context.name(), error = %err, "reload failed");
                }
            }
        }
    }
}
