//! Standalone sandbox worker.
//!
//! Listens on `NEBULA_SANDBOX_WORKER_LISTEN` (default `127.0.0.1:5679`) and
//! runs JavaScript requests from Nebula hosts until interrupted. Sandbox
//! limits and module policy come from the `NEBULA_SANDBOX_*` variables.

use std::sync::Arc;

use anyhow::Context as _;
use nebula_sandbox::modules::ModuleRegistry;
use nebula_sandbox::worker::{WorkerServer, serve};
use nebula_sandbox::SandboxConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DEFAULT_LISTEN: &str = "127.0.0.1:5679";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = nebula_log::auto_init()?;

    let config = SandboxConfig::from_env().context("invalid sandbox configuration")?;
    let listen =
        std::env::var("NEBULA_SANDBOX_WORKER_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_owned());

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    let server = Arc::new(WorkerServer::from_config(&config, &ModuleRegistry::with_builtins()));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        signal.cancel();
    });

    serve(listener, server, shutdown).await;
    Ok(())
}
