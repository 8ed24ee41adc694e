//! Worker side of the wire protocol.
//!
//! Runs JavaScript requests through the in-process sandbox. Each request
//! runs in its own task so a `cancel` frame can abort it; an aborted
//! request never gets a response.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionRequest, InProcessSandbox, ScriptBackend};
use crate::capability::{CapabilityContext, CollectingLogSink};
use crate::config::{SandboxConfig, WorkerConfig};
use crate::modules::ModuleRegistry;
use crate::static_data::StaticDataChanges;

use super::protocol::{ClientFrame, WorkerRequest, WorkerResponse};

/// Executes worker requests.
#[derive(Debug, Clone)]
pub struct WorkerServer {
    sandbox: InProcessSandbox,
    max_frame_bytes: usize,
}

impl WorkerServer {
    /// Server running requests through `sandbox`.
    pub fn new(sandbox: InProcessSandbox, max_frame_bytes: usize) -> Self {
        Self {
            sandbox,
            max_frame_bytes,
        }
    }

    /// Server configured like an in-process host with the same config.
    pub fn from_config(config: &SandboxConfig, registry: &ModuleRegistry) -> Self {
        let sandbox = InProcessSandbox::new(
            config.limits,
            config.execution_timeout(),
            Arc::new(registry.resolve(&config.modules)),
        );
        let max_frame_bytes = config
            .worker
            .as_ref()
            .map_or(WorkerConfig::default().max_frame_bytes, |w| w.max_frame_bytes);
        Self::new(sandbox, max_frame_bytes)
    }

    /// Runs one request to completion.
    pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        let invocation_id = request.invocation_id;
        let logs = Arc::new(CollectingLogSink::new());

        let view = match request.view() {
            Ok(view) => view,
            Err(e) => {
                return WorkerResponse::from_result(
                    invocation_id,
                    Err(e),
                    Vec::new(),
                    StaticDataChanges::default(),
                );
            }
        };
        let before = request.capability_context_projection.static_data.clone();
        let context = CapabilityContext::from_projection(
            request.capability_context_projection,
            view,
            logs.clone(),
        );
        let static_data = context.static_data().clone();

        let result = self
            .sandbox
            .execute(ExecutionRequest {
                invocation_id,
                unit: request.script_unit,
                context,
            })
            .await;

        let changes = StaticDataChanges::diff(&before, &static_data.snapshot());
        WorkerResponse::from_result(invocation_id, result, logs.take(), changes)
    }
}

/// Accepts connections on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, server: Arc<WorkerServer>, shutdown: CancellationToken) {
    if let Ok(address) = listener.local_addr() {
        tracing::info!(address = %address, "sandbox worker listening");
    }

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&server),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "failed to accept worker connection"),
            },
        }
    }

    tracing::info!("sandbox worker stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<WorkerServer>,
    shutdown: CancellationToken,
) {
    tracing::debug!(peer = %peer, "worker connection opened");

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(server.max_frame_bytes));
    let (mut sink, mut frames) = framed.split();

    let (responses, mut responses_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = responses_rx.recv().await {
            if let Err(e) = sink.send(line).await {
                tracing::warn!(error = %e, "failed to write worker response");
                break;
            }
        }
    });

    let in_flight: Arc<DashMap<Uuid, AbortHandle>> = Arc::new(DashMap::new());

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let line = match frame {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::warn!(peer = %peer, error = %e, "failed to read worker frame");
                break;
            }
            None => break,
        };

        match serde_json::from_str::<ClientFrame>(&line) {
            Ok(ClientFrame::Execute(request)) => {
                let invocation_id = request.invocation_id;
                let server = Arc::clone(&server);
                let responses = responses.clone();
                let in_flight_ref = Arc::clone(&in_flight);
                let task = tokio::spawn(async move {
                    let response = server.handle(request).await;
                    in_flight_ref.remove(&invocation_id);
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            let _ = responses.send(line);
                        }
                        Err(e) => tracing::warn!(
                            invocation_id = %invocation_id,
                            error = %e,
                            "failed to encode worker response"
                        ),
                    }
                });
                in_flight.insert(invocation_id, task.abort_handle());
            }
            Ok(ClientFrame::Cancel { invocation_id }) => {
                if let Some((_, task)) = in_flight.remove(&invocation_id) {
                    task.abort();
                    tracing::debug!(invocation_id = %invocation_id, "cancelled worker request");
                }
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "ignoring malformed client frame"),
        }
    }

    for entry in in_flight.iter() {
        entry.value().abort();
    }
    drop(responses);
    let _ = writer.await;
    tracing::debug!(peer = %peer, "worker connection closed");
}
