//! Host side of the external worker connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use uuid::Uuid;

use crate::backend::{BackendKind, ExecutionRequest};
use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::validate::GuestValue;

use super::protocol::{ClientFrame, WorkerRequest, WorkerResponse};

type Pending = DashMap<Uuid, oneshot::Sender<WorkerResponse>>;

/// Multiplexed connection to one external worker.
///
/// Any number of invocations may be in flight at once; responses are
/// matched to requests by invocation id. A response whose id is no longer
/// pending (timed out, cancelled, or duplicated) is dropped.
pub struct WorkerClient {
    address: String,
    request_timeout: Duration,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WorkerClient {
    /// Connects to the worker at `config.address`.
    ///
    /// Refused connections and connect timeouts are reported as
    /// [`SandboxError::BackendUnavailable`].
    pub async fn connect(config: &WorkerConfig) -> Result<Self, SandboxError> {
        let address = config.address.clone();
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| {
                SandboxError::unavailable(
                    BackendKind::ExternalWorker,
                    format!("connecting to {address} timed out after {:?}", config.connect_timeout()),
                )
            })?
            .map_err(|e| {
                SandboxError::unavailable(
                    BackendKind::ExternalWorker,
                    format!("cannot connect to {address}: {e}"),
                )
            })?;

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(config.max_frame_bytes));
        let (mut sink, stream) = framed.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    tracing::warn!(error = %e, "failed to write to worker");
                    break;
                }
            }
        });

        let pending = Arc::new(Pending::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(
            stream,
            Arc::clone(&pending),
            Arc::clone(&closed),
            address.clone(),
        ));

        tracing::debug!(address = %address, "connected to sandbox worker");

        Ok(Self {
            address,
            request_timeout: config.request_timeout(),
            outbound,
            pending,
            closed,
            reader,
        })
    }

    /// Address this client is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends `request` and waits for the worker's answer.
    ///
    /// Guest logs carried by the response are forwarded to the context's
    /// sink, in order, and static-data changes are written back before the
    /// result is returned. If the deadline passes, or the returned future
    /// is dropped, a cancel frame is sent for the request.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<GuestValue, SandboxError> {
        let ExecutionRequest {
            invocation_id,
            unit,
            context,
        } = request;

        let frame = ClientFrame::Execute(WorkerRequest::new(invocation_id, unit, &context));
        let line = serde_json::to_string(&frame)
            .map_err(|e| SandboxError::guest(format!("failed to encode worker request: {e}"), None))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(invocation_id, tx);
        let mut guard = InFlight {
            invocation_id,
            pending: &self.pending,
            outbound: &self.outbound,
            armed: true,
        };

        if self.closed.load(Ordering::Acquire) || self.outbound.send(line).is_err() {
            guard.armed = false;
            return Err(self.connection_closed());
        }

        tracing::debug!(
            invocation_id = %invocation_id,
            address = %self.address,
            item_index = ?context.view().item_index(),
            "dispatched to sandbox worker"
        );

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                tracing::warn!(
                    invocation_id = %invocation_id,
                    timeout = ?self.request_timeout,
                    "sandbox worker timed out; cancelling request"
                );
                return Err(SandboxError::timeout(BackendKind::ExternalWorker, self.request_timeout));
            }
            Ok(Err(_)) => {
                guard.armed = false;
                return Err(self.connection_closed());
            }
            Ok(Ok(response)) => response,
        };
        guard.armed = false;

        for entry in &response.logs {
            context.log_sink().log(entry.clone());
        }
        context.static_data().apply(&response.static_data);
        response.into_result()
    }

    fn connection_closed(&self) -> SandboxError {
        SandboxError::unavailable(
            BackendKind::ExternalWorker,
            format!("connection to {} closed", self.address),
        )
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        // The writer exits on its own once queued frames (such as a final
        // cancel) are flushed and the outbound sender is gone.
        self.reader.abort();
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("address", &self.address)
            .field("request_timeout", &self.request_timeout)
            .field("in_flight", &self.pending.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Removes the pending entry when an invocation ends, and tells the worker
/// to stop if it ended without a response.
struct InFlight<'a> {
    invocation_id: Uuid,
    pending: &'a Pending,
    outbound: &'a mpsc::UnboundedSender<String>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.invocation_id);
        if !self.armed {
            return;
        }
        let cancel = ClientFrame::Cancel {
            invocation_id: self.invocation_id,
        };
        if let Ok(line) = serde_json::to_string(&cancel) {
            let _ = self.outbound.send(line);
        }
    }
}

async fn read_responses(
    mut stream: futures::stream::SplitStream<Framed<TcpStream, LinesCodec>>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    address: String,
) {
    while let Some(frame) = stream.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "failed to read from worker");
                break;
            }
        };
        let response: WorkerResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "ignoring malformed worker frame");
                continue;
            }
        };
        match pending.remove(&response.invocation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => tracing::debug!(
                invocation_id = %response.invocation_id,
                "discarding late or duplicate worker response"
            ),
        }
    }

    closed.store(true, Ordering::Release);
    // Dropping the waiters wakes every in-flight invocation.
    pending.clear();
    tracing::debug!(address = %address, "sandbox worker connection closed");
}
