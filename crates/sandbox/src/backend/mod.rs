//! Script backends and backend selection.
//!
//! A backend runs one [`ExecutionRequest`] and returns the guest's raw
//! return value. The engine only sees the [`ScriptBackend`] port; which
//! concrete backend serves a step is decided by the [`Dispatcher`].

mod dispatch;
pub mod inprocess;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use dispatch::{Dispatch, DispatchState, Dispatcher, can_transition_dispatch};
pub use inprocess::InProcessSandbox;

use crate::capability::CapabilityContext;
use crate::error::SandboxError;
use crate::script::ScriptUnit;
use crate::validate::GuestValue;
use crate::worker::WorkerClient;

/// Which kind of backend served an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// Embedded interpreter in the host process.
    InProcess,
    /// Separate worker process reached over the network.
    ExternalWorker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => f.write_str("in-process"),
            Self::ExternalWorker => f.write_str("external worker"),
        }
    }
}

/// One guest invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Correlates the request with its response on a worker connection.
    pub invocation_id: Uuid,
    /// What to run.
    pub unit: ScriptUnit,
    /// What the guest may touch, bound to the records it may see.
    pub context: CapabilityContext,
}

impl ExecutionRequest {
    /// Request with a fresh invocation id.
    pub fn new(unit: ScriptUnit, context: CapabilityContext) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            unit,
            context,
        }
    }
}

/// Port implemented by every way of running guest code.
///
/// Implementations forward guest logs to the context's sink before they
/// return, and write static-data changes back through the context's
/// handle.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    /// Kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Runs the guest and returns its raw return value.
    async fn execute(&self, request: ExecutionRequest) -> Result<GuestValue, SandboxError>;
}

/// The backends the dispatcher can select.
#[derive(Debug)]
pub enum SandboxBackend {
    /// Embedded interpreter.
    InProcess(InProcessSandbox),
    /// Connection to an external worker.
    ExternalWorker(WorkerClient),
}

#[async_trait]
impl ScriptBackend for SandboxBackend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::InProcess(_) => BackendKind::InProcess,
            Self::ExternalWorker(_) => BackendKind::ExternalWorker,
        }
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<GuestValue, SandboxError> {
        match self {
            Self::InProcess(sandbox) => sandbox.execute(request).await,
            Self::ExternalWorker(client) => client.execute(request).await,
        }
    }
}
