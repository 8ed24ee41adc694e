//! Backend selection and the per-invocation dispatch state machine.

use std::fmt;
use std::sync::Arc;

use crate::backend::{
    BackendKind, ExecutionRequest, InProcessSandbox, SandboxBackend, ScriptBackend,
};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::modules::ResolvedModules;
use crate::script::GuestLanguage;
use crate::validate::GuestValue;
use crate::worker::WorkerClient;

/// Chooses and prepares the backend for a step.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: Arc<SandboxConfig>,
    modules: Arc<ResolvedModules>,
}

impl Dispatcher {
    /// Dispatcher for `config`, with modules already resolved against its
    /// policy.
    pub fn new(config: Arc<SandboxConfig>, modules: Arc<ResolvedModules>) -> Self {
        Self { config, modules }
    }

    /// Backend kind `language` would be dispatched to.
    ///
    /// Python has no in-process interpreter, so it needs the worker.
    pub fn route(&self, language: GuestLanguage) -> Result<BackendKind, SandboxError> {
        match (language, self.config.use_external_worker) {
            (_, true) => Ok(BackendKind::ExternalWorker),
            (GuestLanguage::JavaScript, false) => Ok(BackendKind::InProcess),
            (GuestLanguage::Python, false) => Err(SandboxError::configuration(
                "python steps require the external worker; set use_external_worker",
            )),
        }
    }

    /// Prepares the backend for `language`.
    ///
    /// An unreachable worker is reported as unavailable; the dispatcher
    /// never falls back to in-process execution.
    pub async fn select(&self, language: GuestLanguage) -> Result<SandboxBackend, SandboxError> {
        match self.route(language)? {
            BackendKind::InProcess => Ok(SandboxBackend::InProcess(InProcessSandbox::new(
                self.config.limits,
                self.config.execution_timeout(),
                Arc::clone(&self.modules),
            ))),
            BackendKind::ExternalWorker => {
                let worker = self.config.worker.as_ref().ok_or_else(|| {
                    SandboxError::configuration("external worker selected but no worker address configured")
                })?;
                let client = WorkerClient::connect(worker).await?;
                Ok(SandboxBackend::ExternalWorker(client))
            }
        }
    }
}

/// Where one invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Nothing chosen yet.
    Idle,
    /// A backend is bound.
    BackendSelected,
    /// The request was handed to the backend.
    Dispatched,
    /// The backend returned a value.
    Completed,
    /// Selection or execution failed.
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::BackendSelected => "backend_selected",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Returns `true` if an invocation may move from `from` to `to`.
#[must_use]
pub fn can_transition_dispatch(from: DispatchState, to: DispatchState) -> bool {
    matches!(
        (from, to),
        (DispatchState::Idle, DispatchState::BackendSelected)
            | (DispatchState::Idle, DispatchState::Failed)
            | (DispatchState::BackendSelected, DispatchState::Dispatched)
            | (DispatchState::Dispatched, DispatchState::Completed)
            | (DispatchState::Dispatched, DispatchState::Failed)
    )
}

/// Tracks one invocation through a single backend.
#[derive(Debug)]
pub struct Dispatch {
    state: DispatchState,
    backend: Option<Arc<SandboxBackend>>,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch {
    /// Idle dispatch.
    pub fn new() -> Self {
        Self {
            state: DispatchState::Idle,
            backend: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Binds the backend that will serve this invocation.
    pub fn bind(&mut self, backend: Arc<SandboxBackend>) -> Result<(), SandboxError> {
        self.transition(DispatchState::BackendSelected)?;
        self.backend = Some(backend);
        Ok(())
    }

    /// Records that no backend could be selected.
    pub fn fail_selection(&mut self) -> Result<(), SandboxError> {
        self.transition(DispatchState::Failed)
    }

    /// Hands `request` to the bound backend.
    pub async fn run(&mut self, request: ExecutionRequest) -> Result<GuestValue, SandboxError> {
        self.transition(DispatchState::Dispatched)?;
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| SandboxError::configuration("dispatch has no bound backend"))?;

        let result = backend.execute(request).await;
        let next = if result.is_ok() {
            DispatchState::Completed
        } else {
            DispatchState::Failed
        };
        self.transition(next)?;
        result
    }

    fn transition(&mut self, to: DispatchState) -> Result<(), SandboxError> {
        if !can_transition_dispatch(self.state, to) {
            return Err(SandboxError::configuration(format!(
                "invalid dispatch transition {} -> {to}",
                self.state
            )));
        }
        tracing::trace!(from = %self.state, to = %to, "dispatch transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn dispatcher(config: SandboxConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(config), Arc::new(ResolvedModules::default()))
    }

    #[test]
    fn javascript_runs_in_process_by_default() {
        let route = dispatcher(SandboxConfig::default()).route(GuestLanguage::JavaScript);
        assert_eq!(route.unwrap(), BackendKind::InProcess);
    }

    #[test]
    fn python_without_worker_is_a_configuration_error() {
        let err = dispatcher(SandboxConfig::default())
            .route(GuestLanguage::Python)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn external_flag_routes_every_language_to_the_worker() {
        let config = SandboxConfig {
            use_external_worker: true,
            worker: Some(WorkerConfig::new("127.0.0.1:1")),
            ..SandboxConfig::default()
        };
        let dispatcher = dispatcher(config);
        assert_eq!(dispatcher.route(GuestLanguage::JavaScript).unwrap(), BackendKind::ExternalWorker);
        assert_eq!(dispatcher.route(GuestLanguage::Python).unwrap(), BackendKind::ExternalWorker);
    }

    #[tokio::test]
    async fn unreachable_worker_is_unavailable_without_fallback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = SandboxConfig {
            use_external_worker: true,
            worker: Some(WorkerConfig::new(address)),
            ..SandboxConfig::default()
        };
        let err = dispatcher(config)
            .select(GuestLanguage::JavaScript)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn valid_dispatch_transitions() {
        assert!(can_transition_dispatch(DispatchState::Idle, DispatchState::BackendSelected));
        assert!(can_transition_dispatch(DispatchState::BackendSelected, DispatchState::Dispatched));
        assert!(can_transition_dispatch(DispatchState::Dispatched, DispatchState::Completed));
        assert!(can_transition_dispatch(DispatchState::Dispatched, DispatchState::Failed));
        assert!(can_transition_dispatch(DispatchState::Idle, DispatchState::Failed));
    }

    #[test]
    fn invalid_dispatch_transitions() {
        assert!(!can_transition_dispatch(DispatchState::Idle, DispatchState::Dispatched));
        assert!(!can_transition_dispatch(DispatchState::Completed, DispatchState::Dispatched));
        assert!(!can_transition_dispatch(DispatchState::BackendSelected, DispatchState::BackendSelected));
        assert!(!can_transition_dispatch(DispatchState::Failed, DispatchState::Completed));
    }

    #[test]
    fn second_bind_is_rejected() {
        let backend = Arc::new(SandboxBackend::InProcess(InProcessSandbox::new(
            Default::default(),
            std::time::Duration::from_secs(1),
            Arc::new(ResolvedModules::default()),
        )));
        let mut dispatch = Dispatch::new();
        dispatch.bind(Arc::clone(&backend)).unwrap();
        assert_eq!(dispatch.state(), DispatchState::BackendSelected);
        assert!(dispatch.bind(backend).is_err());
    }
}
