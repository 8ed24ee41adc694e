//! Script step engine.
//!
//! Runs a script step end to end: resolves the execution mode, builds a
//! capability context per invocation, dispatches to the selected backend,
//! validates what comes back and applies the continuation policy.
//!
//! In "Run once for each item" invocations run concurrently up to
//! `max_concurrency`; results are emitted in input order regardless of
//! completion order.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use nebula_core::ExecutionId;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Dispatch, Dispatcher, ExecutionRequest, SandboxBackend, ScriptBackend};
use crate::capability::{
    BinaryStore, CapabilityBuilder, CapabilityContext, HostHelpers, HttpProxy, LogEntry, LogSinkSelection,
    ParameterAccessor, ReqwestHttpProxy, RunMode,
};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, StepError};
use crate::mode::{self, InputView};
use crate::modules::ModuleRegistry;
use crate::policy::{Continuation, ContinuationPolicy, Invocation, StepIdentity};
use crate::record::{InputRecord, OutputRecord, ResultRecord};
use crate::script::{ExecutionMode, ScriptUnit};
use crate::static_data::{StaticData, StaticDataArena};
use crate::validate::{GuestValue, validate_all_items, validate_per_item};

/// A configured script step.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    /// Step identity used in fatal errors and logs.
    pub identity: StepIdentity,
    /// Guest source, language and mode.
    pub unit: ScriptUnit,
    /// Convert failures into error records instead of aborting.
    pub continue_on_fail: bool,
}

impl ScriptStep {
    /// Step that aborts on the first failure.
    pub fn new(identity: StepIdentity, unit: ScriptUnit) -> Self {
        Self {
            identity,
            unit,
            continue_on_fail: false,
        }
    }

    /// Sets continue-on-fail.
    pub fn continue_on_fail(mut self, enabled: bool) -> Self {
        self.continue_on_fail = enabled;
        self
    }
}

/// The workflow execution a step run belongs to.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    /// Execution id; selects the static-data store.
    pub execution_id: ExecutionId,
    /// Manual runs stream guest logs to the UI.
    pub run_mode: RunMode,
    /// UI channel for manual runs.
    pub ui_log: Option<mpsc::UnboundedSender<LogEntry>>,
    /// Fires when the workflow execution is cancelled.
    pub cancel: CancellationToken,
}

impl ExecutionScope {
    /// Production scope for `execution_id`.
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            run_mode: RunMode::Production,
            ui_log: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Manual run streaming guest logs to `ui`.
    pub fn manual(execution_id: ExecutionId, ui: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self {
            run_mode: RunMode::Manual,
            ui_log: Some(ui),
            ..Self::new(execution_id)
        }
    }

    /// Uses `cancel` as the execution's cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs script steps.
pub struct ScriptEngine {
    config: Arc<SandboxConfig>,
    dispatcher: Dispatcher,
    arena: StaticDataArena,
    http: Option<Arc<dyn HttpProxy>>,
    binary_store: Option<Arc<dyn BinaryStore>>,
}

impl ScriptEngine {
    /// Engine for `config`, offering modules from `registry` subject to
    /// the config's module policy.
    ///
    /// With the HTTP helper enabled, guest requests go through a
    /// [`ReqwestHttpProxy`] until [`with_http_proxy`](Self::with_http_proxy)
    /// replaces it.
    pub fn new(config: SandboxConfig, registry: &ModuleRegistry) -> Result<Self, SandboxError> {
        config.validate()?;
        let modules = Arc::new(registry.resolve(&config.modules));
        let http = config
            .helpers
            .http
            .then(|| Arc::new(ReqwestHttpProxy::default()) as Arc<dyn HttpProxy>);
        let config = Arc::new(config);
        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&config), modules),
            config,
            arena: StaticDataArena::new(),
            http,
            binary_store: None,
        })
    }

    /// Proxy used by `$helpers.httpRequest`, when the helper is enabled.
    pub fn with_http_proxy(mut self, proxy: Arc<dyn HttpProxy>) -> Self {
        self.http = Some(proxy);
        self
    }

    /// Store used to materialize handle-backed attachments.
    pub fn with_binary_store(mut self, store: Arc<dyn BinaryStore>) -> Self {
        self.binary_store = Some(store);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Per-execution static-data stores.
    pub fn arena(&self) -> &StaticDataArena {
        &self.arena
    }

    /// Drops the static data of a finished execution and returns it.
    pub fn finish_execution(&self, execution_id: ExecutionId) -> Option<StaticData> {
        self.arena.release(execution_id)
    }

    /// Runs `step` over `input`.
    ///
    /// Returns the step output in input order. With continue-on-fail,
    /// failed invocations appear as error records in their place; without
    /// it the first failure aborts the step.
    pub async fn run(
        &self,
        step: &ScriptStep,
        scope: &ExecutionScope,
        parameters: Arc<dyn ParameterAccessor>,
        input: Vec<InputRecord>,
    ) -> Result<Vec<ResultRecord>, StepError> {
        let started = Instant::now();
        let policy = ContinuationPolicy::new(step.continue_on_fail);
        let mode = step.unit.mode();
        let input_len = input.len();
        let views = mode::resolve(mode, input);

        if scope.cancel.is_cancelled() {
            return Err(abort(step, None, SandboxError::Cancelled));
        }
        if views.is_empty() {
            return Ok(Vec::new());
        }

        let logging = LogSinkSelection::for_run_mode(
            scope.run_mode,
            scope.ui_log.clone(),
            &step.identity.name,
        );
        let builder = CapabilityBuilder::new(
            scope.execution_id,
            parameters,
            self.arena.handle(scope.execution_id),
            logging,
        )
        .helpers(HostHelpers::from_config(
            &self.config.helpers,
            self.http.clone(),
            self.binary_store.clone(),
        ));

        let backend = match self.dispatcher.select(step.unit.language()).await {
            Ok(backend) => Arc::new(backend),
            Err(error) => {
                tracing::warn!(
                    execution_id = %scope.execution_id,
                    step = %step.identity.name,
                    error = %error,
                    "no sandbox backend available"
                );
                return fail_every_view(step, &policy, &views, &error);
            }
        };

        tracing::debug!(
            execution_id = %scope.execution_id,
            step = %step.identity.name,
            mode = ?mode,
            records = input_len,
            backend = %backend.kind(),
            "running script step"
        );

        let output = match mode {
            ExecutionMode::AllItems => {
                self.run_all_items(step, scope, &policy, &builder, backend, views, input_len)
                    .await
            }
            ExecutionMode::PerItem => {
                self.run_per_item(step, scope, &policy, &builder, backend, views, input_len)
                    .await
            }
        };

        tracing::debug!(
            execution_id = %scope.execution_id,
            step = %step.identity.name,
            elapsed = ?started.elapsed(),
            ok = output.is_ok(),
            "script step finished"
        );
        output
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_all_items(
        &self,
        step: &ScriptStep,
        scope: &ExecutionScope,
        policy: &ContinuationPolicy,
        builder: &CapabilityBuilder,
        backend: Arc<SandboxBackend>,
        views: Vec<InputView>,
        input_len: usize,
    ) -> Result<Vec<ResultRecord>, StepError> {
        let Some(view) = views.into_iter().next() else {
            return Ok(Vec::new());
        };
        let context = builder.build(view);
        let result = invoke(step.unit.clone(), context, backend, &scope.cancel)
            .await
            .and_then(|value| validate_all_items(value, input_len).map_err(SandboxError::from));

        match Invocation::running(None).settle(policy, &step.identity, result) {
            Ok(records) => Ok(records.into_iter().map(ResultRecord::Output).collect()),
            Err(Continuation::Continue(record)) => Ok(vec![ResultRecord::Error(record)]),
            Err(Continuation::Abort(error)) => Err(error),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_per_item(
        &self,
        step: &ScriptStep,
        scope: &ExecutionScope,
        policy: &ContinuationPolicy,
        builder: &CapabilityBuilder,
        backend: Arc<SandboxBackend>,
        views: Vec<InputView>,
        input_len: usize,
    ) -> Result<Vec<ResultRecord>, StepError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut slots: Vec<Option<ResultRecord>> = (0..views.len()).map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for view in views {
            let index = view.item_index().unwrap_or(0);
            join_set.spawn(
                ItemTask {
                    index,
                    input_len,
                    unit: step.unit.clone(),
                    context: builder.build(view),
                    backend: Arc::clone(&backend),
                    semaphore: Arc::clone(&semaphore),
                    cancel: scope.cancel.clone(),
                }
                .run(),
            );
        }

        let mut fatal: Option<StepError> = None;
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(join_error) if join_error.is_cancelled() => continue,
                Err(join_error) => {
                    tracing::error!(?join_error, step = %step.identity.name, "script item task panicked");
                    let error = SandboxError::guest(format!("invocation task failed: {join_error}"), None);
                    if fatal.is_none() {
                        fatal = Some(abort(step, None, error));
                        join_set.abort_all();
                    }
                    continue;
                }
            };

            match Invocation::running(Some(index)).settle(policy, &step.identity, result) {
                Ok(record) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(ResultRecord::Output(record));
                    }
                }
                Err(Continuation::Continue(record)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(ResultRecord::Error(record));
                    }
                }
                Err(Continuation::Abort(error)) => {
                    let lower = fatal
                        .as_ref()
                        .is_none_or(|current| current.item_index.is_none_or(|i| index < i));
                    if lower {
                        fatal = Some(error);
                    }
                    join_set.abort_all();
                }
            }
        }

        if let Some(error) = fatal {
            tracing::warn!(
                step = %error.step_name,
                item_index = ?error.item_index,
                kind = %error.kind(),
                "script step aborted"
            );
            return Err(error);
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("config", &self.config)
            .field("executions", &self.arena.len())
            .field("http", &self.http.is_some())
            .field("binary_store", &self.binary_store.is_some())
            .finish_non_exhaustive()
    }
}

/// One "Run once for each item" invocation.
struct ItemTask {
    index: usize,
    input_len: usize,
    unit: ScriptUnit,
    context: CapabilityContext,
    backend: Arc<SandboxBackend>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ItemTask {
    async fn run(self) -> (usize, Result<OutputRecord, SandboxError>) {
        let Ok(_permit) = self.semaphore.acquire_owned().await else {
            return (self.index, Err(SandboxError::Cancelled));
        };
        if self.cancel.is_cancelled() {
            return (self.index, Err(SandboxError::Cancelled));
        }

        let (index, input_len) = (self.index, self.input_len);
        let result = invoke(self.unit, self.context, self.backend, &self.cancel)
            .await
            .and_then(|value| validate_per_item(value, index, input_len).map_err(SandboxError::from));
        (index, result)
    }
}

/// Dispatches one request, giving up early if the execution is cancelled.
///
/// Giving up drops the backend future: a worker request gets a cancel
/// frame, an in-process run finishes in the background and is discarded.
async fn invoke(
    unit: ScriptUnit,
    context: CapabilityContext,
    backend: Arc<SandboxBackend>,
    cancel: &CancellationToken,
) -> Result<GuestValue, SandboxError> {
    let mut dispatch = Dispatch::new();
    dispatch.bind(backend)?;
    let request = ExecutionRequest::new(unit, context);

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SandboxError::Cancelled),
        result = dispatch.run(request) => result,
    }
}

fn abort(step: &ScriptStep, item_index: Option<usize>, error: SandboxError) -> StepError {
    StepError {
        step_id: step.identity.id,
        step_name: step.identity.name.clone(),
        item_index,
        source: error,
    }
}

/// Fails every invocation that would have run and applies the policy to
/// each.
fn fail_every_view(
    step: &ScriptStep,
    policy: &ContinuationPolicy,
    views: &[InputView],
    error: &SandboxError,
) -> Result<Vec<ResultRecord>, StepError> {
    views
        .iter()
        .map(|view| {
            let item_index = view.item_index();
            let failure = match Dispatch::new().fail_selection() {
                Ok(()) => error.clone(),
                Err(invalid) => invalid,
            };
            let settled = Invocation::running(item_index).settle::<Infallible>(
                policy,
                &step.identity,
                Err(failure),
            );
            match settled {
                Ok(never) => match never {},
                Err(Continuation::Continue(record)) => Ok(ResultRecord::Error(record)),
                Err(Continuation::Abort(error)) => Err(error),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StaticParameters;
    use crate::config::WorkerConfig;
    use crate::error::ErrorKind;
    use nebula_core::NodeId;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};

    fn engine() -> ScriptEngine {
        ScriptEngine::new(SandboxConfig::default(), &ModuleRegistry::with_builtins()).unwrap()
    }

    fn step(source: &str, mode: ExecutionMode) -> ScriptStep {
        ScriptStep::new(
            StepIdentity::new(NodeId::v4(), "Code"),
            ScriptUnit::javascript(source, mode),
        )
    }

    fn no_parameters() -> Arc<dyn ParameterAccessor> {
        Arc::new(StaticParameters::new(Map::new()))
    }

    fn input(count: usize) -> Vec<InputRecord> {
        (0..count).map(|i| InputRecord::new(json!({ "i": i }))).collect()
    }

    #[tokio::test]
    async fn all_items_output_pairs_lineage_positionally() {
        let step = step(
            "return $input.all().map(item => ({ data: { i: item.data.i + 10 } }));",
            ExecutionMode::AllItems,
        );
        let scope = ExecutionScope::new(ExecutionId::v4());
        let output = engine().run(&step, &scope, no_parameters(), input(3)).await.unwrap();

        let lineage: Vec<Option<usize>> = output.iter().map(ResultRecord::lineage).collect();
        assert_eq!(lineage, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(output[2].as_output().unwrap().data, json!({ "i": 12 }));
    }

    #[tokio::test]
    async fn per_item_output_keeps_input_order() {
        let step = step("return { data: { i: $json.i * 2 } };", ExecutionMode::PerItem);
        let scope = ExecutionScope::new(ExecutionId::v4());
        let output = engine().run(&step, &scope, no_parameters(), input(6)).await.unwrap();

        let values: Vec<_> = output.iter().map(|r| r.as_output().unwrap().data.clone()).collect();
        let expected: Vec<_> = (0..6).map(|i| json!({ "i": i * 2 })).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn per_item_without_input_runs_nothing() {
        let step = step("throw new Error('never');", ExecutionMode::PerItem);
        let scope = ExecutionScope::new(ExecutionId::v4());
        let output = engine().run(&step, &scope, no_parameters(), Vec::new()).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn static_data_is_shared_within_an_execution_only() {
        let engine = engine();
        let step = step(
            "const s = $getStaticData(); s.runs = (s.runs || 0) + 1; return [];",
            ExecutionMode::AllItems,
        );
        let first = ExecutionScope::new(ExecutionId::v4());
        let second = ExecutionScope::new(ExecutionId::v4());

        engine.run(&step, &first, no_parameters(), input(1)).await.unwrap();
        engine.run(&step, &first, no_parameters(), input(1)).await.unwrap();
        engine.run(&step, &second, no_parameters(), input(1)).await.unwrap();

        assert_eq!(engine.arena().handle(first.execution_id).get("runs"), Some(json!(2)));
        assert_eq!(engine.arena().handle(second.execution_id).get("runs"), Some(json!(1)));
        let released = engine.finish_execution(first.execution_id).unwrap();
        assert_eq!(released.get("runs"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn cancelled_execution_does_not_run() {
        let step = step("return [];", ExecutionMode::AllItems);
        let scope = ExecutionScope::new(ExecutionId::v4());
        scope.cancel.cancel();
        let error = engine().run(&step, &scope, no_parameters(), input(1)).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn unreachable_worker_fails_every_record_under_continue_on_fail() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let config = SandboxConfig {
            use_external_worker: true,
            worker: Some(WorkerConfig::new(address)),
            ..SandboxConfig::default()
        };
        let engine = ScriptEngine::new(config, &ModuleRegistry::new()).unwrap();
        let step = step("return {};", ExecutionMode::PerItem).continue_on_fail(true);
        let scope = ExecutionScope::new(ExecutionId::v4());

        let output = engine.run(&step, &scope, no_parameters(), input(2)).await.unwrap();
        let lineage: Vec<Option<usize>> = output.iter().map(ResultRecord::lineage).collect();
        assert_eq!(lineage, vec![Some(0), Some(1)]);
        assert!(output.iter().all(|r| r.as_error().is_some()));
    }

    #[tokio::test]
    async fn manual_run_streams_guest_logs_to_the_ui() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let step = step("console.log('hi', $index); return { data: {} };", ExecutionMode::PerItem);
        let scope = ExecutionScope::manual(ExecutionId::v4(), tx);

        engine().run(&step, &scope, no_parameters(), input(1)).await.unwrap();

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.message, "hi 0");
        assert_eq!(entry.item_index, Some(0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SandboxConfig {
            max_concurrency: 0,
            ..SandboxConfig::default()
        };
        let error = ScriptEngine::new(config, &ModuleRegistry::new()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }
}
