//! Capability context: everything a guest is allowed to touch.
//!
//! A [`CapabilityContext`] is built fresh for every invocation from the
//! step's parameters, the execution's static-data handle, a log sink and
//! the enabled helpers, and is bound to the records that invocation may
//! see. Backends read from it and never reach around it.
//!
//! Workers cannot hold host objects, so the context also has a
//! [`CapabilityProjection`]: plain data that both backends derive the
//! guest-visible values from.

mod helpers;
mod log;
mod params;

use std::sync::Arc;

use nebula_core::ExecutionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use helpers::{
    BinaryStore, HelperError, HelperFlags, HostHelpers, HttpProxy, HttpRequest, HttpResponse,
    InMemoryBinaryStore, ReqwestHttpProxy,
};
pub use log::{
    CollectingLogSink, DiscardLogSink, LogEntry, LogLevel, LogSink, RunMode, TracingLogSink,
    UiLogSink,
};
pub use params::{ItemParameters, ParameterAccessor, StaticParameters};

use crate::mode::InputView;
use crate::static_data::{StaticData, StaticDataHandle};

/// Where guest console output should go.
#[derive(Clone)]
pub enum LogSinkSelection {
    /// Stream to the editor UI.
    Ui(mpsc::UnboundedSender<LogEntry>),
    /// Write to the host log, tagged with the step name.
    Host {
        /// Step name used as a log field.
        step: String,
    },
    /// Caller-provided sink.
    Custom(Arc<dyn LogSink>),
    /// Drop everything.
    Discard,
}

impl LogSinkSelection {
    /// Manual runs with a UI channel stream to the UI; everything else
    /// goes to the host log.
    pub fn for_run_mode(
        mode: RunMode,
        ui: Option<mpsc::UnboundedSender<LogEntry>>,
        step: &str,
    ) -> Self {
        match (mode, ui) {
            (RunMode::Manual, Some(tx)) => Self::Ui(tx),
            _ => Self::Host {
                step: step.to_owned(),
            },
        }
    }

    fn into_sink(self) -> Arc<dyn LogSink> {
        match self {
            Self::Ui(tx) => Arc::new(UiLogSink::new(tx)),
            Self::Host { step } => Arc::new(TracingLogSink::new(step)),
            Self::Custom(sink) => sink,
            Self::Discard => Arc::new(DiscardLogSink),
        }
    }
}

impl std::fmt::Debug for LogSinkSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ui(_) => f.write_str("Ui"),
            Self::Host { step } => f.debug_struct("Host").field("step", step).finish(),
            Self::Custom(_) => f.write_str("Custom"),
            Self::Discard => f.write_str("Discard"),
        }
    }
}

/// Assembles capability contexts for the invocations of one step run.
///
/// Everything shared across invocations is resolved once here; [`build`]
/// only binds a view and cannot fail.
///
/// [`build`]: CapabilityBuilder::build
#[derive(Clone)]
pub struct CapabilityBuilder {
    execution_id: ExecutionId,
    parameters: Arc<dyn ParameterAccessor>,
    static_data: StaticDataHandle,
    log_sink: Arc<dyn LogSink>,
    helpers: HostHelpers,
}

impl CapabilityBuilder {
    /// Starts a builder with no helpers enabled.
    pub fn new(
        execution_id: ExecutionId,
        parameters: Arc<dyn ParameterAccessor>,
        static_data: StaticDataHandle,
        logging: LogSinkSelection,
    ) -> Self {
        Self {
            execution_id,
            parameters,
            static_data,
            log_sink: logging.into_sink(),
            helpers: HostHelpers::default(),
        }
    }

    /// Sets the helpers exposed to guests.
    pub fn helpers(mut self, helpers: HostHelpers) -> Self {
        self.helpers = helpers;
        self
    }

    /// Context bound to `view`.
    pub fn build(&self, view: InputView) -> CapabilityContext {
        CapabilityContext {
            execution_id: self.execution_id,
            view,
            parameters: Arc::clone(&self.parameters),
            static_data: self.static_data.clone(),
            log_sink: Arc::clone(&self.log_sink),
            helpers: self.helpers.clone(),
        }
    }
}

/// Capabilities granted to one invocation.
#[derive(Clone)]
pub struct CapabilityContext {
    execution_id: ExecutionId,
    view: InputView,
    parameters: Arc<dyn ParameterAccessor>,
    static_data: StaticDataHandle,
    log_sink: Arc<dyn LogSink>,
    helpers: HostHelpers,
}

impl CapabilityContext {
    /// Rebuilds a context on a worker from a received projection.
    ///
    /// Helpers that need host objects are not available there, only the
    /// flags the host granted.
    pub fn from_projection(
        projection: CapabilityProjection,
        view: InputView,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        let helpers = HostHelpers {
            http: None,
            binary_store: None,
            binary: projection.helpers.binary,
            encoding: projection.helpers.encoding,
        };
        Self {
            execution_id: projection.execution_id,
            view,
            parameters: Arc::new(StaticParameters::new(projection.parameters)),
            static_data: StaticDataHandle::detached(projection.static_data),
            log_sink,
            helpers,
        }
    }

    /// Execution this invocation belongs to.
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Records visible to the guest.
    pub fn view(&self) -> &InputView {
        &self.view
    }

    /// Parameter accessor.
    pub fn parameters(&self) -> &dyn ParameterAccessor {
        self.parameters.as_ref()
    }

    /// Static-data handle.
    pub fn static_data(&self) -> &StaticDataHandle {
        &self.static_data
    }

    /// Guest log sink.
    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log_sink
    }

    /// Enabled helpers.
    pub fn helpers(&self) -> &HostHelpers {
        &self.helpers
    }

    /// Forwards one console line to the sink.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_sink.log(LogEntry {
            level,
            message: message.into(),
            item_index: self.view.item_index(),
        });
    }

    /// Plain-data form of this context.
    ///
    /// Parameters are resolved for the bound record, or for record 0 when
    /// the view spans all records.
    pub fn project(&self) -> CapabilityProjection {
        let item_index = self.view.item_index();
        CapabilityProjection {
            execution_id: self.execution_id,
            item_index,
            parameters: self.parameters.resolve(item_index.unwrap_or(0)),
            static_data: self.static_data.snapshot(),
            helpers: self.helpers.flags(),
        }
    }
}

impl std::fmt::Debug for CapabilityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityContext")
            .field("execution_id", &self.execution_id)
            .field("item_index", &self.view.item_index())
            .field("records", &self.view.len())
            .field("helpers", &self.helpers)
            .finish_non_exhaustive()
    }
}

/// Transport-safe projection of a [`CapabilityContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProjection {
    /// Execution the invocation belongs to.
    pub execution_id: ExecutionId,
    /// Bound record for "Run once for each item".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    /// Resolved `$parameter` values.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Static-data snapshot.
    #[serde(default)]
    pub static_data: StaticData,
    /// Usable helpers.
    #[serde(default)]
    pub helpers: HelperFlags,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{InputView, resolve};
    use crate::record::InputRecord;
    use crate::script::ExecutionMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn builder(logging: LogSinkSelection) -> CapabilityBuilder {
        let params = ItemParameters::new(vec![
            map(json!({ "n": 0 })),
            map(json!({ "n": 1 })),
        ]);
        CapabilityBuilder::new(
            ExecutionId::v4(),
            Arc::new(params),
            StaticDataHandle::detached(map(json!({ "seen": 3 }))),
            logging,
        )
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn records() -> Vec<InputRecord> {
        vec![InputRecord::new(json!({ "a": 1 })), InputRecord::new(json!({ "a": 2 }))]
    }

    #[test]
    fn manual_run_with_ui_channel_streams_to_ui() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let selection = LogSinkSelection::for_run_mode(RunMode::Manual, Some(tx), "Code");
        assert!(matches!(selection, LogSinkSelection::Ui(_)));
    }

    #[test]
    fn production_run_logs_to_host_even_with_ui_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let selection = LogSinkSelection::for_run_mode(RunMode::Production, Some(tx), "Code");
        assert!(matches!(selection, LogSinkSelection::Host { step } if step == "Code"));
    }

    #[test]
    fn context_logs_carry_the_bound_item_index() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = builder(LogSinkSelection::Ui(tx));
        let views = resolve(ExecutionMode::PerItem, records());
        let context = builder.build(views[1].clone());

        context.log(LogLevel::Warn, "careful");

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.item_index, Some(1));
        assert_eq!(entry.level, LogLevel::Warn);
    }

    #[test]
    fn projection_resolves_parameters_for_the_bound_record() {
        let builder = builder(LogSinkSelection::Discard);
        let views = resolve(ExecutionMode::PerItem, records());

        let projection = builder.build(views[1].clone()).project();
        assert_eq!(projection.item_index, Some(1));
        assert_eq!(projection.parameters, map(json!({ "n": 1 })));
        assert_eq!(projection.static_data, map(json!({ "seen": 3 })));
        assert_eq!(projection.helpers, HelperFlags::default());
    }

    #[test]
    fn all_items_projection_uses_first_record_parameters() {
        let builder = builder(LogSinkSelection::Discard);
        let view = InputView::All(Arc::from(records()));
        let projection = builder.build(view).project();
        assert_eq!(projection.item_index, None);
        assert_eq!(projection.parameters, map(json!({ "n": 0 })));
    }

    #[test]
    fn context_round_trips_through_projection() {
        let builder = builder(LogSinkSelection::Discard);
        let views = resolve(ExecutionMode::PerItem, records());
        let projection = builder.build(views[0].clone()).project();

        let rebuilt = CapabilityContext::from_projection(
            projection.clone(),
            views[0].clone(),
            Arc::new(DiscardLogSink),
        );
        assert_eq!(rebuilt.project(), projection);
    }
}
