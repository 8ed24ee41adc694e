//! In-process JavaScript backend built on an embedded interpreter.
//!
//! Every invocation gets a fresh interpreter on a blocking thread, so no
//! guest state survives between invocations. Loop and recursion limits are
//! enforced by the interpreter; the wall-clock limit is enforced here,
//! around the blocking task. A timed-out interpreter is abandoned and its
//! result discarded when it eventually finishes.

mod host;
mod prelude;

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsError, JsString, Source, js_string};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::runtime::Handle;

use crate::backend::{BackendKind, ExecutionRequest, ScriptBackend};
use crate::capability::{CapabilityContext, HelperFlags};
use crate::config::InterpreterLimits;
use crate::error::{SandboxError, ValidationError};
use crate::modules::ResolvedModules;
use crate::record::{BinaryData, InputRecord};
use crate::script::{ExecutionMode, GuestLanguage};
use crate::static_data::{StaticData, StaticDataChanges};
use crate::validate::GuestValue;

use self::prelude::AssembledScript;

/// Runs JavaScript in an embedded interpreter inside the host process.
#[derive(Debug, Clone)]
pub struct InProcessSandbox {
    limits: InterpreterLimits,
    timeout: Duration,
    modules: Arc<ResolvedModules>,
}

impl InProcessSandbox {
    /// Sandbox with the given limits and loadable modules.
    pub fn new(limits: InterpreterLimits, timeout: Duration, modules: Arc<ResolvedModules>) -> Self {
        Self {
            limits,
            timeout,
            modules,
        }
    }
}

#[async_trait]
impl ScriptBackend for InProcessSandbox {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<GuestValue, SandboxError> {
        let ExecutionRequest {
            invocation_id,
            unit,
            context,
        } = request;

        if unit.language() != GuestLanguage::JavaScript {
            return Err(SandboxError::configuration(format!(
                "the in-process sandbox cannot run {} code",
                unit.language()
            )));
        }
        if unit.source().len() > self.limits.max_source_bytes {
            return Err(SandboxError::guest(
                format!(
                    "script is {} bytes, which exceeds the limit of {} bytes",
                    unit.source().len(),
                    self.limits.max_source_bytes
                ),
                None,
            ));
        }

        let snapshot = context.static_data().snapshot();
        let payload = guest_payload(unit.mode(), &context, &snapshot)?;
        let script = prelude::assemble(unit.source(), &self.modules);
        let guest_line_offset = script.guest_line_offset;
        let bridge = host::HostBridge::new(&context, Handle::current());
        let limits = self.limits;

        tracing::debug!(
            invocation_id = %invocation_id,
            mode = ?unit.mode(),
            records = context.view().len(),
            "running guest in-process"
        );

        let task = tokio::task::spawn_blocking(move || {
            let _bridge = host::install(bridge);
            evaluate(&script, &payload, limits)
        });

        let envelope = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                tracing::warn!(
                    invocation_id = %invocation_id,
                    timeout = ?self.timeout,
                    "in-process guest timed out; abandoning interpreter"
                );
                return Err(SandboxError::timeout(BackendKind::InProcess, self.timeout));
            }
            Ok(Err(join)) => {
                return Err(SandboxError::guest(format!("interpreter fault: {join}"), None));
            }
            Ok(Ok(result)) => result?,
        };

        envelope.finish(&context, &snapshot, guest_line_offset)
    }
}

fn evaluate(
    script: &AssembledScript,
    payload: &str,
    limits: InterpreterLimits,
) -> Result<Envelope, SandboxError> {
    let offset = script.guest_line_offset;
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.recursion_limit);

    host::register(&mut context)
        .map_err(|e| SandboxError::guest(format!("failed to prepare interpreter: {e}"), None))?;
    context
        .register_global_property(
            js_string!("__nebulaPayload"),
            JsString::from(payload),
            Attribute::all(),
        )
        .map_err(|e| SandboxError::guest(format!("failed to prepare interpreter: {e}"), None))?;

    let completion = context
        .eval(Source::from_bytes(script.text.as_bytes()))
        .map_err(|e| interpreter_failure(&e, offset))?;
    let encoded = completion
        .to_string(&mut context)
        .map_err(|e| interpreter_failure(&e, offset))?
        .to_std_string_escaped();

    serde_json::from_str(&encoded)
        .map_err(|e| SandboxError::guest(format!("malformed interpreter result: {e}"), None))
}

fn interpreter_failure(error: &JsError, offset: u32) -> SandboxError {
    let message = error.to_string();
    let line = guest_line(&message, offset);
    SandboxError::guest(strip_position(&message), line)
}

static LINE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:line |:)(\d+)(?:, col |:)\d+").ok());

static POSITION_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\s*(?:at )?line \d+, col \d+").ok());

/// Drops "at line N, col M" from an interpreter message. Those positions
/// count prelude lines; the guest line is reported separately.
fn strip_position(message: &str) -> String {
    match POSITION_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(message, "").trim_end().to_owned(),
        None => message.to_owned(),
    }
}

/// Maps a "line N, col M" or ":N:M" position in the assembled script back
/// to a 1-based guest line. Positions inside the prelude map to `None`.
fn guest_line(text: &str, offset: u32) -> Option<u32> {
    let pattern = LINE_PATTERN.as_ref()?;
    let script_line: u32 = pattern
        .captures_iter(text)
        .last()?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    script_line.checked_sub(offset).filter(|line| *line > 0)
}

/// What the wrapper reports back after running the guest.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ok: bool,
    returned: Option<String>,
    error: Option<ThrownError>,
    serialization_error: Option<String>,
    static_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThrownError {
    message: String,
    name: Option<String>,
    stack: Option<String>,
}

impl Envelope {
    fn finish(
        self,
        context: &CapabilityContext,
        snapshot: &StaticData,
        offset: u32,
    ) -> Result<GuestValue, SandboxError> {
        if let Some(encoded) = &self.static_data {
            match serde_json::from_str::<StaticData>(encoded) {
                Ok(after) => context
                    .static_data()
                    .apply(&StaticDataChanges::diff(snapshot, &after)),
                Err(e) => tracing::warn!(error = %e, "guest static data is not an object; changes dropped"),
            }
        }

        if !self.ok {
            let thrown = self.error.unwrap_or(ThrownError {
                message: "guest code failed".to_owned(),
                name: None,
                stack: None,
            });
            let message = match thrown.name.as_deref() {
                Some(name) if !name.is_empty() && name != "Error" => {
                    format!("{name}: {}", thrown.message)
                }
                _ => thrown.message,
            };
            let line = thrown.stack.as_deref().and_then(|stack| guest_line(stack, offset));
            return Err(SandboxError::guest(message, line));
        }

        if let Some(reason) = self.serialization_error {
            return Err(ValidationError::Unserializable { reason }.into());
        }

        let value = match self.returned {
            None => Value::Null,
            Some(encoded) => serde_json::from_str(&encoded).map_err(|e| ValidationError::Unserializable {
                reason: e.to_string(),
            })?,
        };
        Ok(GuestValue::new(value))
    }
}

/// Guest-visible input, serialized once and parsed by the prelude.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestPayload<'a> {
    mode: ExecutionMode,
    item_index: Option<usize>,
    items: Vec<GuestItem<'a>>,
    parameters: Map<String, Value>,
    static_data: &'a StaticData,
    helpers: HelperFlags,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestItem<'a> {
    data: &'a Value,
    attachments: BTreeMap<&'a str, GuestAttachment<'a>>,
    lineage: Option<usize>,
}

/// Attachment metadata; content is fetched on demand.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GuestAttachment<'a> {
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<usize>,
}

fn guest_item(record: &InputRecord) -> GuestItem<'_> {
    GuestItem {
        data: &record.data,
        attachments: record
            .attachments
            .iter()
            .map(|(name, attachment)| {
                let id = match &attachment.data {
                    BinaryData::Handle(handle) => Some(handle.as_str()),
                    BinaryData::Inline(_) => None,
                };
                let metadata = GuestAttachment {
                    mime_type: &attachment.mime_type,
                    file_name: attachment.file_name.as_deref(),
                    id,
                    file_size: attachment.inline_len(),
                };
                (name.as_str(), metadata)
            })
            .collect(),
        lineage: record.lineage,
    }
}

fn guest_payload(
    mode: ExecutionMode,
    context: &CapabilityContext,
    snapshot: &StaticData,
) -> Result<String, SandboxError> {
    let projection_parameters = context
        .parameters()
        .resolve(context.view().item_index().unwrap_or(0));
    let payload = GuestPayload {
        mode,
        item_index: context.view().item_index(),
        items: context
            .view()
            .records()
            .into_iter()
            .map(|(_, record)| guest_item(record))
            .collect(),
        parameters: projection_parameters,
        static_data: snapshot,
        helpers: context.helpers().flags(),
    };
    serde_json::to_string(&payload)
        .map_err(|e| SandboxError::guest(format!("failed to encode guest input: {e}"), None))
}
