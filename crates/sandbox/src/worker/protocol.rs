//! Wire format between the host and an external worker.
//!
//! Frames are single-line JSON documents separated by `\n`. The host sends
//! [`ClientFrame`]s and the worker answers each `execute` with exactly one
//! [`WorkerResponse`] carrying the same `invocationId`, unless the request
//! was cancelled first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capability::{CapabilityContext, CapabilityProjection, LogEntry};
use crate::error::{SandboxError, ValidationError};
use crate::mode::InputView;
use crate::record::InputRecord;
use crate::script::{ExecutionMode, ScriptUnit};
use crate::static_data::StaticDataChanges;
use crate::validate::GuestValue;

/// Frames sent from the host to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Run a script.
    Execute(WorkerRequest),
    /// Stop working on an earlier request; no response follows.
    Cancel {
        /// Request to cancel.
        invocation_id: Uuid,
    },
}

/// One execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    /// Correlation id, unique per request.
    pub invocation_id: Uuid,
    /// What to run.
    pub script_unit: ScriptUnit,
    /// Plain-data capabilities.
    pub capability_context_projection: CapabilityProjection,
    /// Visible records: all of them, or the single bound record.
    pub input_records: Vec<InputRecord>,
    /// Execution mode of this invocation.
    pub mode: ExecutionMode,
    /// Input index of the bound record in "Run once for each item".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
}

impl WorkerRequest {
    /// Builds the request for `unit` running against `context`.
    pub fn new(invocation_id: Uuid, unit: ScriptUnit, context: &CapabilityContext) -> Self {
        let view = context.view();
        Self {
            invocation_id,
            script_unit: unit,
            capability_context_projection: context.project(),
            input_records: view.records().into_iter().map(|(_, record)| record.clone()).collect(),
            mode: view.mode(),
            item_index: view.item_index(),
        }
    }

    /// Rebuilds the input view on the worker side.
    pub fn view(&self) -> Result<InputView, SandboxError> {
        match self.mode {
            ExecutionMode::AllItems => Ok(InputView::All(Arc::from(self.input_records.clone()))),
            ExecutionMode::PerItem => {
                let record = self.input_records.first().cloned().ok_or_else(|| {
                    SandboxError::guest("per-item request carries no input record", None)
                })?;
                Ok(InputView::Single {
                    index: self.item_index.unwrap_or(0),
                    record,
                })
            }
        }
    }
}

/// How a worker invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerOutcome {
    /// The guest returned a value.
    Success,
    /// The guest threw or could not run.
    GuestError,
    /// The guest returned something that cannot cross the wire.
    ValidationError,
}

/// Failure details for non-success outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Error message.
    pub message: String,
    /// 1-based guest line, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// The worker's answer to one [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    /// Id of the request this answers.
    pub invocation_id: Uuid,
    /// Outcome.
    pub outcome: WorkerOutcome,
    /// Raw guest return value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_return_value: Option<Value>,
    /// Details on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    /// Guest console output, in call order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    /// Static-data keys the guest changed.
    #[serde(default)]
    pub static_data: StaticDataChanges,
}

impl WorkerResponse {
    /// Encodes an invocation result.
    pub fn from_result(
        invocation_id: Uuid,
        result: Result<GuestValue, SandboxError>,
        logs: Vec<LogEntry>,
        static_data: StaticDataChanges,
    ) -> Self {
        let (outcome, raw_return_value, error_detail) = match result {
            Ok(value) => (WorkerOutcome::Success, Some(value.into_value()), None),
            Err(SandboxError::Validation(error)) => (
                WorkerOutcome::ValidationError,
                None,
                Some(ErrorDetail {
                    message: error.to_string(),
                    line: None,
                }),
            ),
            Err(SandboxError::GuestExecution { message, line }) => (
                WorkerOutcome::GuestError,
                None,
                Some(ErrorDetail { message, line }),
            ),
            Err(other) => (
                WorkerOutcome::GuestError,
                None,
                Some(ErrorDetail {
                    message: other.to_string(),
                    line: None,
                }),
            ),
        };
        Self {
            invocation_id,
            outcome,
            raw_return_value,
            error_detail,
            logs,
            static_data,
        }
    }

    /// Decodes the outcome back into an invocation result.
    pub fn into_result(self) -> Result<GuestValue, SandboxError> {
        let detail = self.error_detail.unwrap_or_default();
        match self.outcome {
            WorkerOutcome::Success => Ok(GuestValue::new(self.raw_return_value.unwrap_or(Value::Null))),
            WorkerOutcome::GuestError => Err(SandboxError::guest(detail.message, detail.line)),
            WorkerOutcome::ValidationError => Err(ValidationError::Reported(detail.message).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn cancel_frame_wire_shape() {
        let id = Uuid::nil();
        let frame = ClientFrame::Cancel { invocation_id: id };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "cancel", "invocationId": "00000000-0000-0000-0000-000000000000" })
        );
    }

    #[test]
    fn execute_frame_is_tagged_and_camel_cased() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "execute",
            "invocationId": "00000000-0000-0000-0000-000000000000",
            "scriptUnit": { "source": "return [];", "language": "javaScript", "mode": "perItem" },
            "capabilityContextProjection": { "executionId": "00000000-0000-0000-0000-000000000000" },
            "inputRecords": [{ "data": { "a": 1 } }],
            "mode": "perItem",
            "itemIndex": 4
        }))
        .unwrap();

        let ClientFrame::Execute(request) = frame else {
            panic!("expected execute frame");
        };
        assert_eq!(request.item_index, Some(4));
        let view = request.view().unwrap();
        assert_eq!(view.item_index(), Some(4));
        assert_eq!(view.records()[0].1.data, json!({ "a": 1 }));
    }

    #[test]
    fn per_item_request_without_record_is_rejected() {
        let request = WorkerRequest {
            invocation_id: Uuid::nil(),
            script_unit: ScriptUnit::javascript("return {};", ExecutionMode::PerItem),
            capability_context_projection: serde_json::from_value(
                json!({ "executionId": "00000000-0000-0000-0000-000000000000" }),
            )
            .unwrap(),
            input_records: Vec::new(),
            mode: ExecutionMode::PerItem,
            item_index: Some(0),
        };
        assert!(request.view().is_err());
    }

    #[test]
    fn guest_error_keeps_its_line_across_the_wire() {
        let response = WorkerResponse::from_result(
            Uuid::nil(),
            Err(SandboxError::guest("boom", Some(3))),
            Vec::new(),
            StaticDataChanges::default(),
        );
        let decoded: WorkerResponse =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(decoded.outcome, WorkerOutcome::GuestError);
        assert_eq!(decoded.into_result().unwrap_err(), SandboxError::guest("boom", Some(3)));
    }

    #[test]
    fn validation_outcome_becomes_a_validation_error() {
        let response = WorkerResponse::from_result(
            Uuid::nil(),
            Err(ValidationError::Unserializable {
                reason: "cyclic".into(),
            }
            .into()),
            Vec::new(),
            StaticDataChanges::default(),
        );
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, SandboxError::Validation(ValidationError::Reported(_))));
    }

    #[test]
    fn success_without_value_is_null() {
        let response: WorkerResponse = serde_json::from_value(json!({
            "invocationId": "00000000-0000-0000-0000-000000000000",
            "outcome": "success"
        }))
        .unwrap();
        assert_eq!(response.into_result().unwrap().into_value(), Value::Null);
    }
}
