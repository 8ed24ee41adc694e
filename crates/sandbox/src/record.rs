//! Records flowing into and out of a script step.
//!
//! Input records arrive from the upstream step. Output records are what a
//! guest return value normalizes into. Error records stand in for failed
//! invocations when the step continues on failure.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to binary content held by a [`BinaryStore`](crate::BinaryStore).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinaryHandle(pub String);

impl BinaryHandle {
    /// Handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where the bytes of an attachment live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryData {
    /// Stored out of band; the guest sees metadata only until it asks.
    Handle(BinaryHandle),
    /// Carried with the record, base64 on the wire.
    Inline(#[serde(with = "base64_bytes")] Bytes),
}

/// Named binary payload attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryAttachment {
    /// Content location.
    pub data: BinaryData,
    /// MIME type, e.g. `application/pdf`.
    pub mime_type: String,
    /// Original file name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl BinaryAttachment {
    /// Attachment stored behind a handle.
    pub fn by_handle(handle: BinaryHandle, mime_type: impl Into<String>) -> Self {
        Self {
            data: BinaryData::Handle(handle),
            mime_type: mime_type.into(),
            file_name: None,
        }
    }

    /// Attachment carrying its bytes inline.
    pub fn inline(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            data: BinaryData::Inline(bytes.into()),
            mime_type: mime_type.into(),
            file_name: None,
        }
    }

    /// Sets the file name.
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Size of inline content; `None` for handle-backed attachments.
    pub fn inline_len(&self) -> Option<usize> {
        match &self.data {
            BinaryData::Inline(bytes) => Some(bytes.len()),
            BinaryData::Handle(_) => None,
        }
    }
}

/// Attachments keyed by name.
pub type Attachments = BTreeMap<String, BinaryAttachment>;

/// One unit of data entering a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRecord {
    /// Structured payload.
    pub data: Value,
    /// Named binary attachments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: Attachments,
    /// Index of the upstream record this one derives from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<usize>,
}

impl InputRecord {
    /// Record with a payload and nothing else.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            attachments: BTreeMap::new(),
            lineage: None,
        }
    }

    /// Adds an attachment.
    pub fn with_attachment(mut self, name: impl Into<String>, attachment: BinaryAttachment) -> Self {
        self.attachments.insert(name.into(), attachment);
        self
    }

    /// Sets lineage.
    pub fn with_lineage(mut self, lineage: usize) -> Self {
        self.lineage = Some(lineage);
        self
    }
}

/// Normalized record produced by a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    /// Structured payload; always an object after validation.
    pub data: Value,
    /// Named binary attachments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: Attachments,
    /// Index of the input record this one derives from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<usize>,
    /// Guest-supplied error details, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<Value>,
    /// Positional index kept for older workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_index: Option<usize>,
}

impl OutputRecord {
    /// Record with a payload and nothing else.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            attachments: BTreeMap::new(),
            lineage: None,
            error_info: None,
            legacy_index: None,
        }
    }

    /// Sets lineage.
    pub fn with_lineage(mut self, lineage: usize) -> Self {
        self.lineage = Some(lineage);
        self
    }

    /// Converts into an input record for the downstream step.
    pub fn into_input(self) -> InputRecord {
        InputRecord {
            data: self.data,
            attachments: self.attachments,
            lineage: self.lineage,
        }
    }
}

/// Payload of an [`ErrorRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable failure message.
    pub error: String,
}

/// Stand-in for a failed invocation when the step continues on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// `{ "error": message }`.
    pub data: ErrorPayload,
    /// Input record that failed; `None` for "Run once for all items".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<usize>,
}

impl ErrorRecord {
    /// Builds an error record.
    pub fn new(error: impl Into<String>, lineage: Option<usize>) -> Self {
        Self {
            data: ErrorPayload {
                error: error.into(),
            },
            lineage,
        }
    }

    /// Failure message.
    pub fn message(&self) -> &str {
        &self.data.error
    }
}

/// One entry in a step's output.
///
/// Serialize-only: an error record is indistinguishable from an output
/// record whose data happens to be `{ "error": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultRecord {
    /// Successfully produced record.
    Output(OutputRecord),
    /// Failure kept in the stream by continue-on-fail.
    Error(ErrorRecord),
}

impl ResultRecord {
    /// The output record, if this entry is one.
    pub fn as_output(&self) -> Option<&OutputRecord> {
        match self {
            Self::Output(record) => Some(record),
            Self::Error(_) => None,
        }
    }

    /// The error record, if this entry is one.
    pub fn as_error(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Error(record) => Some(record),
            Self::Output(_) => None,
        }
    }

    /// Lineage of either kind of entry.
    pub fn lineage(&self) -> Option<usize> {
        match self {
            Self::Output(record) => record.lineage,
            Self::Error(record) => record.lineage,
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn inline_attachment_is_base64_on_the_wire() {
        let attachment = BinaryAttachment::inline(Bytes::from_static(b"hi"), "text/plain")
            .with_file_name("hi.txt");
        let json = serde_json::to_value(&attachment).unwrap();
        assert_eq!(
            json,
            json!({ "data": { "inline": "aGk=" }, "mimeType": "text/plain", "fileName": "hi.txt" })
        );
        let back: BinaryAttachment = serde_json::from_value(json).unwrap();
        assert_eq!(back, attachment);
    }

    #[test]
    fn handle_attachment_serializes_handle_only() {
        let attachment = BinaryAttachment::by_handle(BinaryHandle("bin-1".into()), "image/png");
        let json = serde_json::to_value(&attachment).unwrap();
        assert_eq!(json, json!({ "data": { "handle": "bin-1" }, "mimeType": "image/png" }));
        assert_eq!(attachment.inline_len(), None);
    }

    #[test]
    fn error_record_shape() {
        let record = ResultRecord::Error(ErrorRecord::new("boom", Some(2)));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({ "data": { "error": "boom" }, "lineage": 2 })
        );
        assert_eq!(record.lineage(), Some(2));
        assert!(record.as_output().is_none());
    }

    #[test]
    fn output_record_converts_to_input() {
        let output = OutputRecord::new(json!({ "a": 1 })).with_lineage(4);
        let input = output.into_input();
        assert_eq!(input, InputRecord::new(json!({ "a": 1 })).with_lineage(4));
    }
}
