//! Normalizes guest return values into output records.
//!
//! The rules are strict on purpose: every record must be an object with a
//! `data` object, and any top-level key outside [`ALLOWED_KEYS`] is an
//! error naming that key rather than something silently dropped.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::record::{Attachments, BinaryAttachment, BinaryData, BinaryHandle, OutputRecord};

/// Top-level keys a returned record may carry.
pub const ALLOWED_KEYS: [&str; 5] = ["data", "attachments", "lineage", "errorInfo", "legacyIndex"];

/// Value returned by guest code, as received at the sandbox boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestValue(Value);

/// Shape of a [`GuestValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestValueKind {
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// String, number, boolean or null.
    Scalar,
}

impl GuestValue {
    /// Wraps a deserialized return value. `undefined` arrives as `null`.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Shape of the value.
    pub fn kind(&self) -> GuestValueKind {
        match self.0 {
            Value::Object(_) => GuestValueKind::Object,
            Value::Array(_) => GuestValueKind::Array,
            _ => GuestValueKind::Scalar,
        }
    }

    /// Borrowed JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Owned JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for GuestValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Normalizes the return value of a "Run once for all items" invocation
/// that saw `input_len` records.
///
/// Lineage defaults to the element position when the output has as many
/// records as the input, and to 0 when there was a single input record.
pub fn validate_all_items(
    value: GuestValue,
    input_len: usize,
) -> Result<Vec<OutputRecord>, ValidationError> {
    let elements = match value.into_value() {
        Value::Array(elements) => elements,
        other => {
            return Err(ValidationError::NotAnArray {
                found: describe(&other),
            });
        }
    };

    let output_len = elements.len();
    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            let object = match element {
                Value::Object(object) => object,
                other => {
                    return Err(ValidationError::ElementNotObject {
                        index,
                        found: describe(&other),
                    });
                }
            };
            let default_lineage = if output_len == input_len {
                Some(index)
            } else if input_len == 1 {
                Some(0)
            } else {
                None
            };
            normalize(object, index, default_lineage, input_len)
        })
        .collect()
}

/// Normalizes the return value of the "Run once for each item" invocation
/// for input record `item_index` out of `input_len`. Lineage defaults to
/// that index.
pub fn validate_per_item(
    value: GuestValue,
    item_index: usize,
    input_len: usize,
) -> Result<OutputRecord, ValidationError> {
    if value.kind() == GuestValueKind::Array {
        return Err(ValidationError::ArrayInPerItemMode { item_index });
    }
    match value.into_value() {
        Value::Object(object) => normalize(object, item_index, Some(item_index), input_len),
        other => Err(ValidationError::NotAnObject {
            item_index,
            found: describe(&other),
        }),
    }
}

/// `input_len` bounds an explicit `lineage`: it must name an input record.
fn normalize(
    mut object: Map<String, Value>,
    item_index: usize,
    default_lineage: Option<usize>,
    input_len: usize,
) -> Result<OutputRecord, ValidationError> {
    if let Some(key) = object.keys().find(|key| !ALLOWED_KEYS.contains(&key.as_str())) {
        return Err(ValidationError::UnknownKey {
            key: key.clone(),
            item_index,
        });
    }

    let data = match object.remove("data") {
        Some(Value::Object(data)) => Value::Object(data),
        Some(other) => {
            return Err(ValidationError::InvalidField {
                key: "data",
                item_index,
                reason: format!("expected an object, got {}", describe(&other)),
            });
        }
        None => return Err(ValidationError::MissingData { item_index }),
    };

    let lineage = match object.remove("lineage") {
        None => default_lineage,
        Some(Value::Null) => None,
        Some(value) => match index_field("lineage", &value, item_index)? {
            lineage if lineage < input_len => Some(lineage),
            lineage => {
                return Err(ValidationError::InvalidField {
                    key: "lineage",
                    item_index,
                    reason: format!("input record {lineage} does not exist ({input_len} records)"),
                });
            }
        },
    };

    let legacy_index = match object.remove("legacyIndex") {
        None | Some(Value::Null) => None,
        Some(value) => Some(index_field("legacyIndex", &value, item_index)?),
    };

    let attachments = match object.remove("attachments") {
        None | Some(Value::Null) => Attachments::new(),
        Some(value) => attachments(value, item_index)?,
    };

    let error_info = object.remove("errorInfo").filter(|value| !value.is_null());

    Ok(OutputRecord {
        data,
        attachments,
        lineage,
        error_info,
        legacy_index,
    })
}

fn index_field(key: &'static str, value: &Value, item_index: usize) -> Result<usize, ValidationError> {
    value
        .as_u64()
        .map(|index| index as usize)
        .ok_or_else(|| ValidationError::InvalidField {
            key,
            item_index,
            reason: format!("expected a non-negative integer, got {}", describe(value)),
        })
}

fn attachments(value: Value, item_index: usize) -> Result<Attachments, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        key: "attachments",
        item_index,
        reason,
    };

    let entries = match value {
        Value::Object(entries) => entries,
        other => return Err(invalid(format!("expected an object, got {}", describe(&other)))),
    };

    let mut attachments = BTreeMap::new();
    for (name, entry) in entries {
        let mut entry = match entry {
            Value::Object(entry) => entry,
            _ => return Err(invalid(format!("attachment `{name}` is not an object"))),
        };
        let mime_type = match entry.remove("mimeType") {
            Some(Value::String(mime_type)) if !mime_type.is_empty() => mime_type,
            _ => return Err(invalid(format!("attachment `{name}` needs a `mimeType` string"))),
        };
        let file_name = match entry.remove("fileName") {
            None | Some(Value::Null) => None,
            Some(Value::String(file_name)) => Some(file_name),
            Some(_) => return Err(invalid(format!("attachment `{name}` has a non-string `fileName`"))),
        };
        let data = match (entry.remove("id"), entry.remove("data")) {
            (Some(Value::String(id)), None) => BinaryData::Handle(BinaryHandle(id)),
            (None, Some(Value::String(encoded))) => STANDARD
                .decode(encoded.as_bytes())
                .map(|bytes| BinaryData::Inline(Bytes::from(bytes)))
                .map_err(|e| invalid(format!("attachment `{name}` has invalid base64 data: {e}")))?,
            _ => {
                return Err(invalid(format!(
                    "attachment `{name}` needs exactly one of `id` or base64 `data`"
                )));
            }
        };
        attachments.insert(
            name,
            BinaryAttachment {
                data,
                mime_type,
                file_name,
            },
        );
    }
    Ok(attachments)
}

/// Renders a normalized record back into the shape guests return.
///
/// Lineage is always explicit, so validating the result yields the same
/// record again.
pub fn guest_shape(record: &OutputRecord) -> Value {
    let mut object = Map::new();
    object.insert("data".into(), record.data.clone());
    object.insert(
        "lineage".into(),
        record.lineage.map_or(Value::Null, Value::from),
    );
    if !record.attachments.is_empty() {
        let attachments = record
            .attachments
            .iter()
            .map(|(name, attachment)| {
                let mut entry = Map::new();
                match &attachment.data {
                    BinaryData::Handle(handle) => {
                        entry.insert("id".into(), Value::String(handle.0.clone()));
                    }
                    BinaryData::Inline(bytes) => {
                        entry.insert("data".into(), Value::String(STANDARD.encode(bytes)));
                    }
                }
                entry.insert("mimeType".into(), Value::String(attachment.mime_type.clone()));
                if let Some(file_name) = &attachment.file_name {
                    entry.insert("fileName".into(), Value::String(file_name.clone()));
                }
                (name.clone(), Value::Object(entry))
            })
            .collect();
        object.insert("attachments".into(), Value::Object(attachments));
    }
    if let Some(error_info) = &record.error_info {
        object.insert("errorInfo".into(), error_info.clone());
    }
    if let Some(legacy_index) = record.legacy_index {
        object.insert("legacyIndex".into(), Value::from(legacy_index));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ExecutionMode;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn guest(value: Value) -> GuestValue {
        GuestValue::new(value)
    }

    #[test]
    fn all_items_normalizes_records_with_positional_lineage() {
        let records = validate_all_items(
            guest(json!([{ "data": { "a": 1 } }, { "data": { "a": 2 } }])),
            2,
        )
        .unwrap();
        assert_eq!(
            records,
            vec![
                OutputRecord::new(json!({ "a": 1 })).with_lineage(0),
                OutputRecord::new(json!({ "a": 2 })).with_lineage(1),
            ]
        );
    }

    #[test]
    fn all_items_single_input_links_everything_to_it() {
        let records = validate_all_items(
            guest(json!([{ "data": {} }, { "data": {} }, { "data": {} }])),
            1,
        )
        .unwrap();
        assert!(records.iter().all(|record| record.lineage == Some(0)));
    }

    #[test]
    fn all_items_mismatched_lengths_leave_lineage_unset() {
        let records = validate_all_items(guest(json!([{ "data": {} }])), 3).unwrap();
        assert_eq!(records[0].lineage, None);
    }

    #[test]
    fn explicit_lineage_wins_and_null_clears_it() {
        let records = validate_all_items(
            guest(json!([{ "data": {}, "lineage": 1 }, { "data": {}, "lineage": null }])),
            2,
        )
        .unwrap();
        assert_eq!(records[0].lineage, Some(1));
        assert_eq!(records[1].lineage, None);
    }

    #[test]
    fn unknown_key_is_reported_before_missing_data() {
        let err = validate_all_items(guest(json!([{ "json": { "a": 1 } }])), 1).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownKey {
                key: "json".into(),
                item_index: 0
            }
        );
    }

    #[test]
    fn missing_data_is_reported() {
        let err = validate_all_items(guest(json!([{ "lineage": 0 }])), 1).unwrap_err();
        assert_eq!(err, ValidationError::MissingData { item_index: 0 });
    }

    #[rstest]
    #[case(json!({ "data": {} }), "an object")]
    #[case(json!("nope"), "a string")]
    #[case(json!(null), "null")]
    fn all_items_requires_an_array(#[case] value: Value, #[case] found: &'static str) {
        let err = validate_all_items(guest(value), 1).unwrap_err();
        assert_eq!(err, ValidationError::NotAnArray { found });
    }

    #[test]
    fn all_items_rejects_non_object_elements() {
        let err = validate_all_items(guest(json!([{ "data": {} }, 7])), 2).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ElementNotObject {
                index: 1,
                found: "a number"
            }
        );
    }

    #[test]
    fn per_item_defaults_lineage_to_the_record_index() {
        let record = validate_per_item(guest(json!({ "data": { "x": 1 } })), 2, 3).unwrap();
        assert_eq!(record, OutputRecord::new(json!({ "x": 1 })).with_lineage(2));
    }

    #[test]
    fn per_item_array_names_the_item_index() {
        let err = validate_per_item(guest(json!([{ "data": {} }])), 2, 3).unwrap_err();
        assert_eq!(err, ValidationError::ArrayInPerItemMode { item_index: 2 });
        assert_eq!(err.item_index(), Some(2));
    }

    #[test]
    fn per_item_scalar_is_not_an_object() {
        let err = validate_per_item(guest(json!(42)), 0, 1).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NotAnObject {
                item_index: 0,
                found: "a number"
            }
        );
    }

    #[rstest]
    #[case(json!({ "data": [1, 2] }), "data")]
    #[case(json!({ "data": {}, "lineage": -1 }), "lineage")]
    #[case(json!({ "data": {}, "legacyIndex": "x" }), "legacyIndex")]
    #[case(json!({ "data": {}, "attachments": [] }), "attachments")]
    fn invalid_known_fields(#[case] value: Value, #[case] expected_key: &str) {
        match validate_per_item(guest(value), 0, 1).unwrap_err() {
            ValidationError::InvalidField { key, .. } => assert_eq!(key, expected_key),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case(ExecutionMode::AllItems, 2, 2)]
    #[case(ExecutionMode::AllItems, 2, 99)]
    #[case(ExecutionMode::PerItem, 3, 3)]
    #[case(ExecutionMode::PerItem, 1, 1)]
    fn lineage_must_name_an_input_record(
        #[case] mode: ExecutionMode,
        #[case] input_len: usize,
        #[case] lineage: usize,
    ) {
        let record = json!({ "data": {}, "lineage": lineage });
        let err = match mode {
            ExecutionMode::AllItems => {
                validate_all_items(guest(json!([record])), input_len).unwrap_err()
            }
            ExecutionMode::PerItem => validate_per_item(guest(record), 0, input_len).unwrap_err(),
        };
        match err {
            ValidationError::InvalidField { key, item_index, .. } => {
                assert_eq!((key, item_index), ("lineage", 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn last_input_record_is_a_valid_lineage() {
        let record = validate_per_item(guest(json!({ "data": {}, "lineage": 2 })), 0, 3).unwrap();
        assert_eq!(record.lineage, Some(2));
    }

    #[test]
    fn attachments_accept_handles_and_inline_base64() {
        let record = validate_per_item(
            guest(json!({
                "data": {},
                "attachments": {
                    "report": { "id": "bin-1", "mimeType": "application/pdf", "fileName": "r.pdf" },
                    "note": { "data": "aGk=", "mimeType": "text/plain" },
                },
                "errorInfo": { "code": 7 },
                "legacyIndex": 3,
            })),
            0,
            1,
        )
        .unwrap();

        assert_eq!(
            record.attachments["report"],
            BinaryAttachment::by_handle(BinaryHandle("bin-1".into()), "application/pdf")
                .with_file_name("r.pdf")
        );
        assert_eq!(
            record.attachments["note"],
            BinaryAttachment::inline(Bytes::from_static(b"hi"), "text/plain")
        );
        assert_eq!(record.error_info, Some(json!({ "code": 7 })));
        assert_eq!(record.legacy_index, Some(3));
    }

    #[test]
    fn attachment_without_mime_type_is_rejected() {
        let err = validate_per_item(
            guest(json!({ "data": {}, "attachments": { "f": { "id": "x" } } })),
            0,
            1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mimeType"), "{err}");
    }

    #[test]
    fn normalizing_normalized_records_is_the_identity() {
        let first = validate_all_items(
            guest(json!([
                { "data": { "a": 1 }, "attachments": { "f": { "data": "aGk=", "mimeType": "text/plain" } } },
                { "data": { "a": 2 }, "lineage": null, "errorInfo": "warn" },
                { "data": { "a": 3 }, "legacyIndex": 9 },
            ])),
            3,
        )
        .unwrap();

        let again = Value::Array(first.iter().map(guest_shape).collect());
        let second = validate_all_items(guest(again), 3).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn per_item_output_round_trips_through_guest_shape() {
        let first = validate_per_item(guest(json!({ "data": { "k": "v" } })), 4, 5).unwrap();
        let second = validate_per_item(guest(guest_shape(&first)), 4, 5).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn guest_value_kinds() {
        assert_eq!(guest(json!({})).kind(), GuestValueKind::Object);
        assert_eq!(guest(json!([])).kind(), GuestValueKind::Array);
        assert_eq!(guest(json!(null)).kind(), GuestValueKind::Scalar);
    }
}
