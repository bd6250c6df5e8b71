//! Decoding of change-feed messages into [`ChangeEvent`]s.
//!
//! The wire format is a JSON object with a string `type`. A `documentChanged`
//! event carries the new document state under `change.newValue`; removals carry
//! the last known state under `change.oldValue`. Any other `type` is decoded as
//! [`ChangeKind::Unknown`] so the pipeline can skip it without an error.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;

const DOCUMENT_CHANGED: &str = "documentChanged";
const DOCUMENT_DELETED: &str = "documentDeleted";
const REMOVE_METHOD: &str = "remove";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    DocumentChanged,
    DocumentDeleted,
    Unknown,
}

/// Document identity as produced by the source system.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceIdentifier {
    Scalar(Value),
    /// Named identifier fields, ordered by field name.
    Composite(Vec<(String, Value)>),
}

impl SourceIdentifier {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(fields) => {
                let mut fields: Vec<(String, Value)> = fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                fields.sort_by(|(a, _), (b, _)| a.cmp(b));
                SourceIdentifier::Composite(fields)
            }
            other => SourceIdentifier::Scalar(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// The raw `type` string, kept for diagnostics on unknown events.
    pub event_type: String,
    /// `None` only for `ChangeKind::Unknown`.
    pub source_identifier: Option<SourceIdentifier>,
    pub payload: Map<String, Value>,
    /// Source-only bookkeeping fields present in `payload`.
    pub source_metadata_fields: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub id_field: String,
    pub metadata_fields: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            id_field: "_id".to_string(),
            metadata_fields: vec!["_version".to_string()],
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeBody {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    new_value: Option<Value>,
    #[serde(default)]
    old_value: Option<Value>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    change: Option<ChangeBody>,
}

pub struct EventDecoder {
    config: DecoderConfig,
}

impl EventDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decode raw message bytes. Only bytes that are not JSON at all produce
    /// `DecodeError::Unparseable`, every other problem is `MalformedPayload`.
    pub fn decode(&self, raw: &[u8]) -> Result<ChangeEvent, DecodeError> {
        let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Unparseable)?;

        let Some(object) = value.as_object() else {
            return Err(DecodeError::MalformedPayload(
                "change message is not a JSON object".to_string(),
            ));
        };

        let event_type = match object.get("type") {
            Some(Value::String(event_type)) => event_type.clone(),
            Some(_) => {
                return Err(DecodeError::MalformedPayload(
                    "`type` is not a string".to_string(),
                ))
            }
            None => {
                return Err(DecodeError::MalformedPayload(
                    "missing `type` field".to_string(),
                ))
            }
        };

        if event_type != DOCUMENT_CHANGED && event_type != DOCUMENT_DELETED {
            return Ok(ChangeEvent {
                kind: ChangeKind::Unknown,
                event_type,
                source_identifier: None,
                payload: Map::new(),
                source_metadata_fields: BTreeSet::new(),
            });
        }

        let envelope: Envelope = serde_json::from_value(value).map_err(|e| {
            DecodeError::MalformedPayload(format!("invalid `change` section: {e}"))
        })?;
        let change = envelope.change.ok_or_else(|| {
            DecodeError::MalformedPayload(format!("`{event_type}` event has no `change`"))
        })?;

        let is_removal = event_type == DOCUMENT_DELETED
            || change.method.as_deref() == Some(REMOVE_METHOD);

        if is_removal {
            let old_value = change.old_value.ok_or_else(|| {
                DecodeError::MalformedPayload("removal has no `change.oldValue`".to_string())
            })?;
            let document = as_document(old_value, "change.oldValue")?;
            let source_identifier = self.identifier_of(&document)?;

            return Ok(ChangeEvent {
                kind: ChangeKind::DocumentDeleted,
                event_type,
                source_identifier: Some(source_identifier),
                payload: Map::new(),
                source_metadata_fields: BTreeSet::new(),
            });
        }

        let new_value = change.new_value.ok_or_else(|| {
            DecodeError::MalformedPayload("`change.newValue` is missing".to_string())
        })?;
        let payload = as_document(new_value, "change.newValue")?;
        let source_identifier = self.identifier_of(&payload)?;
        let source_metadata_fields = self
            .config
            .metadata_fields
            .iter()
            .filter(|field| payload.contains_key(field.as_str()))
            .cloned()
            .collect();

        Ok(ChangeEvent {
            kind: ChangeKind::DocumentChanged,
            event_type,
            source_identifier: Some(source_identifier),
            payload,
            source_metadata_fields,
        })
    }

    fn identifier_of(&self, document: &Map<String, Value>) -> Result<SourceIdentifier, DecodeError> {
        match document.get(&self.config.id_field) {
            Some(Value::Null) | None => Err(DecodeError::MalformedPayload(format!(
                "document has no `{}` field",
                self.config.id_field
            ))),
            Some(value) => Ok(SourceIdentifier::from_value(value)),
        }
    }
}

fn as_document(value: Value, location: &str) -> Result<Map<String, Value>, DecodeError> {
    match value {
        Value::Object(document) => Ok(document),
        _ => Err(DecodeError::MalformedPayload(format!(
            "`{location}` is not an object"
        ))),
    }
}
