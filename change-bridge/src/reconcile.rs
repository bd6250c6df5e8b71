//! Identifier reconciliation between the source and the sink.
//!
//! The source identifies documents with arbitrary JSON (a scalar or an object of
//! named fields), the sink with a single native identifier. Reconciliation is a
//! pure function of its input, which is what makes redelivered writes land on the
//! same sink document.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use mongodb::bson::oid::ObjectId;
use serde_json::{Map, Value};

use crate::error::ReconcileError;
use crate::event::{ChangeEvent, ChangeKind, SourceIdentifier};

/// How scalar source identifiers become sink identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdConversion {
    /// Every identifier must be a 24 character hex string.
    ObjectId,
    /// Hex strings become ObjectIds, other strings and integers are kept.
    Auto,
    /// Strings and integers are kept as they are.
    Preserve,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseIdConversionError(String);

impl fmt::Display for ParseIdConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown id conversion {}, must be object_id, auto or preserve",
            self.0
        )
    }
}

impl FromStr for IdConversion {
    type Err = ParseIdConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "object_id" | "objectid" => Ok(IdConversion::ObjectId),
            "auto" => Ok(IdConversion::Auto),
            "preserve" => Ok(IdConversion::Preserve),
            _ => Err(ParseIdConversionError(s.to_owned())),
        }
    }
}

/// What to do with composite source identifiers, which have no single-field
/// equivalent in the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositeIdRule {
    Reject,
    /// Join JSON encoded `name=value` pairs, ordered by name, behind and
    /// between a reserved separator.
    Concatenate { separator: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SinkIdentifier {
    ObjectId(ObjectId),
    String(String),
    Int(i64),
}

impl fmt::Display for SinkIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkIdentifier::ObjectId(oid) => write!(f, "ObjectId({})", oid.to_hex()),
            SinkIdentifier::String(s) => write!(f, "{s:?}"),
            SinkIdentifier::Int(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Upsert,
    Delete,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Upsert => "upsert",
            WriteOperation::Delete => "delete",
        }
    }
}

/// Sink-ready form of a change. `document` never holds source-only fields nor
/// the identity field, the sink installs `sink_identifier` when it writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledWrite {
    pub sink_identifier: SinkIdentifier,
    pub document: Map<String, Value>,
    pub operation: WriteOperation,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub id_field: String,
    pub id_conversion: IdConversion,
    pub composite_rule: CompositeIdRule,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            id_field: "_id".to_string(),
            id_conversion: IdConversion::Auto,
            composite_rule: CompositeIdRule::Reject,
        }
    }
}

pub struct IdentifierReconciler {
    config: ReconcilerConfig,
}

impl IdentifierReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// Map a source identifier to a sink identifier and strip every metadata
    /// field, plus the identity field, from the payload.
    pub fn reconcile(
        &self,
        source_identifier: &SourceIdentifier,
        mut payload: Map<String, Value>,
        metadata_fields: &BTreeSet<String>,
    ) -> Result<(SinkIdentifier, Map<String, Value>), ReconcileError> {
        let sink_identifier = match source_identifier {
            SourceIdentifier::Scalar(value) => {
                let identifier = self.convert_scalar(value)?;
                self.check_reserved_separator(&identifier)?;
                identifier
            }
            SourceIdentifier::Composite(fields) => self.compose(fields)?,
        };

        for field in metadata_fields {
            payload.remove(field);
        }
        payload.remove(&self.config.id_field);

        Ok((sink_identifier, payload))
    }

    /// Reconcile a whole event. Returns `None` for events that need no write.
    pub fn reconcile_event(
        &self,
        event: ChangeEvent,
    ) -> Result<Option<ReconciledWrite>, ReconcileError> {
        let operation = match event.kind {
            ChangeKind::DocumentChanged => WriteOperation::Upsert,
            ChangeKind::DocumentDeleted => WriteOperation::Delete,
            ChangeKind::Unknown => return Ok(None),
        };
        let Some(source_identifier) = event.source_identifier else {
            return Ok(None);
        };

        let (sink_identifier, document) = self.reconcile(
            &source_identifier,
            event.payload,
            &event.source_metadata_fields,
        )?;

        Ok(Some(ReconciledWrite {
            sink_identifier,
            document,
            operation,
        }))
    }

    fn convert_scalar(&self, value: &Value) -> Result<SinkIdentifier, ReconcileError> {
        match (value, self.config.id_conversion) {
            (Value::String(s), IdConversion::ObjectId) => ObjectId::parse_str(s)
                .map(SinkIdentifier::ObjectId)
                .map_err(|_| ReconcileError::InvalidIdentifier(value.to_string())),
            (Value::String(s), IdConversion::Auto) => Ok(ObjectId::parse_str(s)
                .map(SinkIdentifier::ObjectId)
                .unwrap_or_else(|_| SinkIdentifier::String(s.clone()))),
            (Value::String(s), IdConversion::Preserve) => Ok(SinkIdentifier::String(s.clone())),
            (Value::Number(n), IdConversion::Auto | IdConversion::Preserve) => n
                .as_i64()
                .map(SinkIdentifier::Int)
                .ok_or_else(|| ReconcileError::InvalidIdentifier(value.to_string())),
            _ => Err(ReconcileError::InvalidIdentifier(value.to_string())),
        }
    }

    /// Compose a composite identifier under the `Concatenate` rule.
    ///
    /// Each field renders as `"name"=value` with both sides JSON encoded, so
    /// names containing `=` stay delimited and `"1"` differs from `1`. The
    /// result starts with the separator, which scalar string identifiers may
    /// not contain under this rule, so the two never share a sink identity.
    fn compose(&self, fields: &[(String, Value)]) -> Result<SinkIdentifier, ReconcileError> {
        let separator = match &self.config.composite_rule {
            CompositeIdRule::Reject => {
                return Err(ReconcileError::UnsupportedCompositeIdentifier {
                    fields: fields.iter().map(|(name, _)| name.clone()).collect(),
                })
            }
            CompositeIdRule::Concatenate { separator } => separator.as_str(),
        };

        if fields.is_empty() {
            return Err(ReconcileError::InvalidIdentifier("{}".to_string()));
        }

        let mut parts = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                return Err(ReconcileError::InvalidIdentifier(value.to_string()));
            }
            let part = format!("{}={}", Value::String(name.clone()), value);
            if part.contains(separator) {
                return Err(ReconcileError::InvalidIdentifier(part));
            }
            parts.push(part);
        }

        let composed = format!("{separator}{}", parts.join(separator));
        // Must split back into exactly its parts, whatever the separator.
        if !composed
            .split(separator)
            .skip(1)
            .eq(parts.iter().map(String::as_str))
        {
            return Err(ReconcileError::InvalidIdentifier(composed));
        }

        Ok(SinkIdentifier::String(composed))
    }

    /// Under the `Concatenate` rule the separator is reserved for composite
    /// identifiers.
    fn check_reserved_separator(&self, identifier: &SinkIdentifier) -> Result<(), ReconcileError> {
        match (&self.config.composite_rule, identifier) {
            (CompositeIdRule::Concatenate { separator }, SinkIdentifier::String(s))
                if s.contains(separator.as_str()) =>
            {
                Err(ReconcileError::InvalidIdentifier(s.clone()))
            }
            _ => Ok(()),
        }
    }
}
