use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use tlm_schemas::{is_sql_identifier, FieldValue, Payload};

use crate::{json_kind, legacy, FieldType, MappingError, MappingSpec, Zone};

// ---------------------------------------------------------------------------
// Compiled table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct CompiledField {
    source: String,
    path: Vec<String>,
    destination: String,
    field_type: FieldType,
}

/// Validated, immutable mapping. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingTable {
    zone: Zone,
    fields: Vec<CompiledField>,
}

impl MappingTable {
    pub fn compile(spec: &MappingSpec) -> Result<Self, MappingError> {
        let zone = Zone::parse(&spec.timezone)?;
        let mut seen = BTreeSet::new();
        let mut fields = Vec::with_capacity(spec.fields.len());

        for f in &spec.fields {
            if !is_sql_identifier(&f.destination) {
                return Err(MappingError::InvalidDestination(f.destination.clone()));
            }
            if !seen.insert(f.destination.clone()) {
                return Err(MappingError::DuplicateDestination(f.destination.clone()));
            }
            let path: Vec<String> = f.source.split('/').map(str::to_string).collect();
            if path.iter().any(|seg| seg.is_empty()) {
                return Err(MappingError::InvalidSource(f.source.clone()));
            }
            fields.push(CompiledField {
                source: f.source.clone(),
                path,
                destination: f.destination.clone(),
                field_type: f.field_type,
            });
        }

        Ok(Self { zone, fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Map one message. Fails on the first field that cannot be produced.
    pub fn apply(&self, message: &Value) -> Result<Payload, MappingError> {
        if !message.is_object() {
            return Err(MappingError::NotAnObject);
        }
        let mut row = Payload::new();
        for f in &self.fields {
            let raw = lookup(message, &f.path).ok_or_else(|| MappingError::MissingPath {
                source: f.source.clone(),
            })?;
            let value = coerce(self.zone, &f.source, f.field_type, raw)?;
            debug!(source = %f.source, destination = %f.destination, %value, "mapped");
            row.insert(f.destination.clone(), value);
        }
        Ok(row)
    }
}

fn lookup<'v>(message: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(message, |node, seg| node.get(seg.as_str()))
}

/// Convert one JSON value to the declared column type.
pub(crate) fn coerce(
    zone: Zone,
    source: &str,
    field_type: FieldType,
    raw: &Value,
) -> Result<FieldValue, MappingError> {
    let wrong_kind = || MappingError::WrongKind {
        source: source.to_string(),
        expected: field_type,
        found: json_kind(raw),
    };
    match (field_type, raw) {
        (FieldType::Time, Value::String(s)) => zone.parse_time(source, s).map(FieldValue::Time),
        (FieldType::Int64, Value::Number(n)) => n
            .as_i64()
            // Fractional readings are truncated toward zero.
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(FieldValue::Int)
            .ok_or_else(wrong_kind),
        (FieldType::Float64, Value::Number(n)) => {
            n.as_f64().map(FieldValue::Float).ok_or_else(wrong_kind)
        }
        (FieldType::String, Value::String(s)) => Ok(FieldValue::Text(s.clone())),
        (FieldType::String, Value::Number(n)) => Ok(FieldValue::Text(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Ok(FieldValue::Text(b.to_string())),
        _ => Err(wrong_kind()),
    }
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// What the ingest loop calls per message: the configured table, or the
/// fixed meter layout when the table is empty.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageMapper {
    Table(MappingTable),
    Legacy(Zone),
}

impl MessageMapper {
    pub fn from_spec(spec: &MappingSpec) -> Result<Self, MappingError> {
        let table = MappingTable::compile(spec)?;
        if table.is_empty() {
            Ok(MessageMapper::Legacy(table.zone()))
        } else {
            Ok(MessageMapper::Table(table))
        }
    }

    pub fn map(&self, message: &Value) -> Result<Payload, MappingError> {
        match self {
            MessageMapper::Table(table) => table.apply(message),
            MessageMapper::Legacy(zone) => legacy::parse_meter(*zone, message),
        }
    }

    /// Columns this mapper produces, for creating the store table.
    pub fn columns(&self) -> Vec<(String, FieldType)> {
        match self {
            MessageMapper::Table(t) => t
                .fields
                .iter()
                .map(|f| (f.destination.clone(), f.field_type))
                .collect(),
            MessageMapper::Legacy(_) => legacy::COLUMNS
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            MessageMapper::Table(t) => format!("table({} fields)", t.fields.len()),
            MessageMapper::Legacy(_) => "legacy meter".to_string(),
        }
    }
}
