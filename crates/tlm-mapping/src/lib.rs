//! tlm-mapping
//!
//! Turns a decoded bus message (JSON) into a typed row.
//!
//! The mapping is declared in config as a list of
//! `{ source, destination, type }` entries. `source` is a `/`-separated path
//! into the message, `destination` a column name, `type` one of a closed set
//! of tags. Everything is checked once when the table is compiled; applying
//! a compiled table never panics, it returns a [`MappingError`] and the
//! caller skips the message.
//!
//! When no mapping is configured the fixed meter layout in [`legacy`] is
//! used instead.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod legacy;
mod table;
mod zone;

pub use table::{MappingTable, MessageMapper};
pub use zone::Zone;

// ---------------------------------------------------------------------------
// Declared types
// ---------------------------------------------------------------------------

/// Target type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Time,
    Int64,
    Float64,
    String,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Time => "time.Time",
            FieldType::Int64 => "int64",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, MappingError> {
        match tag.trim() {
            "time.Time" | "time" => Ok(FieldType::Time),
            "int64" => Ok(FieldType::Int64),
            "float64" => Ok(FieldType::Float64),
            "string" => Ok(FieldType::String),
            other => Err(MappingError::UnknownType(other.to_string())),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = MappingError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        FieldType::parse(&tag)
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.as_str().to_string()
    }
}

/// One configured mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

fn default_timezone() -> String {
    "Local".to_string()
}

/// The `mapping:` section of the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSpec {
    /// `Local`, `UTC`, or an IANA zone name. Naive message times are read in
    /// this zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl Default for MappingSpec {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            fields: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// A `type` tag outside the supported set.
    UnknownType(String),
    /// Destination is not a plain SQL identifier.
    InvalidDestination(String),
    /// Two entries write the same column.
    DuplicateDestination(String),
    /// Source path is empty or has an empty segment.
    InvalidSource(String),
    UnknownTimezone(String),
    /// The message is not a JSON object.
    NotAnObject,
    /// A path segment was not found in the message.
    MissingPath { source: String },
    /// The value at `source` has the wrong JSON kind for `expected`.
    WrongKind {
        source: String,
        expected: FieldType,
        found: &'static str,
    },
    /// A time string did not parse, or names a local time that does not
    /// exist in the configured zone.
    BadTime {
        source: String,
        raw: String,
        reason: String,
    },
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::UnknownType(tag) => write!(f, "unknown field type '{tag}'"),
            MappingError::InvalidDestination(name) => {
                write!(f, "destination '{name}' is not a valid column name")
            }
            MappingError::DuplicateDestination(name) => {
                write!(f, "destination '{name}' is mapped twice")
            }
            MappingError::InvalidSource(path) => write!(f, "source path '{path}' is invalid"),
            MappingError::UnknownTimezone(name) => write!(f, "unknown timezone '{name}'"),
            MappingError::NotAnObject => write!(f, "message is not a JSON object"),
            MappingError::MissingPath { source } => write!(f, "'{source}' not found in message"),
            MappingError::WrongKind {
                source,
                expected,
                found,
            } => write!(
                f,
                "'{source}' is {found}, cannot convert to {}",
                expected.as_str()
            ),
            MappingError::BadTime {
                source,
                raw,
                reason,
            } => write!(f, "'{source}' time '{raw}' rejected: {reason}"),
        }
    }
}

impl std::error::Error for MappingError {}

/// JSON kind name for error messages.
pub(crate) fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags() {
        assert_eq!(FieldType::parse("time.Time").unwrap(), FieldType::Time);
        assert_eq!(FieldType::parse("time").unwrap(), FieldType::Time);
        assert_eq!(FieldType::parse("int64").unwrap(), FieldType::Int64);
        assert_eq!(
            FieldType::parse("decimal").unwrap_err(),
            MappingError::UnknownType("decimal".to_string())
        );
    }

    #[test]
    fn spec_from_yaml_rejects_unknown_tag() {
        let ok = "timezone: UTC\nfields:\n  - { source: Time, destination: time, type: time.Time }\n";
        let spec: MappingSpec = serde_yaml::from_str(ok).unwrap();
        assert_eq!(spec.fields[0].field_type, FieldType::Time);

        let bad = "fields:\n  - { source: x, destination: x, type: uint8 }\n";
        let err = serde_yaml::from_str::<MappingSpec>(bad).unwrap_err();
        assert!(err.to_string().contains("unknown field type 'uint8'"));
    }

    #[test]
    fn spec_defaults_to_local_zone() {
        let spec: MappingSpec = serde_yaml::from_str("fields: []").unwrap();
        assert_eq!(spec.timezone, "Local");
    }
}
