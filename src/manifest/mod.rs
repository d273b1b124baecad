//! Manifest data model: header, instruction kinds and tagged instructions.

mod parser;

pub use parser::{ManifestParser, sample_instructions};

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{VexecError, VexecResult};
use crate::types::Checksum;

/// Instruction type discriminator.
///
/// Unrecognised tags are preserved in [`InstructionKind::Unknown`] so they
/// round-trip through manifests and reach the not-implemented handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    FetchRepo,
    Checkout,
    Execute,
    Install,
    VerifyHash,
    Store,
    Load,
    Move,
    Compile,
    Nop,
    Unknown(String),
}

impl InstructionKind {
    /// Every recognised kind, in declaration order.
    pub const KNOWN: [InstructionKind; 10] = [
        InstructionKind::FetchRepo,
        InstructionKind::Checkout,
        InstructionKind::Execute,
        InstructionKind::Install,
        InstructionKind::VerifyHash,
        InstructionKind::Store,
        InstructionKind::Load,
        InstructionKind::Move,
        InstructionKind::Compile,
        InstructionKind::Nop,
    ];

    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "FETCH_REPO" => Self::FetchRepo,
            "CHECKOUT" => Self::Checkout,
            "EXECUTE" => Self::Execute,
            "INSTALL" => Self::Install,
            "VERIFY_HASH" => Self::VerifyHash,
            "STORE" => Self::Store,
            "LOAD" => Self::Load,
            "MOVE" => Self::Move,
            "COMPILE" => Self::Compile,
            "NOP" => Self::Nop,
            _ => Self::Unknown(tag.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::FetchRepo => "FETCH_REPO",
            Self::Checkout => "CHECKOUT",
            Self::Execute => "EXECUTE",
            Self::Install => "INSTALL",
            Self::VerifyHash => "VERIFY_HASH",
            Self::Store => "STORE",
            Self::Load => "LOAD",
            Self::Move => "MOVE",
            Self::Compile => "COMPILE",
            Self::Nop => "NOP",
            Self::Unknown(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for InstructionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One tagged operation from a manifest body.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// Type-specific fields, excluding the `type` tag itself.
    pub fields: Map<String, Value>,
}

impl Instruction {
    pub fn new(kind: InstructionKind) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// A non-empty string field, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn require_str(&self, key: &'static str) -> VexecResult<&str> {
        self.str_field(key).ok_or(VexecError::MissingField(key))
    }

    /// A list of strings given either as an array or as one
    /// whitespace-separated string. Missing fields yield an empty list.
    pub fn string_list(&self, key: &'static str) -> VexecResult<Vec<String>> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(VexecError::InvalidField {
                        field: key,
                        reason: format!("expected string items, found {other}"),
                    }),
                })
                .collect(),
            Some(other) => Err(VexecError::InvalidField {
                field: key,
                reason: format!("expected a list of strings, found {other}"),
            }),
        }
    }
}

impl Serialize for Instruction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = self.fields.keys().filter(|k| k.as_str() != "type").count();
        let mut map = serializer.serialize_map(Some(extra + 1))?;
        map.serialize_entry("type", self.kind.as_str())?;
        for (key, value) in &self.fields {
            if key != "type" {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Instruction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;
        let kind = match fields.remove("type") {
            Some(Value::String(tag)) if !tag.trim().is_empty() => InstructionKind::from_tag(&tag),
            Some(_) => return Err(de::Error::custom("instruction `type` must be a non-empty string")),
            None => return Err(de::Error::missing_field("type")),
        };
        Ok(Self { kind, fields })
    }
}

/// Manifest header. Only these fields are recognised; anything else in a
/// document header is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub processor_version: String,
    pub protocol_version: String,
    pub memory_budget: String,
    pub time_budget: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub compression: String,
    pub target_platform: String,
    pub execution_mode: String,
}

impl Default for ManifestHeader {
    fn default() -> Self {
        Self {
            processor_version: "1.0".to_string(),
            protocol_version: "1.0".to_string(),
            memory_budget: "512M".to_string(),
            time_budget: "60s".to_string(),
            checksum: None,
            compression: "none".to_string(),
            target_platform: std::env::consts::OS.to_string(),
            execution_mode: "parallel".to_string(),
        }
    }
}

impl ManifestHeader {
    /// Overwrite a known field. Returns `false` for unrecognised keys.
    pub fn apply(&mut self, key: &str, value: String) -> bool {
        match key {
            "processor_version" => self.processor_version = value,
            "protocol_version" => self.protocol_version = value,
            "memory_budget" => self.memory_budget = value,
            "time_budget" => self.time_budget = value,
            "checksum" => {
                self.checksum = (!value.trim().is_empty()).then(|| Checksum::new(value));
            }
            "compression" => self.compression = value,
            "target_platform" => self.target_platform = value,
            "execution_mode" => self.execution_mode = value,
            _ => return false,
        }
        true
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.compression.to_ascii_lowercase().as_str(), "gzip" | "gz")
    }
}

/// A parsed manifest: header plus ordered instruction list.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub header: ManifestHeader,
    pub body: Vec<Instruction>,
}

impl Manifest {
    pub fn new(header: ManifestHeader, body: Vec<Instruction>) -> Self {
        Self { header, body }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The document form: `{"header": {...}, "body": [...]}`.
    pub fn to_document(&self) -> VexecResult<Value> {
        Ok(serde_json::json!({
            "header": serde_json::to_value(&self.header)?,
            "body": serde_json::to_value(&self.body)?,
        }))
    }
}
