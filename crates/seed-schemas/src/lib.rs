//! JSON Schema documents and validation for seed manifests and side-car
//! metadata files.
//!
//! The built-in schemas are embedded at compile time. Callers may replace
//! either of them with a schema file on disk; an override that is not a
//! usable JSON Schema is rejected before any document is checked.

use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const MANIFEST_SCHEMA: &str = "seed.manifest.schema.json";
pub const METADATA_SCHEMA: &str = "seed.metadata.schema.json";

#[derive(Debug, thiserror::Error)]
pub enum SchemaLoadError {
    #[error("unknown built-in schema: {0}")]
    UnknownBuiltin(String),

    #[error("failed to read schema {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema {origin} is not valid JSON: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("schema {origin} is not a valid JSON Schema: {reason}")]
    Compile { origin: String, reason: String },
}

/// A single schema violation.
///
/// `pointer` is the JSON Pointer of the offending instance (empty for the
/// document root), `constraint` the schema keyword path that rejected it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub pointer: String,
    pub constraint: String,
    pub message: String,
    pub actual: Value,
}

impl Violation {
    pub fn new(
        pointer: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
        actual: Value,
    ) -> Self {
        Self {
            pointer: pointer.into(),
            constraint: constraint.into(),
            message: message.into(),
            actual,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pointer = if self.pointer.is_empty() {
            "/"
        } else {
            self.pointer.as_str()
        };
        write!(f, "{}: {} ({})", pointer, self.message, self.constraint)
    }
}

/// Render a violation list one per line, indented, for error messages.
pub fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// An immutable schema document plus a label describing where it came from.
#[derive(Debug, Clone)]
pub struct SchemaDocument {
    origin: String,
    document: Value,
}

impl SchemaDocument {
    pub fn builtin(name: &str) -> Result<Self, SchemaLoadError> {
        let text = SCHEMAS
            .get_file(name)
            .and_then(|f| f.contents_utf8())
            .ok_or_else(|| SchemaLoadError::UnknownBuiltin(name.to_string()))?;
        let origin = format!("builtin:{}", name);
        let document = serde_json::from_str(text).map_err(|source| SchemaLoadError::Parse {
            origin: origin.clone(),
            source,
        })?;
        Ok(Self { origin, document })
    }

    pub fn from_file(path: &Path) -> Result<Self, SchemaLoadError> {
        let text = fs::read_to_string(path).map_err(|source| SchemaLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path.display().to_string();
        let document = serde_json::from_str(&text).map_err(|source| SchemaLoadError::Parse {
            origin: origin.clone(),
            source,
        })?;
        Ok(Self { origin, document })
    }

    /// The override file when one is given, otherwise the named built-in.
    pub fn resolve(override_path: Option<&Path>, builtin: &str) -> Result<Self, SchemaLoadError> {
        match override_path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(builtin),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn as_value(&self) -> &Value {
        &self.document
    }
}

pub struct SchemaValidator {
    origin: String,
    compiled: JSONSchema,
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    pub fn compile(document: &SchemaDocument) -> Result<Self, SchemaLoadError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(document.as_value())
            .map_err(|e| SchemaLoadError::Compile {
                origin: document.origin().to_string(),
                reason: e.to_string(),
            })?;
        debug!(origin = document.origin(), "compiled schema");
        Ok(Self {
            origin: document.origin().to_string(),
            compiled,
        })
    }

    pub fn resolve(override_path: Option<&Path>, builtin: &str) -> Result<Self, SchemaLoadError> {
        Self::compile(&SchemaDocument::resolve(override_path, builtin)?)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Check `instance`, collecting every violation rather than stopping at
    /// the first.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<Violation>> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| Violation {
                    pointer: e.instance_path.to_string(),
                    constraint: e.schema_path.to_string(),
                    message: e.to_string(),
                    actual: e.instance.clone().into_owned(),
                })
                .collect()),
        }
    }
}

/// Compile one of the embedded schemas by file name.
pub fn compile_schema(name: &str) -> Result<SchemaValidator, SchemaLoadError> {
    SchemaValidator::compile(&SchemaDocument::builtin(name)?)
}
