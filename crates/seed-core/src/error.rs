//! Error types shared by every seed crate.

use seed_schemas::{format_violations, SchemaLoadError, Violation};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SeedError>;

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    // =========================================================================
    // Schema / manifest
    // =========================================================================
    #[error(transparent)]
    SchemaLoad(#[from] SchemaLoadError),

    #[error("no seed manifest found in {dir} (expected one of: {expected})")]
    ManifestNotFound { dir: PathBuf, expected: String },

    #[error("multiple seed manifests found in {dir}: {candidates:?}")]
    AmbiguousManifest {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("malformed manifest {path} at line {line}, column {column}: {message}")]
    MalformedManifest {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid manifest {path} ({} violations):\n{}", .violations.len(), format_violations(.violations))]
    InvalidManifest {
        path: PathBuf,
        violations: Vec<Violation>,
    },

    #[error("invalid version format for {field}: '{value}' (expected MAJOR.MINOR.PATCH)")]
    InvalidVersionFormat { field: String, value: String },

    // =========================================================================
    // Registry / publish
    // =========================================================================
    #[error("registry {registry} unavailable: {reason}")]
    RegistryUnavailable { registry: String, reason: String },

    #[error("publish conflict: {reference} already exists in {registry}. {hint}")]
    PublishConflict {
        reference: String,
        registry: String,
        hint: String,
    },

    // =========================================================================
    // Run binding / outputs
    // =========================================================================
    #[error("missing required {kind} '{name}'")]
    MissingRequiredInput { kind: String, name: String },

    #[error("unrecognized {kind} '{name}': not declared in the manifest interface")]
    UnrecognizedBinding { kind: String, name: String },

    #[error("invalid {kind} binding '{raw}': {reason}")]
    InvalidBinding {
        kind: String,
        raw: String,
        reason: String,
    },

    #[error("output validation failed for {dir} ({} violations):\n{}", .violations.len(), format_violations(.violations))]
    OutputValidation {
        dir: PathBuf,
        violations: Vec<Violation>,
    },

    // =========================================================================
    // External engine
    // =========================================================================
    #[error("{program} {action} failed: {reason}")]
    Engine {
        program: String,
        action: String,
        reason: String,
    },

    #[error("{action} timed out after {seconds}s")]
    Timeout { action: String, seconds: u64 },

    // =========================================================================
    // Plumbing
    // =========================================================================
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SeedError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SeedError::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable snake_case code used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SeedError::SchemaLoad(_) => "schema_load_error",
            SeedError::ManifestNotFound { .. } => "manifest_not_found",
            SeedError::AmbiguousManifest { .. } => "ambiguous_manifest",
            SeedError::MalformedManifest { .. } => "malformed_manifest",
            SeedError::InvalidManifest { .. } => "invalid_manifest",
            SeedError::InvalidVersionFormat { .. } => "invalid_version_format",
            SeedError::RegistryUnavailable { .. } => "registry_unavailable",
            SeedError::PublishConflict { .. } => "publish_conflict",
            SeedError::MissingRequiredInput { .. } => "missing_required_input",
            SeedError::UnrecognizedBinding { .. } => "unrecognized_binding",
            SeedError::InvalidBinding { .. } => "invalid_binding",
            SeedError::OutputValidation { .. } => "output_validation_error",
            SeedError::Engine { .. } => "engine_error",
            SeedError::Timeout { .. } => "timeout",
            SeedError::Io { .. } => "io_error",
            SeedError::Json(_) => "json_error",
        }
    }

    /// Violations carried by the error, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            SeedError::InvalidManifest { violations, .. }
            | SeedError::OutputValidation { violations, .. } => violations,
            _ => &[],
        }
    }
}
