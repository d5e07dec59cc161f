//! Seed manifest model and loader.

use crate::error::{Result, SeedError};
use crate::image::ImageReference;
use seed_schemas::{SchemaValidator, Violation, MANIFEST_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE_NAME: &str = "seed.manifest.json";
pub const LEGACY_MANIFEST_FILE_NAME: &str = "seed.json";

const MANIFEST_FILE_NAMES: &[&str] = &[MANIFEST_FILE_NAME, LEGACY_MANIFEST_FILE_NAME];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl JsonType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub media_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputJson {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: JsonType,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputJson {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(rename = "type")]
    pub value_type: JsonType,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl OutputJson {
    /// Key looked up in `seed.outputs.json`; defaults to the output name.
    pub fn lookup_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Ro,
    Rw,
}

impl MountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MountMode::Ro => "ro",
            MountMode::Rw => "rw",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub mode: MountMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Setting {
    pub name: String,
    #[serde(default)]
    pub secret: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inputs {
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub json: Vec<InputJson>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Outputs {
    #[serde(default)]
    pub files: Vec<OutputFile>,
    #[serde(default)]
    pub json: Vec<OutputJson>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub settings: Vec<Setting>,
}

impl Interface {
    pub fn mount(&self, name: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.name == name)
    }

    pub fn setting(&self, name: &str) -> Option<&Setting> {
        self.settings.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarResource {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub input_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub scalar: Vec<ScalarResource>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorMapping {
    pub code: i32,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Maintainer {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    pub algorithm_version: String,
    pub package_version: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub maintainer: Maintainer,
    pub timeout: u64,
    #[serde(default)]
    pub interface: Interface,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub errors: Vec<ErrorMapping>,
}

impl Job {
    pub fn error_for_code(&self, code: i32) -> Option<&ErrorMapping> {
        self.errors.iter().find(|e| e.code == code)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestView {
    seed_version: String,
    job: Job,
}

/// A parsed seed manifest: the typed view plus the raw document it came
/// from, so rewrites keep fields this crate does not model.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub seed_version: String,
    pub job: Job,
    document: Value,
}

impl Manifest {
    /// Build the typed view of an already schema-checked document.
    pub fn from_value(document: Value) -> std::result::Result<Self, serde_json::Error> {
        let view: ManifestView = serde_json::from_value(document.clone())?;
        Ok(Self {
            seed_version: view.seed_version,
            job: view.job,
            document,
        })
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn into_document(self) -> Value {
        self.document
    }

    pub fn image(&self) -> ImageReference {
        ImageReference::for_job(&self.job)
    }
}

/// A manifest together with the absolute path it was read from.
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub manifest: Manifest,
    pub path: PathBuf,
}

/// Find the single manifest file in `dir`. A path naming a file is
/// returned as-is.
pub fn locate_manifest(dir: &Path) -> Result<PathBuf> {
    if dir.is_file() {
        return Ok(dir.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = MANIFEST_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .filter(|p| p.is_file())
        .collect();
    match candidates.len() {
        0 => Err(SeedError::ManifestNotFound {
            dir: dir.to_path_buf(),
            expected: MANIFEST_FILE_NAMES.join(", "),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(SeedError::AmbiguousManifest {
            dir: dir.to_path_buf(),
            candidates,
        }),
    }
}

/// Locate, parse and validate the manifest in `dir`.
pub fn load_manifest(dir: &Path, schema_override: Option<&Path>) -> Result<LoadedManifest> {
    let validator = SchemaValidator::resolve(schema_override, MANIFEST_SCHEMA)?;
    load_manifest_with(dir, &validator)
}

pub fn load_manifest_with(dir: &Path, validator: &SchemaValidator) -> Result<LoadedManifest> {
    let located = locate_manifest(dir)?;
    let path = fs::canonicalize(&located)
        .map_err(|e| SeedError::io(format!("resolve {}", located.display()), e))?;
    let text = fs::read_to_string(&path)
        .map_err(|e| SeedError::io(format!("read {}", path.display()), e))?;
    let manifest = parse_manifest(&path, &text, validator)?;
    debug!(path = %path.display(), job = %manifest.job.name, "loaded seed manifest");
    Ok(LoadedManifest { manifest, path })
}

/// Parse and validate manifest text. `path` is only used in diagnostics.
pub fn parse_manifest(path: &Path, text: &str, validator: &SchemaValidator) -> Result<Manifest> {
    let document: Value =
        serde_json::from_str(text).map_err(|e| SeedError::MalformedManifest {
            path: path.to_path_buf(),
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })?;

    let mut violations = match validator.validate(&document) {
        Ok(()) => Vec::new(),
        Err(violations) => violations,
    };
    violations.extend(check_unique_names(&document));
    if !violations.is_empty() {
        return Err(SeedError::InvalidManifest {
            path: path.to_path_buf(),
            violations,
        });
    }

    Manifest::from_value(document.clone()).map_err(|e| SeedError::InvalidManifest {
        path: path.to_path_buf(),
        violations: vec![Violation::new("", "manifestModel", e.to_string(), document)],
    })
}

/// Interface name categories. Names must be unique across every list in a
/// category because they all become container environment variables.
const NAME_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "input",
        &["/job/interface/inputs/files", "/job/interface/inputs/json"],
    ),
    (
        "output",
        &["/job/interface/outputs/files", "/job/interface/outputs/json"],
    ),
    ("mount", &["/job/interface/mounts"]),
    ("setting", &["/job/interface/settings"]),
];

pub fn check_unique_names(document: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (category, lists) in NAME_CATEGORIES {
        let mut seen: BTreeMap<&str, String> = BTreeMap::new();
        for list in lists.iter() {
            let Some(entries) = document.pointer(list).and_then(|v| v.as_array()) else {
                continue;
            };
            for (idx, entry) in entries.iter().enumerate() {
                let Some(name) = entry.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let pointer = format!("{}/{}/name", list, idx);
                if let Some(first) = seen.get(name) {
                    violations.push(Violation::new(
                        pointer,
                        "uniqueName",
                        format!("duplicate {} name '{}' (first declared at {})", category, name, first),
                        Value::String(name.to_string()),
                    ));
                } else {
                    seen.insert(name, pointer);
                }
            }
        }
    }
    violations
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::ensure_dir;
    use serde_json::json;

    pub(crate) fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "seed_core_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    pub(crate) fn sample_manifest() -> Value {
        json!({
            "seedVersion": "1.0.0",
            "job": {
                "name": "foo",
                "algorithmVersion": "2.1.0",
                "packageVersion": "1.0.0",
                "title": "Foo detector",
                "maintainer": { "name": "Jane", "email": "jane@example.com" },
                "timeout": 30,
                "interface": {
                    "command": "${INPUT_FILE} ${OUTPUT_DIR}",
                    "inputs": {
                        "files": [{ "name": "INPUT_FILE" }],
                        "json": [{ "name": "THRESHOLD", "type": "number", "required": false }]
                    },
                    "outputs": {
                        "files": [{ "name": "RESULT", "pattern": "*.txt" }],
                        "json": [{ "name": "COUNT", "key": "count", "type": "integer" }]
                    },
                    "mounts": [{ "name": "REFERENCE", "path": "/ref" }],
                    "settings": [{ "name": "DB_HOST" }]
                },
                "errors": [{ "code": 3, "name": "bad-input", "title": "Bad input" }]
            }
        })
    }

    pub(crate) fn write_manifest(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_vec_pretty(value).expect("json")).expect("write");
        path
    }

    #[test]
    fn loads_valid_manifest_with_defaults() {
        let dir = temp_dir("load_ok");
        write_manifest(&dir, MANIFEST_FILE_NAME, &sample_manifest());
        let loaded = load_manifest(&dir, None).expect("valid manifest");
        let job = &loaded.manifest.job;
        assert_eq!(job.name, "foo");
        assert_eq!(job.package_version, "1.0.0");
        assert!(job.interface.inputs.files[0].required);
        assert!(!job.interface.inputs.json[0].required);
        assert_eq!(job.interface.outputs.json[0].lookup_key(), "count");
        assert_eq!(
            job.interface.mount("REFERENCE").expect("mount").mode,
            MountMode::Ro
        );
        assert!(job.interface.setting("DB_HOST").is_some());
        assert_eq!(job.error_for_code(3).expect("error").name, "bad-input");
        assert!(loaded.path.is_absolute());
        assert_eq!(loaded.manifest.document(), &sample_manifest());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = temp_dir("missing");
        let err = load_manifest(&dir, None).expect_err("no manifest");
        assert!(matches!(err, SeedError::ManifestNotFound { .. }), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn both_conventions_present_is_ambiguous() {
        let dir = temp_dir("ambiguous");
        write_manifest(&dir, MANIFEST_FILE_NAME, &sample_manifest());
        write_manifest(&dir, LEGACY_MANIFEST_FILE_NAME, &sample_manifest());
        let err = load_manifest(&dir, None).expect_err("ambiguous");
        match err {
            SeedError::AmbiguousManifest { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguous, got {}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn legacy_name_is_accepted() {
        let dir = temp_dir("legacy");
        write_manifest(&dir, LEGACY_MANIFEST_FILE_NAME, &sample_manifest());
        let loaded = load_manifest(&dir, None).expect("legacy manifest");
        assert!(loaded.path.ends_with(LEGACY_MANIFEST_FILE_NAME));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn file_path_is_used_directly() {
        let dir = temp_dir("direct");
        let path = write_manifest(&dir, "custom.json", &sample_manifest());
        let loaded = load_manifest(&path, None).expect("direct path");
        assert!(loaded.path.ends_with("custom.json"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn parse_error_reports_position() {
        let dir = temp_dir("malformed");
        fs::write(dir.join(MANIFEST_FILE_NAME), "{\n  \"job\": ,\n}").expect("write");
        let err = load_manifest(&dir, None).expect_err("malformed");
        match err {
            SeedError::MalformedManifest { line, column, .. } => {
                assert_eq!(line, 2);
                assert!(column > 0);
            }
            other => panic!("expected malformed, got {}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn schema_violations_are_all_reported() {
        let dir = temp_dir("invalid");
        let mut manifest = sample_manifest();
        manifest["job"]["interface"]["outputs"]["files"][0]
            .as_object_mut()
            .expect("object")
            .remove("name");
        manifest["job"]["name"] = json!("Not Valid");
        write_manifest(&dir, MANIFEST_FILE_NAME, &manifest);
        let err = load_manifest(&dir, None).expect_err("invalid");
        let pointers: Vec<&str> = err.violations().iter().map(|v| v.pointer.as_str()).collect();
        assert!(
            pointers.contains(&"/job/interface/outputs/files/0"),
            "{:?}",
            pointers
        );
        assert!(pointers.contains(&"/job/name"), "{:?}", pointers);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicate_names_within_a_category_are_rejected() {
        let mut manifest = sample_manifest();
        manifest["job"]["interface"]["inputs"]["json"][0]["name"] = json!("INPUT_FILE");
        manifest["job"]["interface"]["settings"] =
            json!([{ "name": "DB_HOST" }, { "name": "DB_HOST" }]);
        let violations = check_unique_names(&manifest);
        let pointers: Vec<&str> = violations.iter().map(|v| v.pointer.as_str()).collect();
        assert_eq!(
            pointers,
            vec!["/job/interface/inputs/json/0/name", "/job/interface/settings/1/name"]
        );
    }

    #[test]
    fn same_name_across_categories_is_fine() {
        let mut manifest = sample_manifest();
        manifest["job"]["interface"]["outputs"]["files"][0]["name"] = json!("INPUT_FILE");
        assert!(check_unique_names(&manifest).is_empty());
    }

    #[test]
    fn schema_override_applies() {
        let dir = temp_dir("override");
        write_manifest(&dir, MANIFEST_FILE_NAME, &sample_manifest());
        let schema_path = dir.join("strict.schema.json");
        fs::write(
            &schema_path,
            r#"{ "type": "object", "required": ["seedVersion", "job", "extra"] }"#,
        )
        .expect("write schema");
        let err = load_manifest(&dir.join(MANIFEST_FILE_NAME), Some(&schema_path))
            .expect_err("override requires extra");
        assert!(matches!(err, SeedError::InvalidManifest { .. }), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn broken_schema_override_fails_before_reading_manifest() {
        let dir = temp_dir("broken_override");
        let schema_path = dir.join("broken.schema.json");
        fs::write(&schema_path, "not json").expect("write schema");
        let err = load_manifest(&dir, Some(&schema_path)).expect_err("schema load");
        assert!(matches!(err, SeedError::SchemaLoad(_)), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }
}
