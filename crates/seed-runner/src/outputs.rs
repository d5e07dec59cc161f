//! Checks what a job left in its output directory against the declared
//! outputs.

use seed_core::manifest::Interface;
use seed_core::{Result, SeedError, Violation};
use seed_schemas::SchemaValidator;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const OUTPUTS_JSON_FILE: &str = "seed.outputs.json";
pub const METADATA_SUFFIX: &str = ".metadata.json";

#[derive(Debug, Clone, Serialize)]
pub struct MatchedOutput {
    pub name: String,
    pub pattern: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputReport {
    pub dir: PathBuf,
    pub files: Vec<MatchedOutput>,
    /// Declared JSON outputs found in `seed.outputs.json`, by output name.
    pub json: Map<String, Value>,
    pub metadata_checked: usize,
    pub violations: Vec<Violation>,
}

impl OutputReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(SeedError::OutputValidation {
                dir: self.dir,
                violations: self.violations,
            })
        }
    }
}

/// Glob match where `*` and `?` never cross a `/`.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = path.chars().collect();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' && s[si] != '/' || p[pi] == s[si] && p[pi] != '*') {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            if s[matched] == '/' {
                return false;
            }
            pi = star + 1;
            si = matched + 1;
            backtrack = Some((star, si));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

fn json_pointer_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Paths of produced files relative to `dir`, with `/` separators. Side-car
/// metadata and `seed.outputs.json` are not outputs in their own right.
fn produced_files(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut files: Vec<(String, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(dir).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            Some((rel, entry.into_path()))
        })
        .filter(|(rel, _)| rel != OUTPUTS_JSON_FILE && !rel.ends_with(METADATA_SUFFIX))
        .collect();
    files.sort();
    files
}

/// Collect every violation in `outdir`. Never fails on bad output; only I/O
/// on the directory itself is an error.
pub fn check_outputs(
    interface: &Interface,
    outdir: &Path,
    metadata_schema: &SchemaValidator,
) -> Result<OutputReport> {
    if !outdir.is_dir() {
        return Err(SeedError::io(
            format!("read {}", outdir.display()),
            std::io::Error::new(std::io::ErrorKind::NotFound, "output directory missing"),
        ));
    }
    let produced = produced_files(outdir);
    let mut violations = Vec::new();
    let mut matched = Vec::new();
    let mut metadata_checked = 0;

    for (idx, decl) in interface.outputs.files.iter().enumerate() {
        let pointer = format!("/job/interface/outputs/files/{}", idx);
        let files: Vec<&(String, PathBuf)> = produced
            .iter()
            .filter(|(rel, _)| glob_match(&decl.pattern, rel))
            .collect();
        if decl.required && files.is_empty() {
            violations.push(Violation::new(
                pointer.clone(),
                "required",
                format!("output {} matched no file for pattern '{}'", decl.name, decl.pattern),
                Value::Array(Vec::new()),
            ));
        }
        if !decl.multiple && files.len() > 1 {
            violations.push(Violation::new(
                pointer.clone(),
                "multiple",
                format!(
                    "output {} matched {} files for pattern '{}' but allows one",
                    decl.name,
                    files.len(),
                    decl.pattern
                ),
                Value::Array(files.iter().map(|(rel, _)| Value::String(rel.clone())).collect()),
            ));
        }
        for (rel, path) in &files {
            if check_metadata(rel, path, metadata_schema, &mut violations)? {
                metadata_checked += 1;
            }
        }
        matched.push(MatchedOutput {
            name: decl.name.clone(),
            pattern: decl.pattern.clone(),
            files: files.into_iter().map(|(_, path)| path.clone()).collect(),
        });
    }

    let json = check_json_outputs(interface, outdir, &mut violations)?;

    debug!(
        dir = %outdir.display(),
        files = produced.len(),
        violations = violations.len(),
        "checked outputs"
    );
    Ok(OutputReport {
        dir: outdir.to_path_buf(),
        files: matched,
        json,
        metadata_checked,
        violations,
    })
}

/// `check_outputs`, failing with `OutputValidation` on any violation.
pub fn validate_outputs(
    interface: &Interface,
    outdir: &Path,
    metadata_schema: &SchemaValidator,
) -> Result<OutputReport> {
    check_outputs(interface, outdir, metadata_schema)?.into_result()
}

/// Validate `<file>.metadata.json` when it exists. Returns whether one was
/// found.
fn check_metadata(
    rel: &str,
    path: &Path,
    schema: &SchemaValidator,
    violations: &mut Vec<Violation>,
) -> Result<bool> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(METADATA_SUFFIX);
    let sidecar = PathBuf::from(sidecar);
    if !sidecar.is_file() {
        return Ok(false);
    }
    let label = format!("{}{}", rel, METADATA_SUFFIX);
    let bytes = fs::read(&sidecar)
        .map_err(|e| SeedError::io(format!("read {}", sidecar.display()), e))?;
    let document: Value = match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            violations.push(Violation::new(
                "",
                "json",
                format!("{}: not valid JSON: {}", label, e),
                Value::Null,
            ));
            return Ok(true);
        }
    };
    if let Err(found) = schema.validate(&document) {
        violations.extend(found.into_iter().map(|v| Violation {
            message: format!("{}: {}", label, v.message),
            ..v
        }));
    }
    Ok(true)
}

fn check_json_outputs(
    interface: &Interface,
    outdir: &Path,
    violations: &mut Vec<Violation>,
) -> Result<Map<String, Value>> {
    let mut found = Map::new();
    let declared = &interface.outputs.json;
    if declared.is_empty() {
        return Ok(found);
    }
    let path = outdir.join(OUTPUTS_JSON_FILE);
    let document = if path.is_file() {
        let bytes =
            fs::read(&path).map_err(|e| SeedError::io(format!("read {}", path.display()), e))?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                violations.push(Violation::new(
                    "",
                    "type",
                    format!("{} must contain a JSON object", OUTPUTS_JSON_FILE),
                    other,
                ));
                return Ok(found);
            }
            Err(e) => {
                violations.push(Violation::new(
                    "",
                    "json",
                    format!("{} is not valid JSON: {}", OUTPUTS_JSON_FILE, e),
                    Value::Null,
                ));
                return Ok(found);
            }
        }
    } else {
        Map::new()
    };

    for decl in declared {
        let key = decl.lookup_key();
        let pointer = format!("/{}", json_pointer_token(key));
        match document.get(key) {
            Some(value) if decl.value_type.matches(value) => {
                found.insert(decl.name.clone(), value.clone());
            }
            Some(value) => violations.push(Violation::new(
                pointer,
                "type",
                format!(
                    "output {} ({}) must be {}",
                    decl.name,
                    key,
                    decl.value_type.as_str()
                ),
                value.clone(),
            )),
            None if decl.required => violations.push(Violation::new(
                pointer,
                "required",
                format!("output {} ({}) missing from {}", decl.name, key, OUTPUTS_JSON_FILE),
                Value::Null,
            )),
            None => {}
        }
    }
    Ok(found)
}
