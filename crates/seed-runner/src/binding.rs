//! Binds command-line inputs, settings and mounts to a job interface and
//! turns the result into a `docker run` argument list.

use seed_core::fs::ensure_dir;
use seed_core::manifest::{Job, JsonType};
use seed_core::{ImageReference, Result, SeedError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONTAINER_INPUT_ROOT: &str = "/inputs";
pub const CONTAINER_OUTPUT_DIR: &str = "/outputs";
pub const OUTPUT_DIR_ENV: &str = "OUTPUT_DIR";

const MEMORY_RESOURCE: &str = "mem";
const REDACTED: &str = "*****";

/// Raw `NAME=value` pairs as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct BindingRequest {
    pub inputs: Vec<String>,
    pub json_inputs: Vec<String>,
    pub settings: Vec<String>,
    pub mounts: Vec<String>,
    /// Defaults to `output-<job>-<timestamp>` in the working directory.
    pub output_dir: Option<PathBuf>,
    pub strict: bool,
    pub remove_container: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Volume {
    fn arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything needed to start one container for a job.
#[derive(Debug, Clone, Serialize)]
pub struct RunBinding {
    pub image: ImageReference,
    /// Passed as `--name` so the container can be killed by name.
    pub container_name: String,
    pub volumes: Vec<Volume>,
    pub env: Vec<(String, String)>,
    #[serde(skip)]
    secrets: BTreeSet<String>,
    pub memory_mb: Option<u64>,
    pub output_dir: PathBuf,
    pub command: Vec<String>,
    pub warnings: Vec<String>,
    pub remove_container: bool,
}

impl RunBinding {
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn docker_args(&self) -> Vec<String> {
        self.render_args(false)
    }

    /// Same as `docker_args` with secret setting values masked, for logs.
    pub fn redacted_args(&self) -> Vec<String> {
        self.render_args(true)
    }

    fn render_args(&self, redact: bool) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if self.remove_container {
            args.push("--rm".to_string());
        }
        args.push("--name".to_string());
        args.push(self.container_name.clone());
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.arg());
        }
        for (name, value) in &self.env {
            let shown = if redact && self.secrets.contains(name) {
                REDACTED
            } else {
                value.as_str()
            };
            args.push("-e".to_string());
            args.push(format!("{}={}", name, shown));
        }
        if let Some(mb) = self.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", mb));
        }
        args.push(self.image.to_string());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Split `NAME=value` at the first `=`. Both halves must be non-empty.
pub fn parse_pair(kind: &str, raw: &str) -> Result<(String, String)> {
    let invalid = |reason: &str| SeedError::InvalidBinding {
        kind: kind.to_string(),
        raw: raw.to_string(),
        reason: reason.to_string(),
    };
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| invalid("expected NAME=value"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if value.is_empty() {
        return Err(invalid("value is empty"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_pairs(kind: &str, raws: &[String]) -> Result<Vec<(String, String)>> {
    raws.iter().map(|raw| parse_pair(kind, raw)).collect()
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Tracks names bound on the command line that the interface never
/// declared.
struct Unrecognized<'a> {
    strict: bool,
    warnings: &'a mut Vec<String>,
}

impl Unrecognized<'_> {
    fn check(&mut self, kind: &str, name: &str, declared: bool) -> Result<()> {
        if declared {
            return Ok(());
        }
        if self.strict {
            return Err(SeedError::UnrecognizedBinding {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        warn!(kind, name, "ignoring binding not declared by the job interface");
        self.warnings.push(format!(
            "{} '{}' is not declared in the manifest interface and was ignored",
            kind, name
        ));
        Ok(())
    }
}

fn require(kind: &str, name: &str, bound: bool) -> Result<()> {
    if bound {
        Ok(())
    } else {
        Err(SeedError::MissingRequiredInput {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

fn absolute_existing(kind: &str, raw: &str, path: &str) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| SeedError::InvalidBinding {
        kind: kind.to_string(),
        raw: raw.to_string(),
        reason: format!("cannot resolve {}: {}", path, e),
    })
}

/// Bind a request against `job`'s interface. Creates the output directory,
/// which must be new or empty.
pub fn bind(job: &Job, image: ImageReference, request: &BindingRequest) -> Result<RunBinding> {
    let interface = &job.interface;
    let mut warnings = Vec::new();
    let mut env: Vec<(String, String)> = Vec::new();
    let mut volumes = Vec::new();
    let mut secrets = BTreeSet::new();

    let inputs = parse_pairs("input", &request.inputs)?;
    let json_inputs = parse_pairs("json input", &request.json_inputs)?;
    let settings = parse_pairs("setting", &request.settings)?;
    let mounts = parse_pairs("mount", &request.mounts)?;

    {
        let mut unrecognized = Unrecognized {
            strict: request.strict,
            warnings: &mut warnings,
        };
        for (name, _) in &inputs {
            let declared = interface.inputs.files.iter().any(|f| &f.name == name);
            unrecognized.check("input", name, declared)?;
        }
        for (name, _) in &json_inputs {
            let declared = interface.inputs.json.iter().any(|j| &j.name == name);
            unrecognized.check("json input", name, declared)?;
        }
        for (name, _) in &settings {
            unrecognized.check("setting", name, interface.setting(name).is_some())?;
        }
        for (name, _) in &mounts {
            unrecognized.check("mount", name, interface.mount(name).is_some())?;
        }
    }

    let mut input_bytes: u64 = 0;
    for decl in &interface.inputs.files {
        let bound: Vec<&String> = inputs
            .iter()
            .filter(|(name, _)| name == &decl.name)
            .map(|(_, path)| path)
            .collect();
        require("input", &decl.name, !decl.required || !bound.is_empty())?;
        if bound.is_empty() {
            continue;
        }
        if !decl.multiple && bound.len() > 1 {
            return Err(SeedError::InvalidBinding {
                kind: "input".to_string(),
                raw: decl.name.clone(),
                reason: format!("bound {} times but does not accept multiple files", bound.len()),
            });
        }
        let container_dir = format!("{}/{}", CONTAINER_INPUT_ROOT, decl.name);
        let mut basenames = BTreeSet::new();
        let mut last_target = String::new();
        for path in bound {
            let raw = format!("{}={}", decl.name, path);
            let host = absolute_existing("input", &raw, path)?;
            if !host.is_file() {
                return Err(SeedError::InvalidBinding {
                    kind: "input".to_string(),
                    raw,
                    reason: "not a regular file".to_string(),
                });
            }
            let basename = host
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !basenames.insert(basename.clone()) {
                return Err(SeedError::InvalidBinding {
                    kind: "input".to_string(),
                    raw,
                    reason: format!("another file named '{}' is already bound", basename),
                });
            }
            input_bytes += fs::metadata(&host).map(|m| m.len()).unwrap_or(0);
            last_target = format!("{}/{}", container_dir, basename);
            volumes.push(Volume {
                host,
                container: last_target.clone(),
                read_only: true,
            });
        }
        let target = if decl.multiple { container_dir } else { last_target };
        env.push((decl.name.clone(), target));
    }

    for decl in &interface.inputs.json {
        let bound = json_inputs.iter().rev().find(|(name, _)| name == &decl.name);
        require("json input", &decl.name, !decl.required || bound.is_some())?;
        let Some((name, raw_value)) = bound else {
            continue;
        };
        // Unquoted text is taken as a string.
        let value = serde_json::from_str::<Value>(raw_value)
            .unwrap_or_else(|_| Value::String(raw_value.clone()));
        if !decl.value_type.matches(&value) {
            return Err(SeedError::InvalidBinding {
                kind: "json input".to_string(),
                raw: format!("{}={}", name, raw_value),
                reason: format!(
                    "expected {}, got {}",
                    decl.value_type.as_str(),
                    value_type_name(&value)
                ),
            });
        }
        let rendered = match (&value, decl.value_type) {
            (Value::String(s), JsonType::String) => s.clone(),
            _ => value.to_string(),
        };
        env.push((name.clone(), rendered));
    }

    for decl in &interface.settings {
        let bound = settings.iter().rev().find(|(name, _)| name == &decl.name);
        require("setting", &decl.name, bound.is_some())?;
        if let Some((name, value)) = bound {
            if decl.secret {
                secrets.insert(name.clone());
            }
            env.push((name.clone(), value.clone()));
        }
    }

    for decl in &interface.mounts {
        let bound = mounts.iter().rev().find(|(name, _)| name == &decl.name);
        require("mount", &decl.name, bound.is_some())?;
        if let Some((name, path)) = bound {
            let host = absolute_existing("mount", &format!("{}={}", name, path), path)?;
            volumes.push(Volume {
                host,
                container: decl.path.clone(),
                read_only: decl.mode == seed_core::manifest::MountMode::Ro,
            });
        }
    }

    let mut memory_mb = None;
    let input_mib = input_bytes as f64 / (1024.0 * 1024.0);
    for resource in &job.resources.scalar {
        let value = resource.value + resource.input_multiplier.unwrap_or(0.0) * input_mib;
        if resource.name == MEMORY_RESOURCE {
            memory_mb = Some(value.ceil().max(0.0) as u64);
        }
        env.push((
            format!("ALLOCATED_{}", resource.name.to_ascii_uppercase()),
            format_scalar(value),
        ));
    }

    let output_dir = match &request.output_dir {
        Some(dir) => dir.clone(),
        None => PathBuf::from(format!(
            "output-{}-{}",
            job.name,
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        )),
    };
    let output_dir = prepare_output_dir(&output_dir)?;
    volumes.push(Volume {
        host: output_dir.clone(),
        container: CONTAINER_OUTPUT_DIR.to_string(),
        read_only: false,
    });
    env.push((OUTPUT_DIR_ENV.to_string(), CONTAINER_OUTPUT_DIR.to_string()));

    let command = interface
        .command
        .as_deref()
        .map(|template| expand_command(template, &env))
        .unwrap_or_default();

    debug!(
        job = %job.name,
        volumes = volumes.len(),
        env = env.len(),
        "bound run inputs"
    );
    Ok(RunBinding {
        image,
        container_name: container_name(&job.name),
        volumes,
        env,
        secrets,
        memory_mb,
        output_dir,
        command,
        warnings,
        remove_container: request.remove_container,
    })
}

/// Unique per invocation: job name, pid and a microsecond timestamp.
fn container_name(job: &str) -> String {
    let job: String = job
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!(
        "seed-{}-{}-{}",
        job,
        std::process::id(),
        chrono::Utc::now().timestamp_micros()
    )
}

fn format_scalar(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Create `dir` if needed and return its absolute path. An existing
/// directory with content is refused so earlier results are never mixed
/// into a new run.
pub fn prepare_output_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() {
        let mut entries = fs::read_dir(dir)
            .map_err(|e| SeedError::io(format!("read {}", dir.display()), e))?;
        if entries.next().is_some() {
            return Err(SeedError::InvalidBinding {
                kind: "output directory".to_string(),
                raw: dir.display().to_string(),
                reason: "directory is not empty".to_string(),
            });
        }
    } else {
        ensure_dir(dir)?;
    }
    fs::canonicalize(dir).map_err(|e| SeedError::io(format!("resolve {}", dir.display()), e))
}

/// Split `template` on whitespace and expand `${VAR}` and `$VAR` in each
/// word from `env`. Unknown variables expand to nothing; words that end up
/// empty are dropped.
pub fn expand_command(template: &str, env: &[(String, String)]) -> Vec<String> {
    let lookup: BTreeMap<&str, &str> = env
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    template
        .split_whitespace()
        .map(|word| expand_word(word, &lookup))
        .filter(|word| !word.is_empty())
        .collect()
}

fn expand_word(word: &str, env: &BTreeMap<&str, &str>) -> String {
    let mut out = String::with_capacity(word.len());
    let mut rest = word;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        match env.get(name) {
            Some(value) => out.push_str(value),
            None => warn!(variable = name, "command references an unset variable"),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use seed_core::manifest::Manifest;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "seed_runner_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    fn job() -> Job {
        Manifest::from_value(json!({
            "seedVersion": "1.0.0",
            "job": {
                "name": "foo",
                "algorithmVersion": "1.0.0",
                "packageVersion": "1.0.0",
                "title": "Foo",
                "maintainer": { "name": "Jane", "email": "jane@example.com" },
                "timeout": 30,
                "interface": {
                    "command": "run.sh ${INPUT_FILE} -t $THRESHOLD ${OUTPUT_DIR}",
                    "inputs": {
                        "files": [
                            { "name": "INPUT_FILE" },
                            { "name": "EXTRA", "required": false, "multiple": true }
                        ],
                        "json": [{ "name": "THRESHOLD", "type": "number", "required": false }]
                    },
                    "mounts": [{ "name": "REFERENCE", "path": "/ref" }],
                    "settings": [{ "name": "API_KEY", "secret": true }]
                },
                "resources": { "scalar": [{ "name": "mem", "value": 512.0 }, { "name": "cpus", "value": 1.5 }] }
            }
        }))
        .expect("manifest")
        .job
    }

    struct Fixture {
        root: PathBuf,
        request: BindingRequest,
    }

    fn fixture(tag: &str) -> Fixture {
        let root = temp_dir(tag);
        fs::write(root.join("image.tif"), b"data").expect("input");
        ensure_dir(&root.join("ref")).expect("mount dir");
        let request = BindingRequest {
            inputs: vec![format!("INPUT_FILE={}", root.join("image.tif").display())],
            json_inputs: vec![],
            settings: vec!["API_KEY=hunter2".to_string()],
            mounts: vec![format!("REFERENCE={}", root.join("ref").display())],
            output_dir: Some(root.join("out")),
            strict: false,
            remove_container: true,
        };
        Fixture { root, request }
    }

    fn image() -> ImageReference {
        ImageReference::new("foo-1.0.0-seed", "1.0.0")
    }

    #[test]
    fn binds_inputs_settings_mounts_and_outputs() {
        let mut fx = fixture("bind_ok");
        fx.request.json_inputs = vec!["THRESHOLD=0.5".to_string()];
        let binding = bind(&job(), image(), &fx.request).expect("bind");

        assert_eq!(binding.env_value("INPUT_FILE"), Some("/inputs/INPUT_FILE/image.tif"));
        assert_eq!(binding.env_value("THRESHOLD"), Some("0.5"));
        assert_eq!(binding.env_value("API_KEY"), Some("hunter2"));
        assert_eq!(binding.env_value("OUTPUT_DIR"), Some("/outputs"));
        assert_eq!(binding.env_value("ALLOCATED_MEM"), Some("512"));
        assert_eq!(binding.env_value("ALLOCATED_CPUS"), Some("1.5"));
        assert_eq!(binding.memory_mb, Some(512));
        assert_eq!(
            binding.command,
            vec!["run.sh", "/inputs/INPUT_FILE/image.tif", "-t", "0.5", "/outputs"]
        );
        assert!(binding.output_dir.is_dir());
        assert!(binding.warnings.is_empty());

        let args = binding.docker_args();
        assert_eq!(&args[..2], &["run".to_string(), "--rm".to_string()]);
        assert_eq!(args[2], "--name");
        assert_eq!(args[3], binding.container_name);
        assert!(binding.container_name.starts_with("seed-foo-"));
        assert!(args.iter().any(|a| a.ends_with(":/inputs/INPUT_FILE/image.tif:ro")));
        assert!(args.iter().any(|a| a.ends_with(":/ref:ro")));
        assert!(args.iter().any(|a| a.ends_with(":/outputs:rw")));
        assert!(args.contains(&"API_KEY=hunter2".to_string()));
        let image_pos = args
            .iter()
            .position(|a| a == "foo-1.0.0-seed:1.0.0")
            .expect("image arg");
        assert_eq!(args[image_pos + 1], "run.sh");

        let redacted = binding.redacted_args();
        assert!(redacted.contains(&"API_KEY=*****".to_string()));
        assert!(!redacted.iter().any(|a| a.contains("hunter2")));
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn missing_required_input_is_named() {
        let mut fx = fixture("bind_missing");
        fx.request.inputs.clear();
        let err = bind(&job(), image(), &fx.request).expect_err("missing input");
        match err {
            SeedError::MissingRequiredInput { kind, name } => {
                assert_eq!(kind, "input");
                assert_eq!(name, "INPUT_FILE");
            }
            other => panic!("expected missing input, got {}", other),
        }
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn settings_and_mounts_are_always_required() {
        let mut fx = fixture("bind_setting");
        fx.request.settings.clear();
        let err = bind(&job(), image(), &fx.request).expect_err("missing setting");
        assert!(
            matches!(err, SeedError::MissingRequiredInput { ref kind, .. } if kind == "setting"),
            "{}",
            err
        );

        let mut fx2 = fixture("bind_mount");
        fx2.request.mounts.clear();
        let err = bind(&job(), image(), &fx2.request).expect_err("missing mount");
        assert!(
            matches!(err, SeedError::MissingRequiredInput { ref kind, .. } if kind == "mount"),
            "{}",
            err
        );
        let _ = fs::remove_dir_all(fx.root);
        let _ = fs::remove_dir_all(fx2.root);
    }

    #[test]
    fn unknown_names_warn_unless_strict() {
        let mut fx = fixture("bind_unknown");
        fx.request.settings.push("NOT_DECLARED=1".to_string());
        let binding = bind(&job(), image(), &fx.request).expect("lenient bind");
        assert_eq!(binding.warnings.len(), 1);
        assert!(binding.env_value("NOT_DECLARED").is_none());

        let mut strict = fixture("bind_strict");
        strict.request.settings.push("NOT_DECLARED=1".to_string());
        strict.request.strict = true;
        let err = bind(&job(), image(), &strict.request).expect_err("strict bind");
        assert!(matches!(err, SeedError::UnrecognizedBinding { .. }), "{}", err);
        let _ = fs::remove_dir_all(fx.root);
        let _ = fs::remove_dir_all(strict.root);
    }

    #[test]
    fn json_input_type_is_checked() {
        let mut fx = fixture("bind_json");
        fx.request.json_inputs = vec!["THRESHOLD=high".to_string()];
        let err = bind(&job(), image(), &fx.request).expect_err("type mismatch");
        match err {
            SeedError::InvalidBinding { reason, .. } => {
                assert_eq!(reason, "expected number, got string")
            }
            other => panic!("expected invalid binding, got {}", other),
        }
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn single_file_input_rejects_multiple_bindings() {
        let mut fx = fixture("bind_single");
        fs::write(fx.root.join("second.tif"), b"more").expect("second input");
        fx.request
            .inputs
            .push(format!("INPUT_FILE={}", fx.root.join("second.tif").display()));
        let err = bind(&job(), image(), &fx.request).expect_err("single input");
        assert!(matches!(err, SeedError::InvalidBinding { .. }), "{}", err);
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn multiple_input_env_points_at_directory() {
        let mut fx = fixture("bind_multi");
        fs::write(fx.root.join("a.dat"), b"a").expect("a");
        fs::write(fx.root.join("b.dat"), b"b").expect("b");
        fx.request.inputs.push(format!("EXTRA={}", fx.root.join("a.dat").display()));
        fx.request.inputs.push(format!("EXTRA={}", fx.root.join("b.dat").display()));
        let binding = bind(&job(), image(), &fx.request).expect("bind");
        assert_eq!(binding.env_value("EXTRA"), Some("/inputs/EXTRA"));
        let targets: Vec<&str> = binding
            .volumes
            .iter()
            .map(|v| v.container.as_str())
            .filter(|c| c.starts_with("/inputs/EXTRA/"))
            .collect();
        assert_eq!(targets, vec!["/inputs/EXTRA/a.dat", "/inputs/EXTRA/b.dat"]);
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn non_empty_output_dir_is_refused() {
        let fx = fixture("bind_outdir");
        let out = fx.request.output_dir.clone().expect("outdir");
        ensure_dir(&out).expect("outdir");
        fs::write(out.join("stale.txt"), b"old").expect("stale");
        let err = bind(&job(), image(), &fx.request).expect_err("non-empty outdir");
        assert!(matches!(err, SeedError::InvalidBinding { .. }), "{}", err);
        let _ = fs::remove_dir_all(fx.root);
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_pair("input", "NOEQUALS").is_err());
        assert!(parse_pair("input", "=value").is_err());
        assert!(parse_pair("input", "NAME=").is_err());
        assert_eq!(
            parse_pair("setting", "URL=http://x/?a=b").expect("pair"),
            ("URL".to_string(), "http://x/?a=b".to_string())
        );
    }

    #[test]
    fn command_expansion_handles_both_forms() {
        let env = vec![
            ("A".to_string(), "/inputs/A/x".to_string()),
            ("OUT".to_string(), "/outputs".to_string()),
        ];
        assert_eq!(
            expand_command("prog --in=${A} $OUT/result $MISSING cost$", &env),
            vec!["prog", "--in=/inputs/A/x", "/outputs/result", "cost$"]
        );
    }
}
