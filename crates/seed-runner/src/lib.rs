//! Command-level operations behind the `seed` CLI.

pub mod binding;
pub mod engine;
pub mod outputs;
pub mod publish;

pub use binding::{bind, BindingRequest, RunBinding};
pub use engine::{
    ContainerRunner, DockerCli, EngineConfig, ImageBuilder, ImagePublisher, RunStatus,
    MANIFEST_LABEL,
};
pub use outputs::{check_outputs, validate_outputs, OutputReport};
pub use publish::{publish, PublishOptions, PublishOutcome, PublishState};

use chrono::{DateTime, Utc};
use seed_core::fs::{atomic_write_json_pretty, ensure_dir};
use seed_core::manifest::{
    locate_manifest, parse_manifest, ErrorMapping, LoadedManifest, Manifest, MANIFEST_FILE_NAME,
};
use seed_core::{load_manifest, ImageReference, Result, SeedError};
use seed_registry::RepositoryCatalog;
use seed_schemas::{SchemaValidator, MANIFEST_SCHEMA, METADATA_SCHEMA};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ValidateReport {
    pub manifest: PathBuf,
    pub schema: String,
    pub job: String,
    pub image: ImageReference,
}

pub fn validate(dir: &Path, schema_override: Option<&Path>) -> Result<ValidateReport> {
    let validator = SchemaValidator::resolve(schema_override, MANIFEST_SCHEMA)?;
    let loaded = seed_core::manifest::load_manifest_with(dir, &validator)?;
    Ok(ValidateReport {
        schema: validator.origin().to_string(),
        job: loaded.manifest.job.name.clone(),
        image: loaded.manifest.image(),
        manifest: loaded.path,
    })
}

fn example_manifest() -> Value {
    json!({
        "seedVersion": seed_core::SEED_SPEC_VERSION,
        "job": {
            "name": "my-algorithm",
            "algorithmVersion": "0.1.0",
            "packageVersion": "0.1.0",
            "title": "My algorithm",
            "description": "Reads one input file and writes a single result",
            "tags": ["example"],
            "maintainer": { "name": "Jane Doe", "email": "jane.doe@example.com" },
            "timeout": 3600,
            "interface": {
                "command": "${INPUT_FILE} ${OUTPUT_DIR}",
                "inputs": {
                    "files": [{ "name": "INPUT_FILE", "mediaTypes": ["image/tiff"] }],
                    "json": [{ "name": "THRESHOLD", "type": "number", "required": false }]
                },
                "outputs": {
                    "files": [{ "name": "RESULT", "pattern": "*.tif", "mediaType": "image/tiff" }],
                    "json": [{ "name": "COUNT", "key": "count", "type": "integer" }]
                }
            },
            "resources": {
                "scalar": [{ "name": "cpus", "value": 1.0 }, { "name": "mem", "value": 512.0 }]
            },
            "errors": [{
                "code": 1,
                "name": "bad-input",
                "title": "Unreadable input",
                "category": "data"
            }]
        }
    })
}

/// Write an example manifest into `dir` and validate it. An existing
/// manifest is only replaced with `force`.
pub fn init(dir: &Path, force: bool) -> Result<LoadedManifest> {
    let target = dir.join(MANIFEST_FILE_NAME);
    let existing = match locate_manifest(dir) {
        Ok(path) => vec![path],
        Err(SeedError::AmbiguousManifest { candidates, .. }) => candidates,
        Err(SeedError::ManifestNotFound { .. }) => Vec::new(),
        Err(other) => return Err(other),
    };
    if !existing.is_empty() && !force {
        let names: Vec<String> = existing.iter().map(|p| p.display().to_string()).collect();
        return Err(SeedError::io(
            format!("init {}", dir.display()),
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists; pass --force to overwrite", names.join(", ")),
            ),
        ));
    }
    for path in existing.iter().filter(|p| **p != target) {
        warn!(existing = %path.display(), "removing legacy manifest");
        std::fs::remove_file(path)
            .map_err(|e| SeedError::io(format!("remove {}", path.display()), e))?;
    }
    ensure_dir(dir)?;
    atomic_write_json_pretty(&target, &example_manifest())?;
    info!(path = %target.display(), "wrote example manifest");
    load_manifest(dir, None)
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub image: ImageReference,
    pub manifest: PathBuf,
}

/// Validate the manifest in `dir`, then build its image with the manifest
/// embedded as a label.
pub fn build(dir: &Path, builder: &dyn ImageBuilder) -> Result<BuildReport> {
    let loaded = load_manifest(dir, None)?;
    let image = loaded.manifest.image();
    let context = loaded.path.parent().unwrap_or(dir);
    builder.build_image(context, &image, &publish::build_labels(&loaded)?)?;
    Ok(BuildReport {
        image,
        manifest: loaded.path,
    })
}

/// The manifest to run with: the one embedded in `image` when it carries a
/// label, otherwise the one in `dir`.
pub fn resolve_run_manifest(
    docker: &DockerCli,
    image: Option<&ImageReference>,
    dir: &Path,
) -> Result<(Manifest, ImageReference)> {
    if let Some(image) = image {
        if let Some(label) = docker.image_manifest(image)? {
            let validator = SchemaValidator::resolve(None, MANIFEST_SCHEMA)?;
            let origin = PathBuf::from(format!("{} label {}", image, MANIFEST_LABEL));
            let manifest = parse_manifest(&origin, &label, &validator)?;
            return Ok((manifest, image.clone()));
        }
        warn!(image = %image, "image has no manifest label; reading manifest from directory");
        let loaded = load_manifest(dir, None)?;
        return Ok((loaded.manifest, image.clone()));
    }
    let loaded = load_manifest(dir, None)?;
    let image = loaded.manifest.image();
    Ok((loaded.manifest, image))
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub binding: BindingRequest,
    /// Replaces the built-in side-car metadata schema.
    pub metadata_schema: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub image: ImageReference,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub exit_code: Option<i32>,
    /// Declared error matching a non-zero exit code.
    pub error: Option<ErrorMapping>,
    pub output_dir: PathBuf,
    pub outputs: OutputReport,
    pub warnings: Vec<String>,
    pub args: Vec<String>,
}

impl RunReport {
    pub fn exit_ok(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn succeeded(&self) -> bool {
        self.exit_ok() && self.outputs.is_valid()
    }
}

/// Bind, run under the job timeout, then check outputs. The container's
/// exit status and the output check are both reported; neither masks the
/// other.
pub fn run(
    manifest: &Manifest,
    image: ImageReference,
    options: &RunOptions,
    runner: &dyn ContainerRunner,
) -> Result<RunReport> {
    let metadata_schema =
        SchemaValidator::resolve(options.metadata_schema.as_deref(), METADATA_SCHEMA)?;
    let job = &manifest.job;
    let binding = bind(job, image, &options.binding)?;
    let args = binding.redacted_args();
    info!(image = %binding.image, timeout = job.timeout, "starting container");

    let started_at = Utc::now();
    let status = runner.run_container(
        &binding.container_name,
        &binding.docker_args(),
        Duration::from_secs(job.timeout),
    )?;
    let finished_at = Utc::now();

    let error = match status.exit_code {
        Some(0) => None,
        Some(code) => job.error_for_code(code).cloned(),
        None => None,
    };
    if !status.success() {
        warn!(
            exit_code = ?status.exit_code,
            error = error.as_ref().map(|e| e.name.as_str()),
            "container exited unsuccessfully"
        );
    }
    let outputs = check_outputs(&job.interface, &binding.output_dir, &metadata_schema)?;

    Ok(RunReport {
        image: binding.image,
        started_at,
        finished_at,
        elapsed_ms: status.elapsed.as_millis(),
        exit_code: status.exit_code,
        error,
        output_dir: binding.output_dir,
        outputs,
        warnings: binding.warnings,
        args,
    })
}

/// Local images following the seed naming convention.
pub fn list(docker: &DockerCli) -> Result<Vec<ImageReference>> {
    Ok(docker
        .list_images()?
        .into_iter()
        .filter(ImageReference::is_seed)
        .collect())
}

/// Seed repositories in a registry catalog, optionally limited to one
/// organisation and to names containing `filter`.
pub fn search(
    catalog: &dyn RepositoryCatalog,
    org: Option<&str>,
    filter: Option<&str>,
) -> Result<Vec<String>> {
    let org_prefix = org.filter(|o| !o.is_empty()).map(|o| format!("{}/", o));
    Ok(catalog
        .list_repositories()?
        .into_iter()
        .filter(|repo| {
            let short = repo.rsplit('/').next().unwrap_or(repo);
            short.ends_with(seed_core::image::SEED_REPOSITORY_SUFFIX)
                && org_prefix.as_deref().map_or(true, |p| repo.starts_with(p))
                && filter.map_or(true, |f| short.contains(f))
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub remote: ImageReference,
    pub local: ImageReference,
}

/// Pull `image` from `registry`/`org` and tag it under its short local name.
pub fn pull(
    docker: &DockerCli,
    image: &ImageReference,
    registry: Option<&str>,
    org: Option<&str>,
) -> Result<PullReport> {
    let remote = image.qualified(registry, org);
    let local = image.qualified(None, None);
    docker.pull(&remote)?;
    if remote != local {
        docker.tag(&remote, &local)?;
    }
    info!(remote = %remote, local = %local, "pulled image");
    Ok(PullReport { remote, local })
}
