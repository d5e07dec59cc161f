use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use seed_core::version::{ALGORITHM_VERSION_FIELD, PACKAGE_VERSION_FIELD};
use seed_core::{ImageReference, SeedError, VersionBump, VersionBumps};
use seed_registry::{registry_endpoint, Credentials, HttpRegistry, RegistryConfig};
use seed_runner::{BindingRequest, DockerCli, EngineConfig, PublishOptions, RunOptions};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "seed",
    version,
    about = "Build, run and publish seed-compliant algorithm images"
)]
struct Cli {
    /// Debug logging (overridden by SEED_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the manifest and build the image.
    Build {
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write an example manifest.
    Init {
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Run an image with bound inputs and check its outputs.
    Run {
        #[arg(short = 'n', long = "image")]
        image: Option<String>,
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        #[arg(short = 'i', long = "input", value_name = "NAME=PATH")]
        inputs: Vec<String>,
        #[arg(short = 'j', long = "json-input", value_name = "NAME=VALUE")]
        json_inputs: Vec<String>,
        #[arg(short = 'e', long = "setting", value_name = "NAME=VALUE")]
        settings: Vec<String>,
        #[arg(short = 'm', long = "mount", value_name = "NAME=PATH")]
        mounts: Vec<String>,
        #[arg(short = 'o', long = "outdir")]
        output_dir: Option<PathBuf>,
        /// Side-car metadata schema replacing the built-in one.
        #[arg(short = 's', long)]
        schema: Option<PathBuf>,
        #[arg(long)]
        rm: bool,
        /// Fail on bindings the manifest does not declare.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// List local seed images.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Search a registry for seed images.
    Search {
        #[arg(short = 'r', long)]
        registry: Option<String>,
        #[arg(short = 'o', long)]
        org: Option<String>,
        #[arg(short = 'f', long)]
        filter: Option<String>,
        #[arg(short = 'u', long)]
        username: Option<String>,
        #[arg(short = 'p', long)]
        password: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Publish an image, refusing to overwrite an existing tag.
    Publish {
        /// Local image; defaults to the one named by the manifest.
        image: Option<String>,
        #[arg(short = 'r', long)]
        registry: Option<String>,
        #[arg(short = 'o', long)]
        org: Option<String>,
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        /// Manifest schema replacing the built-in one.
        #[arg(short = 's', long)]
        schema: Option<PathBuf>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        pkg_minor: bool,
        #[arg(long)]
        pkg_major: bool,
        #[arg(long)]
        alg_minor: bool,
        #[arg(long)]
        alg_major: bool,
        #[arg(short = 'u', long)]
        username: Option<String>,
        #[arg(short = 'p', long)]
        password: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Pull an image from a registry.
    Pull {
        #[arg(short = 'n', long = "image")]
        image: String,
        #[arg(short = 'r', long)]
        registry: Option<String>,
        #[arg(short = 'o', long)]
        org: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check a manifest against the schema.
    Validate {
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        #[arg(short = 's', long)]
        schema: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SEED_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(verbose, "logging initialised");
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Build { directory, json } => {
            let docker = DockerCli::new(EngineConfig::from_env());
            let report = seed_runner::build(&directory, &docker)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build",
                    "build": report
                })));
            }
            println!("image: {}", report.image);
            println!("manifest: {}", report.manifest.display());
        }
        Commands::Init { directory, force } => {
            let loaded = seed_runner::init(&directory, force)?;
            println!("manifest: {}", loaded.path.display());
            println!("image: {}", loaded.manifest.image());
        }
        Commands::Run {
            image,
            directory,
            inputs,
            json_inputs,
            settings,
            mounts,
            output_dir,
            schema,
            rm,
            strict,
            json,
        } => {
            let docker = DockerCli::new(EngineConfig::from_env());
            let requested = image.as_deref().map(ImageReference::parse);
            let (manifest, image) =
                seed_runner::resolve_run_manifest(&docker, requested.as_ref(), &directory)?;
            let options = RunOptions {
                binding: BindingRequest {
                    inputs,
                    json_inputs,
                    settings,
                    mounts,
                    output_dir,
                    strict,
                    remove_container: rm,
                },
                metadata_schema: schema,
            };
            let report = seed_runner::run(&manifest, image, &options, &docker)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.succeeded(),
                    "command": "run",
                    "run": report
                })));
            }
            println!("image: {}", report.image);
            println!("output_dir: {}", report.output_dir.display());
            match report.exit_code {
                Some(code) => println!("exit_code: {}", code),
                None => println!("exit_code: killed"),
            }
            if let Some(error) = &report.error {
                println!(
                    "error: {} ({})",
                    error.name,
                    error.title.as_deref().unwrap_or("no title")
                );
            }
            for output in &report.outputs.files {
                for file in &output.files {
                    println!("output {}: {}", output.name, file.display());
                }
            }
            for (name, value) in &report.outputs.json {
                println!("output {}: {}", name, value);
            }
            println!("elapsed_ms: {}", report.elapsed_ms);
            if !report.exit_ok() {
                let label = report
                    .error
                    .as_ref()
                    .map(|e| format!(" ({})", e.name))
                    .unwrap_or_default();
                let code = report
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                if !report.outputs.is_valid() {
                    eprintln!(
                        "{}",
                        SeedError::OutputValidation {
                            dir: report.outputs.dir.clone(),
                            violations: report.outputs.violations.clone(),
                        }
                    );
                }
                return Err(anyhow!("job exited with code {}{}", code, label));
            }
            report.outputs.into_result()?;
        }
        Commands::List { json } => {
            let docker = DockerCli::new(EngineConfig::from_env());
            let images = seed_runner::list(&docker)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "images": images
                })));
            }
            for image in images {
                println!("{}", image);
            }
        }
        Commands::Search {
            registry,
            org,
            filter,
            username,
            password,
            json,
        } => {
            let config = registry_config(registry, username, password)?;
            let client = HttpRegistry::new(&config)?;
            let repositories =
                seed_runner::search(&client, org.as_deref(), filter.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "search",
                    "registry": client.endpoint().host,
                    "repositories": repositories
                })));
            }
            for repository in repositories {
                println!("{}", repository);
            }
        }
        Commands::Publish {
            image,
            registry,
            org,
            directory,
            schema,
            force,
            pkg_minor,
            pkg_major,
            alg_minor,
            alg_major,
            username,
            password,
            json,
        } => {
            let config = registry_config(registry, username, password)?;
            let client = HttpRegistry::new(&config)?;
            let docker = DockerCli::new(EngineConfig::from_env());
            let options = PublishOptions {
                directory,
                image: image.as_deref().map(ImageReference::parse),
                org,
                schema,
                force,
                bumps: VersionBumps {
                    package: VersionBump::from_flags(PACKAGE_VERSION_FIELD, pkg_minor, pkg_major),
                    algorithm: VersionBump::from_flags(
                        ALGORITHM_VERSION_FIELD,
                        alg_minor,
                        alg_major,
                    ),
                },
                credentials: config.credentials.clone(),
            };
            let outcome = seed_runner::publish(&options, &client, &docker, &docker)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "publish",
                    "publish": outcome
                })));
            }
            println!("image: {}", outcome.remote);
            println!("registry: {}", outcome.registry);
            println!("rebuilt: {}", outcome.rebuilt);
        }
        Commands::Pull {
            image,
            registry,
            org,
            json,
        } => {
            let docker = DockerCli::new(EngineConfig::from_env());
            let host = registry.as_deref().map(|r| registry_endpoint(r).host);
            let report = seed_runner::pull(
                &docker,
                &ImageReference::parse(&image),
                host.as_deref(),
                org.as_deref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "pull",
                    "pull": report
                })));
            }
            println!("remote: {}", report.remote);
            println!("local: {}", report.local);
        }
        Commands::Validate {
            directory,
            schema,
            json,
        } => {
            let report = seed_runner::validate(&directory, schema.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "validate": report
                })));
            }
            println!("manifest: {}", report.manifest.display());
            println!("schema: {}", report.schema);
            println!("image: {}", report.image);
            println!("valid: true");
        }
        Commands::Version => {
            println!("seed: {}", env!("CARGO_PKG_VERSION"));
            println!("seed_spec: {}", seed_core::SEED_SPEC_VERSION);
        }
    }
    Ok(None)
}

fn registry_config(
    registry: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<RegistryConfig> {
    let mut config = RegistryConfig::default();
    if let Some(registry) = registry.filter(|r| !r.is_empty()) {
        config.registry = registry;
    }
    config.credentials = Credentials::from_parts(username, password);
    if let Ok(raw) = std::env::var("SEED_REGISTRY_TIMEOUT_SECS") {
        let secs: u64 = raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid SEED_REGISTRY_TIMEOUT_SECS '{}': expected seconds", raw))?;
        config.timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_payload(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<SeedError>() {
        Some(seed_err) => json_error(
            seed_err.code(),
            seed_err.to_string(),
            json!({ "violations": seed_err.violations() }),
        ),
        None => json_error("command_failed", err.to_string(), json!({})),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Build { json, .. }
        | Commands::Run { json, .. }
        | Commands::List { json }
        | Commands::Search { json, .. }
        | Commands::Publish { json, .. }
        | Commands::Pull { json, .. }
        | Commands::Validate { json, .. } => *json,
        Commands::Init { .. } | Commands::Version => false,
    }
}
