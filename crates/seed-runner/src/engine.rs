//! Calls out to the container engine CLI.

use seed_core::{ImageReference, Result, SeedError};
use seed_registry::Credentials;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const MANIFEST_LABEL: &str = "com.ngageoint.seed.manifest";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for build, push, pull and the short engine calls.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub program: String,
    /// Exported as `DOCKER_CONFIG` so logins made by this tool stay out of
    /// the invoking user's own docker config.
    pub docker_config: Option<PathBuf>,
    /// Applies to every engine call except `run`, which uses the job timeout.
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            docker_config: None,
            timeout: DEFAULT_ENGINE_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var("SEED_DOCKER") {
            if !program.trim().is_empty() {
                config.program = program;
            }
        }
        if let Ok(dir) = std::env::var("SEED_DOCKER_CONFIG") {
            if !dir.trim().is_empty() {
                config.docker_config = Some(PathBuf::from(dir));
            }
        }
        if let Ok(raw) = std::env::var("SEED_ENGINE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "ignoring invalid SEED_ENGINE_TIMEOUT_SECS"),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn describe(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "a signal".to_string(),
        }
    }
}

pub trait ImageBuilder {
    fn build_image(
        &self,
        context_dir: &Path,
        image: &ImageReference,
        labels: &[(String, String)],
    ) -> Result<()>;
}

pub trait ImagePublisher {
    /// Make `local` available as `remote` in the registry at `registry_host`.
    fn publish_image(
        &self,
        local: &ImageReference,
        remote: &ImageReference,
        registry_host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()>;
}

pub trait ContainerRunner {
    /// Run the engine with `args` (everything after the program name),
    /// killing it once `timeout` elapses.
    ///
    /// `name` is the container name given in `args`; on timeout the
    /// container itself is stopped, not only the client process.
    fn run_container(&self, name: &str, args: &[String], timeout: Duration)
        -> Result<RunStatus>;
}

#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    config: EngineConfig,
}

impl DockerCli {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        if let Some(dir) = &self.config.docker_config {
            cmd.env("DOCKER_CONFIG", dir);
        }
        cmd
    }

    fn engine_error(&self, action: &str, reason: impl Into<String>) -> SeedError {
        SeedError::Engine {
            program: self.config.program.clone(),
            action: action.to_string(),
            reason: reason.into(),
        }
    }

    /// Run with inherited stdio so the user sees engine progress.
    fn run_streaming(&self, action: &str, cmd: Command) -> Result<()> {
        debug!(action, command = ?cmd, "invoking container engine");
        let status = wait_with_timeout(cmd, self.config.timeout, &self.config.program, action)?;
        if status.success() {
            Ok(())
        } else {
            Err(self.engine_error(action, format!("exited with {}", status.describe())))
        }
    }

    fn run_captured(&self, action: &str, mut cmd: Command, stdin: Option<&[u8]>) -> Result<String> {
        debug!(action, command = ?cmd, "invoking container engine");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd
            .spawn()
            .map_err(|e| self.engine_error(action, e.to_string()))?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(bytes) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(self.engine_error(action, e.to_string()));
            }
        }
        // Drained on threads so a full pipe cannot stall the child past the deadline.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_child(
            &mut child,
            Instant::now(),
            self.config.timeout,
            &self.config.program,
            action,
        )?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let tail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no error output")
                .trim()
                .to_string();
            return Err(self.engine_error(action, format!("{} ({})", tail, status.describe())));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Best effort: a failure is logged and the caller's error stands.
    pub fn kill_container(&self, name: &str) {
        let mut cmd = self.command();
        cmd.arg("kill").arg(name);
        match self.run_captured("kill", cmd, None) {
            Ok(_) => info!(container = name, "killed container"),
            Err(e) => warn!(container = name, error = %e, "failed to kill container"),
        }
    }

    pub fn tag(&self, source: &ImageReference, target: &ImageReference) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("tag")
            .arg(source.to_string())
            .arg(target.to_string());
        self.run_captured("tag", cmd, None).map(|_| ())
    }

    pub fn push(&self, image: &ImageReference) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("push").arg(image.to_string());
        self.run_streaming("push", cmd)
    }

    pub fn pull(&self, image: &ImageReference) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("pull").arg(image.to_string());
        self.run_streaming("pull", cmd)
    }

    pub fn login(&self, registry_host: &str, credentials: &Credentials) -> Result<()> {
        let mut cmd = self.command();
        cmd.args([
            "login",
            "-u",
            credentials.username.as_str(),
            "--password-stdin",
            registry_host,
        ]);
        self.run_captured("login", cmd, Some(credentials.password.as_bytes()))
            .map(|_| ())
    }

    pub fn list_images(&self) -> Result<Vec<ImageReference>> {
        let mut cmd = self.command();
        cmd.args(["images", "--format", "{{.Repository}}:{{.Tag}}"]);
        let stdout = self.run_captured("images", cmd, None)?;
        Ok(parse_image_listing(&stdout))
    }

    /// The manifest embedded in an image's labels, if it carries one.
    pub fn image_manifest(&self, image: &ImageReference) -> Result<Option<String>> {
        let mut cmd = self.command();
        let format = format!("{{{{index .Config.Labels \"{}\"}}}}", MANIFEST_LABEL);
        cmd.arg("inspect")
            .arg("--format")
            .arg(format)
            .arg(image.to_string());
        let stdout = self.run_captured("inspect", cmd, None)?;
        let label = stdout.trim();
        if label.is_empty() || label == "<no value>" {
            Ok(None)
        } else {
            Ok(Some(label.to_string()))
        }
    }
}

/// Parse `repository:tag` lines, skipping dangling `<none>` entries.
pub fn parse_image_listing(stdout: &str) -> Vec<ImageReference> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("<none>"))
        .map(ImageReference::parse)
        .collect()
}

impl ImageBuilder for DockerCli {
    fn build_image(
        &self,
        context_dir: &Path,
        image: &ImageReference,
        labels: &[(String, String)],
    ) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("build").arg("-t").arg(image.to_string());
        for (key, value) in labels {
            cmd.arg("--label").arg(format!("{}={}", key, value));
        }
        cmd.arg(context_dir);
        info!(image = %image, dir = %context_dir.display(), "building image");
        self.run_streaming("build", cmd)
    }
}

impl ImagePublisher for DockerCli {
    fn publish_image(
        &self,
        local: &ImageReference,
        remote: &ImageReference,
        registry_host: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        if let Some(creds) = credentials {
            self.login(registry_host, creds)?;
        }
        if local != remote {
            self.tag(local, remote)?;
        }
        info!(image = %remote, "pushing image");
        self.push(remote)
    }
}

impl ContainerRunner for DockerCli {
    fn run_container(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunStatus> {
        let mut cmd = self.command();
        cmd.args(args);
        let result = wait_with_timeout(cmd, timeout, &self.config.program, "run");
        if let Err(SeedError::Timeout { .. }) = &result {
            warn!(container = name, "job timed out, stopping container");
            self.kill_container(name);
        }
        result
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Spawn `cmd` and poll it until it exits or `timeout` passes. On timeout
/// the child is killed and reaped; nothing is retried.
pub fn wait_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    program: &str,
    action: &str,
) -> Result<RunStatus> {
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| SeedError::Engine {
        program: program.to_string(),
        action: action.to_string(),
        reason: e.to_string(),
    })?;
    wait_child(&mut child, started, timeout, program, action)
}

fn wait_child(
    child: &mut Child,
    started: Instant,
    timeout: Duration,
    program: &str,
    action: &str,
) -> Result<RunStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(RunStatus {
                    exit_code: status.code(),
                    elapsed: started.elapsed(),
                });
            }
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SeedError::Timeout {
                    action: format!("{} {}", program, action),
                    seconds: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL.min(timeout)),
            Err(e) => {
                return Err(SeedError::Engine {
                    program: program.to_string(),
                    action: action.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
