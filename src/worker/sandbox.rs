use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};

use tokio::process::Command;
use uuid::Uuid;

use crate::config::{SandboxConfig, SUPPORTED_EXTENSION};
use crate::error::{Result, WorkerError};
use crate::protocol::JobResult;

pub const EXECUTION_TIMED_OUT: &str = "execution timed out";

/// How jobs are executed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    Containerized,
    Direct,
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxMode::Containerized => write!(f, "containerized"),
            SandboxMode::Direct => write!(f, "direct"),
        }
    }
}

impl SandboxMode {
    /// Decide once at startup whether jobs can run in a container.
    ///
    /// Requires a reachable Docker daemon and the configured image, built from
    /// `dockerfile` if it is not present yet.
    pub async fn detect(config: &SandboxConfig) -> Self {
        if !config.containers_enabled {
            tracing::info!("Container execution disabled, running jobs directly");
            return SandboxMode::Direct;
        }

        if !runtime_succeeds(Command::new(&config.runtime).arg("version")).await {
            tracing::warn!(runtime = %config.runtime, "Container runtime unavailable, running jobs directly");
            return SandboxMode::Direct;
        }

        if runtime_succeeds(
            Command::new(&config.runtime)
                .args(["image", "inspect"])
                .arg(&config.image),
        )
        .await
        {
            return SandboxMode::Containerized;
        }

        if let Some(dockerfile) = &config.dockerfile {
            let context = dockerfile
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            tracing::info!(image = %config.image, dockerfile = %dockerfile.display(), "Building sandbox image");
            if runtime_succeeds(
                Command::new(&config.runtime)
                    .args(["build", "-t"])
                    .arg(&config.image)
                    .arg("--file")
                    .arg(dockerfile)
                    .arg(context),
            )
            .await
            {
                return SandboxMode::Containerized;
            }
            tracing::warn!(image = %config.image, "Sandbox image build failed");
        }

        tracing::warn!(image = %config.image, "Sandbox image unavailable, running jobs directly");
        SandboxMode::Direct
    }
}

async fn runtime_succeeds(command: &mut Command) -> bool {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Runs a staged source file and turns the outcome into a [`JobResult`].
///
/// In containerized mode the file is mounted read-only into a locked-down,
/// throwaway container:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// If the container cannot be launched the same call falls back to the local
/// interpreter, so containerized mode keeps the worker available but is not a
/// hard isolation guarantee.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    config: SandboxConfig,
    mode: SandboxMode,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig, mode: SandboxMode) -> Self {
        Self { config, mode }
    }

    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// Execute the file at `path`, then delete it whatever the outcome.
    pub async fn run(&self, path: &Path) -> JobResult {
        tracing::info!(path = %path.display(), mode = %self.mode, "Running job");

        let result = match self.execute(path).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Job execution failed");
                JobResult::error(e.to_string())
            }
        };

        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
            }
        }

        result
    }

    async fn execute(&self, path: &Path) -> Result<JobResult> {
        let supported = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(SUPPORTED_EXTENSION));
        if !supported {
            return Ok(JobResult::error(format!(
                "unsupported file type: please use {} files",
                SUPPORTED_EXTENSION
            )));
        }

        let output = match self.mode {
            SandboxMode::Containerized => match self.run_in_container(path).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(error = %e, "Container launch failed, falling back to direct execution");
                    self.run_direct(path).await?
                }
            },
            SandboxMode::Direct => self.run_direct(path).await?,
        };

        Ok(match output {
            Some(output) => completed(&output),
            None => JobResult::error(EXECUTION_TIMED_OUT),
        })
    }

    /// Run the job in a fresh container.
    ///
    /// The container is created and started as separate steps so a launch
    /// failure is never confused with the job's own exit status. Any `Err`
    /// means the job did not run and the caller may fall back.
    async fn run_in_container(&self, path: &Path) -> Result<Option<Output>> {
        let host_path = tokio::fs::canonicalize(path).await?;
        let name = format!("exchange-job-{}", Uuid::new_v4());

        self.create_container(&name, &host_path).await?;
        let outcome = self.start_container(&name).await;

        if !runtime_succeeds(
            Command::new(&self.config.runtime).args(["rm", "--force", name.as_str()]),
        )
        .await
        {
            tracing::warn!(container = %name, "Failed to remove job container");
        }

        outcome
    }

    async fn create_container(&self, name: &str, host_path: &Path) -> Result<()> {
        let mut args = vec!["create".to_string(), format!("--name={}", name)];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            host_path.display(),
            self.config.container_path
        ));

        args.push(self.config.image.clone());
        args.push(self.config.interpreter.clone());
        args.push(self.config.container_path.clone());

        let output = Command::new(&self.config.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorkerError::Sandbox(format!(
                "{} create failed: {}",
                self.config.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Start a created container attached, passing its exit status through.
    async fn start_container(&self, name: &str) -> Result<Option<Output>> {
        let mut command = Command::new(&self.config.runtime);
        command.args(["start", "--attach", name]);

        match self.run_bounded(command).await? {
            Some(output) => match self.start_error(name).await {
                Some(error) => Err(WorkerError::Sandbox(format!(
                    "container failed to start: {}",
                    error
                ))),
                None => Ok(Some(output)),
            },
            None => {
                // The client was killed but the container may still be running.
                if !runtime_succeeds(Command::new(&self.config.runtime).args(["kill", name])).await
                {
                    tracing::warn!(container = %name, "Failed to kill timed out job container");
                }
                Ok(None)
            }
        }
    }

    /// The daemon's record of why a container could not be started, if any.
    async fn start_error(&self, name: &str) -> Option<String> {
        let output = Command::new(&self.config.runtime)
            .args(["inspect", "--format={{.State.Error}}", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        let error = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !error.is_empty()).then_some(error)
    }

    async fn run_direct(&self, path: &Path) -> Result<Option<Output>> {
        let mut command = Command::new(&self.config.interpreter);
        command.arg(path);
        self.run_bounded(command).await
    }

    /// Run to completion, or `None` if the configured timeout elapsed first.
    async fn run_bounded(&self, mut command: Command) -> Result<Option<Output>> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output();
        match self.config.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => Ok(Some(result?)),
                Err(_) => {
                    tracing::warn!(timeout_secs = limit.as_secs_f64(), "Job timed out");
                    Ok(None)
                }
            },
            None => Ok(Some(output.await?)),
        }
    }
}

fn completed(output: &Output) -> JobResult {
    let returncode = exit_code(output.status);
    tracing::info!(returncode, "Job completed");
    JobResult::Completed {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        returncode,
    }
}

/// Exit code, or the negated signal number for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|signal| -signal).unwrap_or(-1))
}
