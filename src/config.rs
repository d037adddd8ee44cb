use std::path::PathBuf;
use std::time::Duration;

/// File name every job is staged under inside [`WorkerConfig::staging_dir`].
///
/// Only one job runs at a time, so a single fixed path is reused. Running jobs
/// in parallel would need a unique path per job.
pub const STAGING_FILE_NAME: &str = "job.py";

/// Source extension accepted for `run-file` jobs.
pub const SUPPORTED_EXTENSION: &str = ".py";

/// Configuration for capacity reporting.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Time between capacity reports
    pub interval: Duration,
    /// Devices at or above this load (0.0..=1.0) are not advertised
    pub load_ceiling: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            load_ceiling: 0.5,
        }
    }
}

/// Configuration for job execution.
///
/// Jobs run in a Docker container when the runtime and image are available,
/// and directly through the local interpreter otherwise.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container CLI (`docker` or a compatible one such as `podman`)
    pub runtime: String,
    /// Docker image to use for job execution
    pub image: String,
    /// Dockerfile used to build `image` when it is not present locally
    pub dockerfile: Option<PathBuf>,
    /// Interpreter binary, both on the host and inside the image
    pub interpreter: String,
    /// Where the staged file is mounted inside the container
    pub container_path: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Upper bound on a single execution attempt
    pub execution_timeout: Option<Duration>,
    /// Allow container execution at all. When false the worker always runs direct.
    pub containers_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "exchange-runner:latest".to_string(),
            dockerfile: None,
            interpreter: "python3".to_string(),
            container_path: "/app/job.py".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
            execution_timeout: Some(Duration::from_secs(600)),
            containers_enabled: true,
        }
    }
}

/// Backoff applied between connection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A session must stay up this long before the backoff starts over.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            stable_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub exchange_url: String,
    pub staging_dir: PathBuf,
    pub telemetry: TelemetryConfig,
    pub sandbox: SandboxConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            exchange_url: "ws://localhost:8080/exchange/connect".to_string(),
            staging_dir: PathBuf::from("."),
            telemetry: TelemetryConfig::default(),
            sandbox: SandboxConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(exchange_url: impl Into<String>) -> Self {
        Self {
            exchange_url: exchange_url.into(),
            ..Default::default()
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Full path of the staged job file.
    pub fn staging_path(&self) -> PathBuf {
        self.staging_dir.join(STAGING_FILE_NAME)
    }
}
