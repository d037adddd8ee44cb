use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use exchange_worker::capacity::NvidiaSmiProbe;
use exchange_worker::config::{SandboxConfig, TelemetryConfig, WorkerConfig};
use exchange_worker::session::SessionSupervisor;
use exchange_worker::shutdown::install_shutdown_handler;
use exchange_worker::worker::{SandboxMode, SandboxRunner};

#[derive(Parser, Debug)]
#[command(name = "exchange-worker")]
#[command(version)]
#[command(about = "Advertise spare GPU capacity to a compute exchange and run submitted jobs")]
struct Args {
    /// Exchange websocket endpoint
    #[arg(
        long,
        env = "EXCHANGE_URL",
        default_value = "ws://localhost:8080/exchange/connect"
    )]
    url: String,

    /// Directory the incoming job file is staged in
    #[arg(long, default_value = ".")]
    staging_dir: PathBuf,

    // === Sandbox Options ===
    /// Container CLI used for sandboxed execution
    #[arg(long, default_value = "docker")]
    container_runtime: String,

    /// Docker image to use for job execution
    #[arg(long, default_value = "exchange-runner:latest")]
    image: String,

    /// Dockerfile to build the image from when it is missing locally
    #[arg(long)]
    dockerfile: Option<PathBuf>,

    /// Interpreter used to run jobs, inside the container and on the host
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Never use containers; always run jobs with the local interpreter
    #[arg(long)]
    no_container: bool,

    /// Kill a job after this many seconds (0 disables the limit)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    // === Telemetry Options ===
    /// Seconds between capacity reports
    #[arg(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    telemetry_interval_secs: u64,

    /// GPUs at or above this load (0.0-1.0) are not advertised
    #[arg(long, default_value = "0.5")]
    load_ceiling: f64,

    // === Logging ===
    /// Write logs to this file instead of stderr
    #[arg(long, env = "EXCHANGE_WORKER_LOG")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> WorkerConfig {
        let sandbox = SandboxConfig {
            runtime: self.container_runtime,
            image: self.image,
            dockerfile: self.dockerfile,
            interpreter: self.interpreter,
            execution_timeout: (self.timeout_secs > 0)
                .then(|| Duration::from_secs(self.timeout_secs)),
            containers_enabled: !self.no_container,
            ..SandboxConfig::default()
        };

        let telemetry = TelemetryConfig {
            interval: Duration::from_secs(self.telemetry_interval_secs),
            load_ceiling: self.load_ceiling,
        };

        WorkerConfig::new(self.url)
            .with_staging_dir(self.staging_dir)
            .with_sandbox(sandbox)
            .with_telemetry(telemetry)
    }
}

fn init_logging(
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_file.as_deref())?;

    let config = args.into_config();
    let mode = SandboxMode::detect(&config.sandbox).await;
    tracing::info!(mode = %mode, image = %config.sandbox.image, "Sandbox mode resolved");

    let runner = SandboxRunner::new(config.sandbox.clone(), mode);
    let shutdown = install_shutdown_handler()?;

    SessionSupervisor::new(config, runner, Arc::new(NvidiaSmiProbe::new()))
        .run(shutdown)
        .await;

    Ok(())
}
