
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use exchange_worker::config::SandboxConfig;
use exchange_worker::protocol::JobResult;
use exchange_worker::worker::sandbox::EXECUTION_TIMED_OUT;
use exchange_worker::worker::{SandboxMode, SandboxRunner};
use tempfile::TempDir;
use test_harness::{python3_available, sh_sandbox, FakeRuntime, FakeRuntimeOptions};

/// Create a direct-mode runner that executes files with `sh`
fn test_runner() -> SandboxRunner {
    SandboxRunner::new(sh_sandbox(), SandboxMode::Direct)
}

/// Containerized runner driving `runtime` instead of docker.
fn container_runner(runtime: &FakeRuntime) -> SandboxRunner {
    SandboxRunner::new(
        SandboxConfig {
            runtime: runtime.program(),
            ..sh_sandbox()
        },
        SandboxMode::Containerized,
    )
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

async fn stage(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, source).await.unwrap();
    path
}

fn assert_removed(path: &Path) {
    assert!(!path.exists(), "staged file should be removed: {}", path.display());
}

#[tokio::test]
async fn test_run_simple_file() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "echo hello").await;

    let result = test_runner().run(&path).await;

    assert_eq!(
        result,
        JobResult::Completed {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            returncode: 0,
        }
    );
    assert_removed(&path);
}

#[tokio::test]
async fn test_run_failure_keeps_stderr_and_exit_code() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "echo 'error message' >&2\nexit 3").await;

    let result = test_runner().run(&path).await;

    match result {
        JobResult::Completed {
            stdout,
            stderr,
            returncode,
        } => {
            assert!(stdout.is_empty());
            assert_eq!(stderr, "error message\n");
            assert_eq!(returncode, 3);
        }
        other => panic!("expected completed result, got {:?}", other),
    }
    assert_removed(&path);
}

#[tokio::test]
async fn test_run_large_output() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "i=0\nwhile [ $i -lt 1000 ]; do echo $i; i=$((i+1)); done").await;

    let result = test_runner().run(&path).await;

    match result {
        JobResult::Completed {
            stdout, returncode, ..
        } => {
            assert_eq!(returncode, 0);
            assert_eq!(stdout.lines().count(), 1000);
        }
        other => panic!("expected completed result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signalled_process_reports_negative_signal() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "kill -9 $$").await;

    let result = test_runner().run(&path).await;

    match result {
        JobResult::Completed { returncode, .. } => assert_eq!(returncode, -9),
        other => panic!("expected completed result, got {:?}", other),
    }
    assert_removed(&path);
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected_and_removed() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.sh", "echo hello").await;

    let result = test_runner().run(&path).await;

    match result {
        JobResult::Failed { error } => assert!(error.contains("unsupported file type")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_removed(&path);
}

#[tokio::test]
async fn test_missing_interpreter_is_an_error_result() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "echo hello").await;
    let runner = SandboxRunner::new(
        SandboxConfig {
            interpreter: "nonexistent_interpreter_12345".to_string(),
            ..sh_sandbox()
        },
        SandboxMode::Direct,
    );

    let result = runner.run(&path).await;

    assert!(result.is_error());
    assert_removed(&path);
}

#[tokio::test]
async fn test_missing_file_is_an_error_result() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.py");

    // sh reports the missing script itself with a non-zero exit
    let result = test_runner().run(&path).await;

    match result {
        JobResult::Completed { returncode, .. } => assert_ne!(returncode, 0),
        JobResult::Failed { .. } => {}
    }
    assert_removed(&path);
}

#[tokio::test]
async fn test_timeout_kills_job() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "sleep 5").await;
    let runner = SandboxRunner::new(
        SandboxConfig {
            execution_timeout: Some(Duration::from_millis(200)),
            ..sh_sandbox()
        },
        SandboxMode::Direct,
    );

    let start = Instant::now();
    let result = runner.run(&path).await;

    assert_eq!(result, JobResult::error(EXECUTION_TIMED_OUT));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_removed(&path);
}

#[tokio::test]
async fn test_container_launch_failure_falls_back_to_direct() {
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "echo fallback").await;
    let runner = SandboxRunner::new(
        SandboxConfig {
            runtime: "nonexistent_container_runtime_12345".to_string(),
            containers_enabled: true,
            ..sh_sandbox()
        },
        SandboxMode::Containerized,
    );

    let result = runner.run(&path).await;

    assert_eq!(
        result,
        JobResult::Completed {
            stdout: "fallback\n".to_string(),
            stderr: String::new(),
            returncode: 0,
        }
    );
    assert_removed(&path);
}

#[tokio::test]
async fn test_detect_without_runtime_is_direct() {
    let config = SandboxConfig {
        runtime: "nonexistent_container_runtime_12345".to_string(),
        ..SandboxConfig::default()
    };
    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Direct);
}

#[tokio::test]
async fn test_detect_with_containers_disabled_is_direct() {
    let config = SandboxConfig {
        containers_enabled: false,
        ..SandboxConfig::default()
    };
    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Direct);
}

#[tokio::test]
async fn test_python_job_runs_directly() {
    if !python3_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "print(1)").await;
    let runner = SandboxRunner::new(
        SandboxConfig {
            interpreter: "python3".to_string(),
            ..sh_sandbox()
        },
        SandboxMode::Direct,
    );

    let result = runner.run(&path).await;

    assert_eq!(
        result,
        JobResult::Completed {
            stdout: "1\n".to_string(),
            stderr: String::new(),
            returncode: 0,
        }
    );
    assert_removed(&path);
}

#[tokio::test]
async fn test_container_run_uses_hardened_read_only_mount() {
    let runtime = FakeRuntime::new();
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "echo in-container").await;
    let host_path = dir.path().canonicalize().unwrap().join("job.py");

    let result = container_runner(&runtime).run(&path).await;

    assert_eq!(
        result,
        JobResult::Completed {
            stdout: "in-container\n".to_string(),
            stderr: String::new(),
            returncode: 0,
        }
    );
    assert_removed(&path);

    let args = runtime.create_args();
    assert_eq!(args[0], "create");
    assert!(args[1].starts_with("--name=exchange-job-"));
    for flag in [
        "--network=none",
        "--memory=256m",
        "--cpus=0.5",
        "--cap-drop=ALL",
        "--security-opt=no-new-privileges",
        "--read-only",
    ] {
        assert!(args.iter().any(|arg| arg == flag), "missing {} in {:?}", flag, args);
    }
    let mount = format!("{}:/app/job.py:ro", host_path.display());
    let mount_at = args.iter().position(|arg| arg == &mount).expect("read-only mount");
    assert_eq!(args[mount_at - 1], "-v");
    assert_eq!(
        &args[args.len() - 3..],
        &["exchange-runner:latest", "sh", "/app/job.py"]
    );

    let name = args[1].trim_start_matches("--name=");
    let calls = runtime.calls();
    assert!(calls.contains(&format!("start --attach {}", name)));
    assert!(calls.contains(&format!("rm --force {}", name)));
}

#[tokio::test]
async fn test_container_exit_125_is_the_job_result() {
    let runtime = FakeRuntime::new();
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let source = format!("echo run >> {}\nexit 125", counter.display());
    let path = stage(&dir, "job.py", &source).await;

    let result = container_runner(&runtime).run(&path).await;

    match result {
        JobResult::Completed { returncode, .. } => assert_eq!(returncode, 125),
        other => panic!("expected completed result, got {:?}", other),
    }
    assert_eq!(line_count(&counter), 1, "job must run exactly once");
}

#[tokio::test]
async fn test_container_create_failure_falls_back_to_direct() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        create_error: Some("No such image: exchange-runner:latest"),
        ..Default::default()
    });
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let source = format!("echo run >> {}\necho direct", counter.display());
    let path = stage(&dir, "job.py", &source).await;

    let result = container_runner(&runtime).run(&path).await;

    match result {
        JobResult::Completed { stdout, returncode, .. } => {
            assert_eq!(stdout, "direct\n");
            assert_eq!(returncode, 0);
        }
        other => panic!("expected completed result, got {:?}", other),
    }
    assert_eq!(line_count(&counter), 1);
    assert!(!runtime.calls().iter().any(|call| call.starts_with("start")));
}

#[tokio::test]
async fn test_container_start_failure_falls_back_to_direct() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        start_error: Some("OCI runtime create failed"),
        ..Default::default()
    });
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("runs");
    let source = format!("echo run >> {}\necho direct", counter.display());
    let path = stage(&dir, "job.py", &source).await;

    let result = container_runner(&runtime).run(&path).await;

    match result {
        JobResult::Completed { stdout, .. } => assert_eq!(stdout, "direct\n"),
        other => panic!("expected completed result, got {:?}", other),
    }
    assert_eq!(line_count(&counter), 1);
    assert_removed(&path);
}

#[tokio::test]
async fn test_container_timeout_kills_container_by_name() {
    let runtime = FakeRuntime::new();
    let dir = TempDir::new().unwrap();
    let path = stage(&dir, "job.py", "sleep 5").await;
    let runner = SandboxRunner::new(
        SandboxConfig {
            runtime: runtime.program(),
            execution_timeout: Some(Duration::from_millis(300)),
            ..sh_sandbox()
        },
        SandboxMode::Containerized,
    );

    let start = Instant::now();
    let result = runner.run(&path).await;

    assert_eq!(result, JobResult::error(EXECUTION_TIMED_OUT));
    assert!(start.elapsed() < Duration::from_secs(3));

    let name = runtime.create_args()[1].trim_start_matches("--name=").to_string();
    let calls = runtime.calls();
    assert!(calls.contains(&format!("kill {}", name)), "{:?}", calls);
    assert!(calls.contains(&format!("rm --force {}", name)), "{:?}", calls);
}

#[tokio::test]
async fn test_detect_with_present_image_is_containerized() {
    let runtime = FakeRuntime::new();
    let config = SandboxConfig {
        runtime: runtime.program(),
        ..SandboxConfig::default()
    };

    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Containerized);
    assert!(runtime
        .calls()
        .contains(&"image inspect exchange-runner:latest".to_string()));
}

#[tokio::test]
async fn test_detect_builds_missing_image_from_dockerfile() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        image_inspect_exit: 1,
        ..Default::default()
    });
    let dir = TempDir::new().unwrap();
    let dockerfile = dir.path().join("Dockerfile");
    let config = SandboxConfig {
        runtime: runtime.program(),
        dockerfile: Some(dockerfile.clone()),
        ..SandboxConfig::default()
    };

    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Containerized);
    let build = format!(
        "build -t exchange-runner:latest --file {} {}",
        dockerfile.display(),
        dir.path().display()
    );
    assert!(runtime.calls().contains(&build), "{:?}", runtime.calls());
}

#[tokio::test]
async fn test_detect_failed_build_is_direct() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        image_inspect_exit: 1,
        build_exit: 1,
        ..Default::default()
    });
    let dir = TempDir::new().unwrap();
    let config = SandboxConfig {
        runtime: runtime.program(),
        dockerfile: Some(dir.path().join("Dockerfile")),
        ..SandboxConfig::default()
    };

    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Direct);
}

#[tokio::test]
async fn test_detect_missing_image_without_dockerfile_is_direct() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        image_inspect_exit: 1,
        ..Default::default()
    });
    let config = SandboxConfig {
        runtime: runtime.program(),
        ..SandboxConfig::default()
    };

    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Direct);
    assert!(!runtime.calls().iter().any(|call| call.starts_with("build")));
}

#[tokio::test]
async fn test_detect_unresponsive_daemon_is_direct() {
    let runtime = FakeRuntime::with_options(FakeRuntimeOptions {
        version_exit: 1,
        ..Default::default()
    });
    let config = SandboxConfig {
        runtime: runtime.program(),
        ..SandboxConfig::default()
    };

    assert_eq!(SandboxMode::detect(&config).await, SandboxMode::Direct);
    assert_eq!(runtime.calls(), vec!["version".to_string()]);
}
