//! GPU capacity sampling.
//!
//! A [`CapacityProbe`] reports per-device load and free memory. The
//! [`CapacitySampler`] turns a probe reading into the single number the worker
//! advertises: the free memory of every device whose load is strictly below the
//! configured ceiling. Busy devices are left out entirely, and a reading with no
//! eligible device yields no capacity at all.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, WorkerError};

/// One device as seen by a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSample {
    /// Utilization in 0.0..=1.0
    pub load: f64,
    pub memory_free_mib: u64,
}

impl DeviceSample {
    pub fn new(load: f64, memory_free_mib: u64) -> Self {
        Self {
            load,
            memory_free_mib,
        }
    }
}

#[async_trait]
pub trait CapacityProbe: Send + Sync {
    async fn sample(&self) -> Result<Vec<DeviceSample>>;
}

/// Sum the free memory of devices strictly below `load_ceiling`.
///
/// Returns `None` when no device qualifies.
pub fn eligible_capacity(devices: &[DeviceSample], load_ceiling: f64) -> Option<u64> {
    let mut eligible = devices
        .iter()
        .filter(|device| device.load < load_ceiling)
        .peekable();
    eligible.peek()?;
    Some(eligible.map(|device| device.memory_free_mib).sum())
}

/// Shared handle used by both the telemetry and command loops.
#[derive(Clone)]
pub struct CapacitySampler {
    probe: Arc<dyn CapacityProbe>,
    load_ceiling: f64,
}

impl CapacitySampler {
    pub fn new(probe: Arc<dyn CapacityProbe>, load_ceiling: f64) -> Self {
        Self {
            probe,
            load_ceiling,
        }
    }

    /// Current advertisable capacity in MiB, or `None` if unavailable.
    pub async fn read(&self) -> Option<u64> {
        match self.probe.sample().await {
            Ok(devices) => {
                tracing::debug!(devices = devices.len(), "Sampled GPU devices");
                eligible_capacity(&devices, self.load_ceiling)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Capacity probe unavailable");
                None
            }
        }
    }
}

/// Reads device state from `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CapacityProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Result<Vec<DeviceSample>> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=utilization.gpu,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorkerError::Probe(format!("{}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(WorkerError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `utilization.gpu,memory.free` CSV rows (percent, MiB).
pub fn parse_nvidia_smi(csv: &str) -> Result<Vec<DeviceSample>> {
    csv.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (util, free) = line
                .split_once(',')
                .ok_or_else(|| WorkerError::Probe(format!("unexpected row: {}", line)))?;
            let util: f64 = util
                .trim()
                .parse()
                .map_err(|_| WorkerError::Probe(format!("bad utilization in row: {}", line)))?;
            let free: u64 = free
                .trim()
                .parse()
                .map_err(|_| WorkerError::Probe(format!("bad memory.free in row: {}", line)))?;
            Ok(DeviceSample::new(util / 100.0, free))
        })
        .collect()
}

/// Probe returning a preset reading. `None` means unavailable.
#[derive(Debug, Default)]
pub struct FixedProbe {
    devices: Mutex<Option<Vec<DeviceSample>>>,
}

impl FixedProbe {
    pub fn new(devices: Vec<DeviceSample>) -> Self {
        Self {
            devices: Mutex::new(Some(devices)),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, devices: Option<Vec<DeviceSample>>) {
        if let Ok(mut guard) = self.devices.lock() {
            *guard = devices;
        }
    }
}

#[async_trait]
impl CapacityProbe for FixedProbe {
    async fn sample(&self) -> Result<Vec<DeviceSample>> {
        self.devices
            .lock()
            .map_err(|_| WorkerError::Probe("fixed probe poisoned".to_string()))?
            .clone()
            .ok_or_else(|| WorkerError::Probe("no devices".to_string()))
    }
}
