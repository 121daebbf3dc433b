use sysinfo::{Pid, System};
use thiserror::Error;

/// One reading of this process's resource usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// CPU usage since the previous sample, as a share of total machine capacity (0-100)
    pub cpu_percent: f32,
    /// Resident memory
    pub memory_bytes: u64,
}

impl ResourceSample {
    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Resource sampling failed: {0}")]
pub struct SampleError(pub String);

impl SampleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Source of resource samples. Owned by the monitoring task and dropped
/// when it exits.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSample, SampleError>;
}

/// Samples the current process through `sysinfo`
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
    cpu_count: usize,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let cpu_count = system.cpus().len().max(1);

        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
            cpu_count,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ResourceSample, SampleError> {
        let pid = self
            .pid
            .ok_or_else(|| SampleError::new("current process id unavailable"))?;

        if !self.system.refresh_process(pid) {
            return Err(SampleError::new(format!("process {} not found", pid)));
        }

        let process = self
            .system
            .process(pid)
            .ok_or_else(|| SampleError::new(format!("process {} not found", pid)))?;

        Ok(ResourceSample {
            cpu_percent: normalise_cpu(process.cpu_usage(), self.cpu_count),
            memory_bytes: process.memory(),
        })
    }
}

/// sysinfo reports per-core percentages summed across cores
fn normalise_cpu(raw: f32, cpu_count: usize) -> f32 {
    (raw / cpu_count.max(1) as f32).clamp(0.0, 100.0)
}
