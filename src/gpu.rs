use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("GPU driver unavailable: {0}")]
    Unavailable(String),
}

/// Query facade over the NVIDIA management library. Only device index 0 is
/// monitored; multi-device support is a future extension.
pub struct GpuProbe {
    nvml: Option<Nvml>,
}

impl GpuProbe {
    /// Initializes the driver handle once. Never fails: a missing driver
    /// degrades every query to zero-valued results rather than aborting
    /// startup.
    pub fn init() -> Self {
        match Nvml::init() {
            Ok(nvml) => Self { nvml: Some(nvml) },
            Err(e) => {
                warn!(error = %e, "GPU driver unavailable, probe will report zeros");
                Self { nvml: None }
            }
        }
    }

    /// (total, used, free) bytes for device 0.
    pub fn total_device_memory(&self) -> Result<(u64, u64, u64), ProbeError> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| ProbeError::Unavailable("driver not initialized".into()))?;
        let device = nvml
            .device_by_index(0)
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let mem = device
            .memory_info()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        Ok((mem.total, mem.used, mem.free))
    }

    /// (pid, used_bytes) for every process with an active compute context on
    /// device 0.
    pub fn compute_processes(&self) -> Result<Vec<(u32, u64)>, ProbeError> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| ProbeError::Unavailable("driver not initialized".into()))?;
        let device = nvml
            .device_by_index(0)
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let procs = device
            .running_compute_processes()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        Ok(procs
            .into_iter()
            .filter_map(|p| match p.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => Some((p.pid, bytes)),
                UsedGpuMemory::Unavailable => None,
            })
            .collect())
    }

    /// Device name substring, used by the Lifecycle for GPU-class detection.
    /// Returns `None` when the driver is unavailable.
    pub fn device_name(&self) -> Option<String> {
        let nvml = self.nvml.as_ref()?;
        let device = nvml.device_by_index(0).ok()?;
        device.name().ok()
    }

    /// Number of devices visible to the driver (used for the default
    /// tensor-parallel degree). Zero when the driver is unavailable.
    pub fn device_count(&self) -> u32 {
        self.nvml
            .as_ref()
            .and_then(|n| n.device_count().ok())
            .unwrap_or(0)
    }
}

/// Detect the GPU class from a device name via substring match, falling back
/// to `T4` when nothing matches or the name is unavailable.
pub fn detect_gpu_class(device_name: Option<&str>) -> String {
    let name = device_name.unwrap_or_default();
    for class in ["A100", "H100", "L40", "T4"] {
        if name.contains(class) {
            return class.to_string();
        }
    }
    "T4".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_a100() {
        assert_eq!(detect_gpu_class(Some("NVIDIA A100-SXM4-80GB")), "A100");
    }

    #[test]
    fn detects_h100() {
        assert_eq!(detect_gpu_class(Some("NVIDIA H100 PCIe")), "H100");
    }

    #[test]
    fn defaults_to_t4_for_unknown_device() {
        assert_eq!(detect_gpu_class(Some("NVIDIA RTX 3090")), "T4");
    }

    #[test]
    fn defaults_to_t4_when_absent() {
        assert_eq!(detect_gpu_class(None), "T4");
    }
}
