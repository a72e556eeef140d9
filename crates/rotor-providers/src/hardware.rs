//! Hardware detection for the in-process inference provider.
//!
//! Detection uses filesystem probes rather than linking to GPU vendor
//! libraries at compile time, so this crate stays lightweight regardless of
//! which backend ends up selected at runtime.

use std::path::Path;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ComputeBackend {
    Cuda,
    Rocm,
    Vulkan,
    Cpu,
}

impl std::fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "CUDA"),
            Self::Rocm => write!(f, "ROCm"),
            Self::Vulkan => write!(f, "Vulkan"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HardwareInfo {
    pub backend: ComputeBackend,
    pub available_backends: Vec<ComputeBackend>,
    pub total_ram_bytes: u64,
    pub available_ram_bytes: u64,
    pub cpu_cores: usize,
}

impl HardwareInfo {
    /// Detect available hardware and the best compute backend, in priority
    /// order CUDA → ROCm → Vulkan → CPU.
    pub fn detect() -> Self {
        let mut available = Vec::new();
        if Path::new("/dev/nvidia0").exists() {
            available.push(ComputeBackend::Cuda);
        }
        if Path::new("/dev/kfd").exists() {
            available.push(ComputeBackend::Rocm);
        }
        if Path::new("/dev/dri").exists() {
            available.push(ComputeBackend::Vulkan);
        }
        available.push(ComputeBackend::Cpu);

        let backend = available.first().copied().unwrap_or(ComputeBackend::Cpu);

        let mut sys = System::new();
        sys.refresh_memory();

        Self {
            backend,
            available_backends: available,
            total_ram_bytes: sys.total_memory(),
            available_ram_bytes: sys.free_memory(),
            cpu_cores: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }

    /// 80% of available RAM, falling back to total RAM when available RAM
    /// is unreported, with a 512 MB floor so the value is never zero.
    pub fn memory_budget_bytes(&self) -> u64 {
        const FLOOR: u64 = 512 * 1024 * 1024;
        let base = if self.available_ram_bytes > 0 {
            self.available_ram_bytes
        } else {
            self.total_ram_bytes
        };
        ((base as f64 * 0.8) as u64).max(FLOOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_always_includes_cpu_fallback() {
        let hw = HardwareInfo::detect();
        assert!(hw.available_backends.contains(&ComputeBackend::Cpu));
    }

    #[test]
    fn memory_budget_has_a_floor() {
        let hw = HardwareInfo {
            backend: ComputeBackend::Cpu,
            available_backends: vec![ComputeBackend::Cpu],
            total_ram_bytes: 0,
            available_ram_bytes: 0,
            cpu_cores: 1,
        };
        assert_eq!(hw.memory_budget_bytes(), 512 * 1024 * 1024);
    }
}
