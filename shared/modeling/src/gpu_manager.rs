//! Device inventory, VRAM estimation and the allocation / precision-mode catalogs.

use crate::sharding::ShardingStrategy;

use nvml_wrapper::{struct_wrappers::device::MemoryInfo, Nvml};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};

const GIB: f64 = (1u64 << 30) as f64;

/// VRAM in GB for the standard mode at 720×720, 5 seconds.
const BASE_VRAM_GB: f64 = 80.0;
const BASE_AREA: f64 = 720.0 * 720.0;
const TEN_SECOND_FACTOR: f64 = 1.5;
const QUANTIZED_FACTOR: f64 = 0.3;
const OFFLOAD_FACTOR: f64 = 0.4;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("no GPUs available")]
    NoDevice,

    #[error("device {index} out of range, {count} devices inventoried")]
    UnknownDevice { index: usize, count: usize },

    #[error("device runtime error: {0}")]
    Runtime(String),

    #[error("failed to read fleet description {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid fleet description: {0}")]
    Fleet(#[from] toml::de::Error),

    #[error("invalid resolution {0}, expected HEIGHTxWIDTH")]
    InvalidResolution(String),

    #[error("invalid duration {0}, expected whole seconds such as 5s or 10s")]
    InvalidDuration(String),
}

/// Precision and offload policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VramConfig {
    pub mode: &'static str,
    pub fp8: bool,
    pub cpu_offload: bool,
    pub qint8: bool,
    pub max_batch_size: usize,
    pub description: &'static str,
}

pub static VRAM_MODES: [VramConfig; 4] = [
    VramConfig {
        mode: "standard",
        fp8: false,
        cpu_offload: false,
        qint8: false,
        max_batch_size: 1,
        description: "Best quality for high-end GPUs (32GB+ VRAM)",
    },
    VramConfig {
        mode: "fp8",
        fp8: true,
        cpu_offload: false,
        qint8: false,
        max_batch_size: 1,
        description: "FP8 quantization for 24GB VRAM GPUs",
    },
    VramConfig {
        mode: "fp8_offload",
        fp8: true,
        cpu_offload: true,
        qint8: false,
        max_batch_size: 1,
        description: "FP8 with CPU offload for 16-24GB VRAM",
    },
    VramConfig {
        mode: "ultra_low",
        fp8: false,
        cpu_offload: true,
        qint8: true,
        max_batch_size: 1,
        description: "QINT8 with CPU offload for 8-16GB VRAM",
    },
];

pub fn vram_mode(name: &str) -> Option<&'static VramConfig> {
    VRAM_MODES.iter().find(|m| m.mode == name)
}

/// How many devices to use and how to split work across them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpuAllocation {
    pub mode: &'static str,
    /// `None` means use whatever is available.
    pub num_gpus: Option<usize>,
    pub sp_size: usize,
    pub use_fsdp: bool,
    pub fsdp_strategy: Option<ShardingStrategy>,
    pub description: &'static str,
}

pub static GPU_ALLOCATIONS: [GpuAllocation; 6] = [
    GpuAllocation {
        mode: "auto",
        num_gpus: None,
        sp_size: 1,
        use_fsdp: false,
        fsdp_strategy: None,
        description: "Automatically distribute across available GPUs",
    },
    GpuAllocation {
        mode: "single",
        num_gpus: Some(1),
        sp_size: 1,
        use_fsdp: false,
        fsdp_strategy: None,
        description: "Use single GPU",
    },
    GpuAllocation {
        mode: "multi_2",
        num_gpus: Some(2),
        sp_size: 2,
        use_fsdp: false,
        fsdp_strategy: None,
        description: "Sequence parallel across 2 GPUs",
    },
    GpuAllocation {
        mode: "multi_4",
        num_gpus: Some(4),
        sp_size: 4,
        use_fsdp: false,
        fsdp_strategy: None,
        description: "Sequence parallel across 4 GPUs",
    },
    GpuAllocation {
        mode: "multi_8",
        num_gpus: Some(8),
        sp_size: 8,
        use_fsdp: false,
        fsdp_strategy: None,
        description: "Sequence parallel across 8 GPUs",
    },
    GpuAllocation {
        mode: "fsdp",
        num_gpus: None,
        sp_size: 1,
        use_fsdp: true,
        fsdp_strategy: Some(ShardingStrategy::FullShard),
        description: "FSDP sharded inference for memory efficiency",
    },
];

pub fn gpu_allocation(name: &str) -> Option<&'static GpuAllocation> {
    GPU_ALLOCATIONS.iter().find(|a| a.mode == name)
}

fn allocation_for_count(available: usize) -> &'static GpuAllocation {
    let mode = match available {
        2 => "multi_2",
        n if n >= 4 => "multi_4",
        _ => "single",
    };
    &GPU_ALLOCATIONS[GPU_ALLOCATIONS
        .iter()
        .position(|a| a.mode == mode)
        .unwrap_or(1)]
}

/// Resolves `requested` against `available` devices. Unknown names become `auto`, and an
/// allocation wanting more devices than exist degrades to one that fits.
pub fn choose_allocation(requested: &str, available: usize) -> &'static GpuAllocation {
    let allocation = match gpu_allocation(requested) {
        Some(allocation) => allocation,
        None => {
            warn!("Unknown allocation mode '{requested}', using 'auto'");
            &GPU_ALLOCATIONS[0]
        }
    };
    let allocation = match allocation.mode {
        "auto" => allocation_for_count(available),
        _ => allocation,
    };
    match allocation.num_gpus {
        Some(wanted) if wanted > available => {
            warn!(
                "Requested {wanted} GPUs but only {available} available. Using {available} GPUs instead."
            );
            allocation_for_count(available)
        }
        _ => allocation,
    }
}

/// Output frame size, height first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub height: u32,
    pub width: u32,
}

impl Resolution {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    fn area(&self) -> f64 {
        self.height as f64 * self.width as f64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

impl FromStr for Resolution {
    type Err = PlannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PlannerError::InvalidResolution(s.to_string());
        let (height, width) = s.trim().split_once(['x', 'X', '*']).ok_or_else(invalid)?;
        Ok(Self {
            height: height.trim().parse().map_err(|_| invalid())?,
            width: width.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Clip length in whole seconds. Five-second clips render 121 frames and every other
/// length renders 241.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClipDuration {
    seconds: u32,
}

impl ClipDuration {
    pub const FIVE_SECONDS: Self = Self { seconds: 5 };
    pub const TEN_SECONDS: Self = Self { seconds: 10 };

    pub fn from_seconds(seconds: u32) -> Result<Self, PlannerError> {
        match seconds {
            0 => Err(PlannerError::InvalidDuration("0s".to_string())),
            seconds => Ok(Self { seconds }),
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn frames(&self) -> u32 {
        match self.seconds {
            5 => 121,
            _ => 241,
        }
    }
}

impl fmt::Display for ClipDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.seconds)
    }
}

impl FromStr for ClipDuration {
    type Err = PlannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let seconds = trimmed.strip_suffix('s').unwrap_or(trimmed);
        seconds
            .parse()
            .map_err(|_| PlannerError::InvalidDuration(s.to_string()))
            .and_then(Self::from_seconds)
    }
}

impl TryFrom<String> for ClipDuration {
    type Error = PlannerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClipDuration> for String {
    fn from(duration: ClipDuration) -> Self {
        duration.to_string()
    }
}

/// Peak VRAM in GB for one generation. The fp8 and qint8 reductions are alternatives and
/// apply at most once.
pub fn estimate_vram(resolution: Resolution, duration: ClipDuration, mode: &VramConfig) -> f64 {
    let mut vram = BASE_VRAM_GB * (resolution.area() / BASE_AREA);
    if duration == ClipDuration::TEN_SECONDS {
        vram *= TEN_SECOND_FACTOR;
    }
    if mode.fp8 || mode.qint8 {
        vram *= QUANTIZED_FACTOR;
    }
    if mode.cpu_offload {
        vram *= OFFLOAD_FACTOR;
    }
    debug!(
        %resolution,
        %duration,
        frames = duration.frames(),
        mode = mode.mode,
        vram_gb = vram,
        "Estimated VRAM usage"
    );
    vram
}

/// Where device memory figures come from.
pub trait DeviceRuntime: Send + Sync {
    fn device_count(&self) -> Result<usize, PlannerError>;
    fn total_memory(&self, index: usize) -> Result<u64, PlannerError>;
    /// Must be answered live; callers never cache it.
    fn free_memory(&self, index: usize) -> Result<u64, PlannerError>;
}

impl<T: DeviceRuntime + ?Sized> DeviceRuntime for Box<T> {
    fn device_count(&self) -> Result<usize, PlannerError> {
        (**self).device_count()
    }

    fn total_memory(&self, index: usize) -> Result<u64, PlannerError> {
        (**self).total_memory(index)
    }

    fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        (**self).free_memory(index)
    }
}

impl<T: DeviceRuntime + ?Sized> DeviceRuntime for Arc<T> {
    fn device_count(&self) -> Result<usize, PlannerError> {
        (**self).device_count()
    }

    fn total_memory(&self, index: usize) -> Result<u64, PlannerError> {
        (**self).total_memory(index)
    }

    fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        (**self).free_memory(index)
    }
}

#[derive(Debug)]
struct StaticDevice {
    total: u64,
    free: AtomicU64,
}

/// A fleet described up front. Free memory can be changed at any time through
/// [`StaticRuntime::set_free_memory`].
#[derive(Debug, Default)]
pub struct StaticRuntime {
    devices: Vec<StaticDevice>,
}

impl StaticRuntime {
    /// Devices with the given total memory, all of it free.
    pub fn new(totals: impl IntoIterator<Item = u64>) -> Self {
        Self {
            devices: totals
                .into_iter()
                .map(|total| StaticDevice {
                    total,
                    free: AtomicU64::new(total),
                })
                .collect(),
        }
    }

    pub fn set_free_memory(&self, index: usize, bytes: u64) -> Result<(), PlannerError> {
        self.device(index)?.free.store(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn device(&self, index: usize) -> Result<&StaticDevice, PlannerError> {
        self.devices.get(index).ok_or(PlannerError::UnknownDevice {
            index,
            count: self.devices.len(),
        })
    }
}

impl DeviceRuntime for StaticRuntime {
    fn device_count(&self) -> Result<usize, PlannerError> {
        Ok(self.devices.len())
    }

    fn total_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.device(index)?.total)
    }

    fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.device(index)?.free.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetDevice {
    #[serde(default)]
    pub name: Option<String>,
    pub total_gb: f64,
    /// Defaults to `total_gb`.
    #[serde(default)]
    pub free_gb: Option<f64>,
}

/// A GPU fleet read from TOML:
///
/// ```toml
/// [[devices]]
/// name = "RTX 3090"
/// total_gb = 24.0
/// free_gb = 20.5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub devices: Vec<FleetDevice>,
}

impl FromStr for FleetConfig {
    type Err = PlannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, PlannerError> {
        std::fs::read_to_string(path)
            .map_err(|source| PlannerError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .parse()
    }

    pub fn into_runtime(self) -> StaticRuntime {
        let to_bytes = |gb: f64| (gb * GIB) as u64;
        let runtime = StaticRuntime::new(self.devices.iter().map(|d| to_bytes(d.total_gb)));
        for (device, state) in self.devices.iter().zip(&runtime.devices) {
            if let Some(free) = device.free_gb {
                state.free.store(to_bytes(free), Ordering::SeqCst);
            }
        }
        runtime
    }
}

/// Memory figures from NVML. Loads the driver library at runtime, so it builds anywhere
/// and fails at [`NvmlRuntime::new`] on machines without NVIDIA GPUs.
pub struct NvmlRuntime {
    nvml: Nvml,
    count: usize,
}

impl NvmlRuntime {
    pub fn new() -> Result<Self, PlannerError> {
        let nvml = Nvml::init().map_err(|e| PlannerError::Runtime(format!("NVML init: {e}")))?;
        let count = nvml
            .device_count()
            .map_err(|e| PlannerError::Runtime(format!("NVML device count: {e}")))?
            as usize;
        Ok(Self { nvml, count })
    }

    fn memory_info(&self, index: usize) -> Result<MemoryInfo, PlannerError> {
        if index >= self.count {
            return Err(PlannerError::UnknownDevice {
                index,
                count: self.count,
            });
        }
        self.nvml
            .device_by_index(index as u32)
            .and_then(|gpu| gpu.memory_info())
            .map_err(|e| PlannerError::Runtime(format!("NVML memory info for GPU {index}: {e}")))
    }
}

impl DeviceRuntime for NvmlRuntime {
    fn device_count(&self) -> Result<usize, PlannerError> {
        Ok(self.count)
    }

    fn total_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.memory_info(index)?.total)
    }

    fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.memory_info(index)?.free)
    }
}

/// Memory figures straight from the CUDA driver.
#[cfg(feature = "cuda")]
pub struct CudaRuntime {
    devices: Vec<Arc<cudarc::driver::CudaDevice>>,
}

#[cfg(feature = "cuda")]
impl CudaRuntime {
    pub fn new() -> Result<Self, PlannerError> {
        use cudarc::driver::CudaDevice;

        let count = CudaDevice::count().map_err(|e| PlannerError::Runtime(format!("{e:?}")))?;
        let devices = (0..count.max(0) as usize)
            .map(|ordinal| {
                CudaDevice::new(ordinal).map_err(|e| {
                    PlannerError::Runtime(format!("failed to open CUDA device {ordinal}: {e:?}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }

    /// `(free, total)` in bytes for one device.
    fn mem_info(&self, index: usize) -> Result<(u64, u64), PlannerError> {
        let device = self.devices.get(index).ok_or(PlannerError::UnknownDevice {
            index,
            count: self.devices.len(),
        })?;
        device
            .bind_to_thread()
            .map_err(|e| PlannerError::Runtime(format!("failed to bind device {index}: {e:?}")))?;
        let (free, total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| PlannerError::Runtime(format!("mem_get_info on {index}: {e:?}")))?;
        Ok((free as u64, total as u64))
    }
}

#[cfg(feature = "cuda")]
impl DeviceRuntime for CudaRuntime {
    fn device_count(&self) -> Result<usize, PlannerError> {
        Ok(self.devices.len())
    }

    fn total_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.mem_info(index)?.1)
    }

    fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        Ok(self.mem_info(index)?.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub total_bytes: u64,
}

impl DeviceInfo {
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }
}

/// Settings suggested by [`ResourcePlanner::recommend`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub vram_mode: &'static str,
    pub gpu_allocation: &'static str,
    pub reason: String,
    /// First device that fits, if any.
    pub device: Option<usize>,
    pub estimated_gb: f64,
}

/// Inventories devices once and answers placement questions about them.
#[derive(Debug)]
pub struct ResourcePlanner<R> {
    runtime: R,
    devices: Vec<DeviceInfo>,
}

impl<R: DeviceRuntime> ResourcePlanner<R> {
    pub fn new(runtime: R) -> Result<Self, PlannerError> {
        let count = runtime.device_count()?;
        let devices = (0..count)
            .map(|index| {
                Ok(DeviceInfo {
                    index,
                    total_bytes: runtime.total_memory(index)?,
                })
            })
            .collect::<Result<Vec<_>, PlannerError>>()?;
        info!("Resource planner initialized: {count} GPUs available");
        for device in &devices {
            info!("  GPU {}: {:.2} GB VRAM", device.index, device.total_gb());
        }
        Ok(Self { runtime, devices })
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Asks the runtime right now.
    pub fn free_memory(&self, index: usize) -> Result<u64, PlannerError> {
        self.device(index)?;
        self.runtime.free_memory(index)
    }

    fn device(&self, index: usize) -> Result<&DeviceInfo, PlannerError> {
        self.devices.get(index).ok_or(PlannerError::UnknownDevice {
            index,
            count: self.devices.len(),
        })
    }

    /// Device with the most free memory at this moment. Ties go to the lowest index.
    pub fn best_device(&self) -> Result<usize, PlannerError> {
        let mut best: Option<(usize, u64)> = None;
        for device in &self.devices {
            let free = self.runtime.free_memory(device.index)?;
            if best.map_or(true, |(_, most)| free > most) {
                best = Some((device.index, free));
            }
        }
        let (index, free) = best.ok_or(PlannerError::NoDevice)?;
        info!("Best GPU: {index} with {:.2} GB free", free as f64 / GIB);
        Ok(index)
    }

    /// [`choose_allocation`] against the inventoried device count.
    pub fn allocate(&self, requested: &str) -> &'static GpuAllocation {
        let allocation = choose_allocation(requested, self.device_count());
        info!("GPU allocation: {}", allocation.description);
        allocation
    }

    /// Unknown modes fall back to `standard`.
    pub fn vram_config(&self, mode: &str) -> &'static VramConfig {
        let config = vram_mode(mode).unwrap_or_else(|| {
            warn!("Unknown VRAM mode '{mode}', using 'standard'");
            &VRAM_MODES[0]
        });
        debug!("VRAM optimization: {}", config.description);
        config
    }

    pub fn estimate_vram(&self, resolution: Resolution, duration: ClipDuration, mode: &str) -> f64 {
        estimate_vram(resolution, duration, self.vram_config(mode))
    }

    /// Whether the estimate fits in the device's total memory.
    pub fn fits(
        &self,
        device: usize,
        resolution: Resolution,
        duration: ClipDuration,
        mode: &str,
    ) -> Result<bool, PlannerError> {
        let required = self.estimate_vram(resolution, duration, mode);
        Ok(self.holds(self.device(device)?, required))
    }

    fn holds(&self, device: &DeviceInfo, required: f64) -> bool {
        let available = device.total_gb();
        let fits = required <= available;
        debug!(
            "GPU {}: {available:.2} GB available, {required:.2} GB required - {}",
            device.index,
            if fits { "OK" } else { "INSUFFICIENT" }
        );
        fits
    }

    /// First device that can hold `mode`, with the estimate it was checked against.
    fn first_fit(
        &self,
        resolution: Resolution,
        duration: ClipDuration,
        mode: &str,
    ) -> (Option<usize>, f64) {
        let estimated_gb = self.estimate_vram(resolution, duration, mode);
        let device = self
            .devices
            .iter()
            .find(|d| self.holds(d, estimated_gb))
            .map(|d| d.index);
        (device, estimated_gb)
    }

    /// First of `standard`, `fp8`, `fp8_offload` that some device can hold, falling back
    /// to `ultra_low` on a single device when none can.
    pub fn recommend(&self, resolution: Resolution, duration: ClipDuration) -> Recommendation {
        let candidates = [
            ("standard", "auto"),
            ("fp8", "auto"),
            ("fp8_offload", "single"),
        ];
        for (mode, allocation) in candidates {
            let (device, estimated_gb) = self.first_fit(resolution, duration, mode);
            if let Some(device) = device {
                let reason = match mode {
                    "standard" => {
                        format!("GPU {device} has sufficient VRAM for standard mode")
                    }
                    "fp8" => "Requires FP8 quantization".to_string(),
                    _ => "Requires FP8 + CPU offload".to_string(),
                };
                return Recommendation {
                    vram_mode: mode,
                    gpu_allocation: allocation,
                    reason,
                    device: Some(device),
                    estimated_gb,
                };
            }
        }
        let (device, estimated_gb) = self.first_fit(resolution, duration, "ultra_low");
        Recommendation {
            vram_mode: "ultra_low",
            gpu_allocation: "single",
            reason: "Requires ultra low VRAM mode".to_string(),
            device,
            estimated_gb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    fn planner(totals_gb: &[u64]) -> ResourcePlanner<StaticRuntime> {
        ResourcePlanner::new(StaticRuntime::new(totals_gb.iter().map(|gb| gb * GB))).unwrap()
    }

    fn square() -> Resolution {
        Resolution::new(720, 720)
    }

    #[test]
    fn test_estimate_vram() {
        let mode = |name| vram_mode(name).unwrap();
        assert_eq!(
            estimate_vram(square(), ClipDuration::FIVE_SECONDS, mode("standard")),
            80.0
        );
        assert_eq!(
            estimate_vram(square(), ClipDuration::TEN_SECONDS, mode("fp8")),
            36.0
        );
        // qint8 without fp8 still only applies the reduction once
        let ultra_low = estimate_vram(square(), ClipDuration::FIVE_SECONDS, mode("ultra_low"));
        assert!((ultra_low - 80.0 * 0.3 * 0.4).abs() < 1e-9);
        let wide = estimate_vram(
            Resolution::new(720, 1280),
            ClipDuration::FIVE_SECONDS,
            mode("standard"),
        );
        assert!((wide - 80.0 * 1280.0 / 720.0).abs() < 1e-9);
        // both quantization flags would still be a single reduction
        let both = VramConfig {
            qint8: true,
            ..*mode("fp8")
        };
        assert!((estimate_vram(square(), ClipDuration::FIVE_SECONDS, &both) - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_vram_mode_is_standard() {
        let planner = planner(&[24]);
        assert_eq!(planner.vram_config("turbo").mode, "standard");
        assert_eq!(
            planner.estimate_vram(square(), ClipDuration::FIVE_SECONDS, "turbo"),
            80.0
        );
    }

    #[test]
    fn test_choose_allocation() {
        assert_eq!(choose_allocation("auto", 1).mode, "single");
        assert_eq!(choose_allocation("auto", 2).mode, "multi_2");
        assert_eq!(choose_allocation("auto", 3).mode, "single");
        assert_eq!(choose_allocation("auto", 4).mode, "multi_4");
        assert_eq!(choose_allocation("auto", 8).mode, "multi_4");
        assert_eq!(choose_allocation("auto", 0).mode, "single");
        assert_eq!(choose_allocation("multi_8", 8).mode, "multi_8");
        assert_eq!(choose_allocation("multi_8", 2).mode, "multi_2");
        assert_eq!(choose_allocation("multi_4", 3).mode, "single");
        assert_eq!(choose_allocation("fsdp", 3).mode, "fsdp");
        assert_eq!(
            choose_allocation("fsdp", 1).fsdp_strategy,
            Some(ShardingStrategy::FullShard)
        );
        assert_eq!(choose_allocation("banana", 2).mode, "multi_2");
        assert_eq!(planner(&[24, 24]).allocate("multi_8").mode, "multi_2");
    }

    #[test]
    fn test_best_device_reads_free_memory_live() -> anyhow::Result<()> {
        let planner = planner(&[24, 48, 24]);
        assert_eq!(planner.best_device()?, 1);

        planner.runtime().set_free_memory(1, 2 * GB)?;
        planner.runtime().set_free_memory(2, 30 * GB)?;
        assert_eq!(planner.best_device()?, 2);
        assert_eq!(planner.free_memory(2)?, 30 * GB);

        // ties go to the lowest index
        planner.runtime().set_free_memory(0, 30 * GB)?;
        assert_eq!(planner.best_device()?, 0);

        assert!(matches!(
            self::planner(&[]).best_device(),
            Err(PlannerError::NoDevice)
        ));
        Ok(())
    }

    #[test]
    fn test_fits() -> anyhow::Result<()> {
        let planner = planner(&[80, 24]);
        assert!(planner.fits(0, square(), ClipDuration::FIVE_SECONDS, "standard")?);
        assert!(!planner.fits(1, square(), ClipDuration::FIVE_SECONDS, "standard")?);
        assert!(planner.fits(1, square(), ClipDuration::FIVE_SECONDS, "fp8")?);
        assert!(matches!(
            planner.fits(2, square(), ClipDuration::FIVE_SECONDS, "fp8"),
            Err(PlannerError::UnknownDevice { index: 2, count: 2 })
        ));
        Ok(())
    }

    #[test]
    fn test_recommend() {
        let rec = planner(&[80]).recommend(square(), ClipDuration::FIVE_SECONDS);
        assert_eq!((rec.vram_mode, rec.gpu_allocation), ("standard", "auto"));
        assert_eq!(rec.device, Some(0));

        // 36 GB needed for fp8 at 10s, 14.4 with offload
        let rec = planner(&[24, 40]).recommend(square(), ClipDuration::TEN_SECONDS);
        assert_eq!((rec.vram_mode, rec.gpu_allocation), ("fp8", "auto"));
        assert_eq!(rec.device, Some(1));

        let rec = planner(&[16]).recommend(square(), ClipDuration::TEN_SECONDS);
        assert_eq!((rec.vram_mode, rec.gpu_allocation), ("fp8_offload", "single"));

        let rec = planner(&[8]).recommend(square(), ClipDuration::TEN_SECONDS);
        assert_eq!((rec.vram_mode, rec.gpu_allocation), ("ultra_low", "single"));
        assert_eq!(rec.device, None);

        let rec = planner(&[]).recommend(square(), ClipDuration::FIVE_SECONDS);
        assert_eq!(rec.vram_mode, "ultra_low");
    }

    #[test]
    fn test_parse_workload() -> anyhow::Result<()> {
        assert_eq!("720x1280".parse::<Resolution>()?, Resolution::new(720, 1280));
        assert_eq!("960*960".parse::<Resolution>()?.to_string(), "960x960");
        assert!("720".parse::<Resolution>().is_err());
        assert_eq!("10s".parse::<ClipDuration>()?, ClipDuration::TEN_SECONDS);
        assert_eq!(ClipDuration::FIVE_SECONDS.frames(), 121);
        assert_eq!(ClipDuration::TEN_SECONDS.frames(), 241);
        assert_eq!(serde_json::to_string(&ClipDuration::TEN_SECONDS)?, "\"10s\"");
        assert!("0s".parse::<ClipDuration>().is_err());
        assert!("long".parse::<ClipDuration>().is_err());
        Ok(())
    }

    #[test]
    fn test_other_durations_render_long_clips() -> anyhow::Result<()> {
        let seven: ClipDuration = "7s".parse()?;
        assert_eq!((seven.seconds(), seven.frames()), (7, 241));
        assert_eq!(serde_json::from_str::<ClipDuration>("\"20s\"")?.frames(), 241);
        assert!(serde_json::from_str::<ClipDuration>("\"soon\"").is_err());

        // only ten-second clips pay the long-clip factor
        let standard = vram_mode("standard").unwrap();
        let five = estimate_vram(square(), ClipDuration::FIVE_SECONDS, standard);
        assert_eq!(estimate_vram(square(), seven, standard), five);
        assert_eq!(estimate_vram(square(), ClipDuration::TEN_SECONDS, standard), five * 1.5);
        Ok(())
    }

    #[test]
    fn test_recommend_agrees_with_fits() -> anyhow::Result<()> {
        let planner = planner(&[16, 40]);
        for duration in [ClipDuration::FIVE_SECONDS, ClipDuration::TEN_SECONDS] {
            let rec = planner.recommend(square(), duration);
            let device = rec.device.expect("a 40 GB card holds an fp8 run");
            assert!(planner.fits(device, square(), duration, rec.vram_mode)?);
            let earlier = (0..device)
                .any(|d| planner.fits(d, square(), duration, rec.vram_mode).unwrap_or(false));
            assert!(!earlier);
        }
        Ok(())
    }

    #[test]
    fn test_fleet_config() -> anyhow::Result<()> {
        let fleet: FleetConfig = r#"
            [[devices]]
            name = "RTX 3090"
            total_gb = 24.0
            free_gb = 4.0

            [[devices]]
            total_gb = 16.0
        "#
        .parse()?;
        assert_eq!(fleet.devices.len(), 2);
        let planner = ResourcePlanner::new(fleet.into_runtime())?;
        assert_eq!(planner.devices()[0].total_bytes, 24 * GB);
        assert_eq!(planner.best_device()?, 1);

        let dir = tempfile::tempdir()?;
        assert!(matches!(
            FleetConfig::load(&dir.path().join("fleet.toml")),
            Err(PlannerError::Io { .. })
        ));
        assert!(matches!(
            "devices = 3".parse::<FleetConfig>(),
            Err(PlannerError::Fleet(_))
        ));
        Ok(())
    }
}
