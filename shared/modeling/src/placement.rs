use crate::{
    collectives::optimal_sp_size,
    device_utils::Devices,
    gpu_manager::{
        estimate_vram, ClipDuration, DeviceRuntime, GpuAllocation, PlannerError,
        ResourcePlanner, Resolution, VramConfig,
    },
    sharding::{choose_strategy, ShardingConfig, ShardingStrategy},
};

use serde::{Deserialize, Serialize};
use tracing::info;

/// What the job layer asks for. Unset modes are filled in by
/// [`ResourcePlanner::recommend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub resolution: Resolution,
    pub duration: ClipDuration,
    #[serde(default)]
    pub vram_mode: Option<String>,
    #[serde(default)]
    pub gpu_allocation: Option<String>,
    /// Token count of the sequence split by sequence parallelism, if known.
    #[serde(default)]
    pub sequence_length: Option<usize>,
}

impl GenerationRequest {
    pub fn new(resolution: Resolution, duration: ClipDuration) -> Self {
        Self {
            resolution,
            duration,
            vram_mode: None,
            gpu_allocation: None,
            sequence_length: None,
        }
    }
}

/// Everything the engine needs to place the generator for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnginePlan {
    pub vram: VramConfig,
    pub allocation: GpuAllocation,
    /// Inventory indices of the devices to run on, ascending.
    pub devices: Vec<usize>,
    pub sp_size: usize,
    pub estimated_gb: f64,
    pub reason: String,
    /// Present when the allocation shards the model.
    pub sharding: Option<ShardingConfig>,
}

impl EnginePlan {
    pub fn resolve<R: DeviceRuntime>(
        planner: &ResourcePlanner<R>,
        request: &GenerationRequest,
        model_size_bytes: u64,
    ) -> Result<Self, PlannerError> {
        let recommendation = match (&request.vram_mode, &request.gpu_allocation) {
            (Some(_), Some(_)) => None,
            _ => Some(planner.recommend(request.resolution, request.duration)),
        };
        let (vram_name, allocation_name, reason) = match &recommendation {
            None => (
                request.vram_mode.clone().unwrap_or_default(),
                request.gpu_allocation.clone().unwrap_or_default(),
                "requested by caller".to_string(),
            ),
            Some(rec) => (
                request
                    .vram_mode
                    .clone()
                    .unwrap_or_else(|| rec.vram_mode.to_string()),
                request
                    .gpu_allocation
                    .clone()
                    .unwrap_or_else(|| rec.gpu_allocation.to_string()),
                rec.reason.clone(),
            ),
        };

        let vram = *planner.vram_config(&vram_name);
        let allocation = *planner.allocate(&allocation_name);
        let devices = select_devices(planner, &allocation)?;

        let mut sp_size = allocation.sp_size.min(devices.len()).max(1);
        if let Some(sequence_length) = request.sequence_length {
            sp_size = optimal_sp_size(sp_size, sequence_length);
        }

        let sharding = match allocation.use_fsdp {
            true => {
                let smallest = devices
                    .iter()
                    .map(|&i| planner.devices()[i].total_bytes)
                    .min()
                    .unwrap_or(0);
                let strategy = choose_strategy(devices.len(), model_size_bytes, smallest);
                let offload = vram.cpu_offload || strategy == ShardingStrategy::HybridShard;
                Some(ShardingConfig::inference(strategy, offload))
            }
            false => None,
        };

        let plan = Self {
            estimated_gb: estimate_vram(request.resolution, request.duration, &vram),
            vram,
            allocation,
            devices,
            sp_size,
            reason,
            sharding,
        };
        info!(
            vram_mode = plan.vram.mode,
            allocation = plan.allocation.mode,
            devices = ?plan.devices,
            sp_size = plan.sp_size,
            strategy = ?plan.sharding.as_ref().map(|s| s.strategy),
            "Resolved engine plan"
        );
        Ok(plan)
    }

    pub fn world_size(&self) -> usize {
        self.devices.len()
    }

    pub fn torch_devices(&self) -> Devices {
        Devices::Cuda(self.devices.clone())
    }
}

/// The allocation's device count taken from the devices with the most free memory now.
/// Allocations without a fixed count use every device.
fn select_devices<R: DeviceRuntime>(
    planner: &ResourcePlanner<R>,
    allocation: &GpuAllocation,
) -> Result<Vec<usize>, PlannerError> {
    let best = planner.best_device()?;
    let count = match allocation.num_gpus {
        Some(1) => return Ok(vec![best]),
        Some(n) => n,
        None => planner.device_count(),
    };
    let mut by_free = planner
        .devices()
        .iter()
        .map(|d| Ok((d.index, planner.free_memory(d.index)?)))
        .collect::<Result<Vec<_>, PlannerError>>()?;
    // stable, so equal free memory keeps index order
    by_free.sort_by(|a, b| b.1.cmp(&a.1));
    let mut devices: Vec<usize> = by_free.into_iter().take(count).map(|(i, _)| i).collect();
    devices.sort_unstable();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_manager::StaticRuntime;

    const GB: u64 = 1 << 30;

    fn planner(totals_gb: &[u64]) -> ResourcePlanner<StaticRuntime> {
        ResourcePlanner::new(StaticRuntime::new(totals_gb.iter().map(|gb| gb * GB))).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(Resolution::new(720, 720), ClipDuration::FIVE_SECONDS)
    }

    #[test]
    fn test_recommended_plan() -> anyhow::Result<()> {
        let planner = planner(&[80, 80]);
        let plan = EnginePlan::resolve(&planner, &request(), 20 * GB)?;
        assert_eq!(plan.vram.mode, "standard");
        assert_eq!(plan.allocation.mode, "multi_2");
        assert_eq!(plan.devices, [0, 1]);
        assert_eq!(plan.sp_size, 2);
        assert_eq!(plan.estimated_gb, 80.0);
        assert!(plan.sharding.is_none());
        assert_eq!(plan.torch_devices().to_string(), "cuda:0,1");
        Ok(())
    }

    #[test]
    fn test_single_uses_best_device() -> anyhow::Result<()> {
        let planner = planner(&[24, 24, 24]);
        planner.runtime().set_free_memory(0, GB)?;
        planner.runtime().set_free_memory(1, 20 * GB)?;
        planner.runtime().set_free_memory(2, 5 * GB)?;
        let mut request = request();
        request.vram_mode = Some("fp8".into());
        request.gpu_allocation = Some("single".into());
        let plan = EnginePlan::resolve(&planner, &request, 0)?;
        assert_eq!(plan.devices, [1]);
        assert_eq!(plan.reason, "requested by caller");
        Ok(())
    }

    #[test]
    fn test_multi_picks_freest_devices() -> anyhow::Result<()> {
        let planner = planner(&[80, 80, 80, 80, 80]);
        planner.runtime().set_free_memory(1, GB)?;
        let mut request = request();
        request.gpu_allocation = Some("multi_4".into());
        request.sequence_length = Some(6);
        let plan = EnginePlan::resolve(&planner, &request, 0)?;
        assert_eq!(plan.devices, [0, 2, 3, 4]);
        // 6 tokens split evenly over at most 2 ranks
        assert_eq!(plan.sp_size, 2);
        Ok(())
    }

    #[test]
    fn test_fsdp_plan_derives_sharding() -> anyhow::Result<()> {
        let planner = planner(&[24, 16]);
        let mut request = request();
        request.vram_mode = Some("fp8_offload".into());
        request.gpu_allocation = Some("fsdp".into());

        // 7.5 GB per device is under half of the 16 GB card
        let plan = EnginePlan::resolve(&planner, &request, 15 * GB)?;
        let sharding = plan.sharding.clone().unwrap();
        assert_eq!(plan.devices, [0, 1]);
        assert_eq!(sharding.strategy, ShardingStrategy::ShardGradOp);
        assert!(sharding.cpu_offload);
        assert!(!sharding.activation_recompute);

        request.vram_mode = Some("fp8".into());
        let plan = EnginePlan::resolve(&planner, &request, 30 * GB)?;
        let sharding = plan.sharding.unwrap();
        assert_eq!(sharding.strategy, ShardingStrategy::HybridShard);
        assert!(sharding.cpu_offload);
        Ok(())
    }

    #[test]
    fn test_no_devices() {
        assert!(matches!(
            EnginePlan::resolve(&planner(&[]), &request(), 0),
            Err(PlannerError::NoDevice)
        ));
    }

    #[test]
    fn test_plan_serializes() -> anyhow::Result<()> {
        let plan = EnginePlan::resolve(&planner(&[40]), &request(), 0)?;
        let json = serde_json::to_value(&plan)?;
        assert_eq!(json["vram"]["mode"], "fp8");
        assert_eq!(json["allocation"]["mode"], "single");
        Ok(())
    }
}
