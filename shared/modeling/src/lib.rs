mod collectives;
mod device_utils;
mod gpu_manager;
mod lora;
mod model;
mod parallelism;
mod placement;
mod safetensor_utils;
mod sharding;

pub use collectives::{
    optimal_sp_size, stage_to_device, AllToAll, BackwardTape, CollectiveTransport,
    CommunicationBuffer, DifferentiableOp,
};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use gpu_manager::{
    choose_allocation, estimate_vram, gpu_allocation, vram_mode, ClipDuration, DeviceInfo,
    DeviceRuntime, FleetConfig, FleetDevice, GpuAllocation, NvmlRuntime, PlannerError,
    Recommendation, Resolution, ResourcePlanner, StaticRuntime, VramConfig, GPU_ALLOCATIONS,
    VRAM_MODES,
};
#[cfg(feature = "cuda")]
pub use gpu_manager::CudaRuntime;
pub use lora::{
    AdapterWeights, LoraConfig, LoraError, LoraLayer, LoraLinear, LoraManager,
    DEFAULT_TARGET_MODULES, LORA_PRESETS,
};
pub use model::{Layer, ModelError, ModelGraph};
pub use parallelism::{
    run_local_ranks, CommError, Group, GroupId, HybridTopology, LocalGroup, LocalStore,
    ProcessGroup,
};
pub use placement::{EnginePlan, GenerationRequest};
pub use safetensor_utils::{
    load_safetensors, save_tensors_into_safetensors, LoadSafetensorsError, SaveSafetensorsError,
};
pub use sharding::{
    choose_strategy, Checkpoint, MemoryStats, MixedPrecision, Precision, ShardedModel,
    ShardingConfig, ShardingError, ShardingPlanner, ShardingStrategy, UnitOutput, WrapPolicy,
    ROOT_UNIT,
};
