//! Fully-sharded placement of a [`ModelGraph`] over a process group.
//!
//! Parameters are flattened, zero-padded to a multiple of the group size and split into
//! one contiguous chunk per rank. A unit's full parameters only exist while it is being
//! computed on (see [`ShardedModel::with_unit`]); the rest of the time the model holds
//! zero-storage placeholders of the right shape.

use crate::{
    collectives::{stage_to_device, CollectiveTransport},
    model::{tensor_bytes, ModelError, ModelGraph},
    parallelism::{CommError, Group},
};

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use tch::{Device, Kind, Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Trailing unit holding every parameter not claimed by a wrap unit.
pub const ROOT_UNIT: &str = "root";

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Debug, Error)]
pub enum ShardingError {
    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no wrap unit named {0}")]
    UnknownUnit(String),

    #[error("no sharded parameter named {0}")]
    UnknownParameter(String),

    #[error("gradient for {name} has shape {actual:?}, parameter is {expected:?}")]
    GradientShape {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("unknown sharding strategy {0}")]
    UnknownStrategy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardingStrategy {
    /// Shard parameters, gradients and optimizer state.
    FullShard,
    /// Replicate parameters, shard gradients and optimizer state.
    #[serde(alias = "GRAD_OP_SHARD")]
    ShardGradOp,
    /// Full sharding inside a shard group, replicated across groups.
    HybridShard,
}

impl ShardingStrategy {
    pub fn shards_parameters(&self) -> bool {
        !matches!(self, ShardingStrategy::ShardGradOp)
    }
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingStrategy::FullShard => write!(f, "FULL_SHARD"),
            ShardingStrategy::ShardGradOp => write!(f, "SHARD_GRAD_OP"),
            ShardingStrategy::HybridShard => write!(f, "HYBRID_SHARD"),
        }
    }
}

impl FromStr for ShardingStrategy {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "FULL_SHARD" => Ok(ShardingStrategy::FullShard),
            "SHARD_GRAD_OP" | "GRAD_OP_SHARD" => Ok(ShardingStrategy::ShardGradOp),
            "HYBRID_SHARD" => Ok(ShardingStrategy::HybridShard),
            _ => Err(ShardingError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Picks a strategy from how much of a device the per-device share of the model would
/// occupy: under half favors speed, under 80% favors memory, anything else needs
/// hybrid sharding with offload.
pub fn choose_strategy(
    num_devices: usize,
    model_size_bytes: u64,
    available_bytes_per_device: u64,
) -> ShardingStrategy {
    let per_device = model_size_bytes as f64 / num_devices.max(1) as f64;
    let available = available_bytes_per_device as f64;
    let strategy = if per_device < available * 0.5 {
        ShardingStrategy::ShardGradOp
    } else if per_device < available * 0.8 {
        ShardingStrategy::FullShard
    } else {
        ShardingStrategy::HybridShard
    };
    info!(
        num_devices,
        per_device_gb = per_device / GIB,
        available_gb = available / GIB,
        %strategy,
        "Chose sharding strategy"
    );
    strategy
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    Fp16,
    Fp32,
}

impl Precision {
    pub fn kind(&self) -> Kind {
        match self {
            Precision::Bf16 => Kind::BFloat16,
            Precision::Fp16 => Kind::Half,
            Precision::Fp32 => Kind::Float,
        }
    }
}

/// Storage dtype for parameters, accumulation dtype for gradient reduction and dtype for
/// buffers, kept separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedPrecision {
    pub param_dtype: Precision,
    pub reduce_dtype: Precision,
    pub buffer_dtype: Precision,
}

impl Default for MixedPrecision {
    fn default() -> Self {
        Self {
            param_dtype: Precision::Bf16,
            reduce_dtype: Precision::Fp32,
            buffer_dtype: Precision::Fp32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub strategy: ShardingStrategy,
    #[serde(default)]
    pub mixed_precision: MixedPrecision,
    #[serde(default)]
    pub cpu_offload: bool,
    #[serde(default)]
    pub activation_recompute: bool,
    #[serde(default)]
    pub requires_grad: bool,
    #[serde(default = "default_sync_module_states")]
    pub sync_module_states: bool,
}

fn default_sync_module_states() -> bool {
    true
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self::inference(ShardingStrategy::FullShard, false)
    }
}

impl ShardingConfig {
    pub fn inference(strategy: ShardingStrategy, cpu_offload: bool) -> Self {
        Self {
            strategy,
            mixed_precision: MixedPrecision::default(),
            cpu_offload,
            activation_recompute: false,
            requires_grad: false,
            sync_module_states: default_sync_module_states(),
        }
    }

    /// Inference config for `model` on `num_devices` cards, sizing the model as bf16 and
    /// assuming 20 GiB usable per device.
    pub fn auto(model: &ModelGraph, num_devices: usize, cpu_offload: bool) -> Self {
        let model_size_bytes = model.num_parameters() as u64 * 2;
        let available = 20 * (1u64 << 30);
        Self::inference(
            choose_strategy(num_devices, model_size_bytes, available),
            cpu_offload,
        )
    }
}

/// Chooses which submodules become wrap units.
#[derive(Clone, Default)]
pub enum WrapPolicy {
    /// The model's declared repeated blocks.
    #[default]
    Blocks,
    /// Submodules whose dotted identifier satisfies the predicate. The outermost match
    /// of a layer wins.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for WrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapPolicy::Blocks => write!(f, "Blocks"),
            WrapPolicy::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl WrapPolicy {
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        WrapPolicy::Predicate(Arc::new(f))
    }

    fn unit_of(&self, model: &ModelGraph, layer_id: &str) -> Option<String> {
        match self {
            WrapPolicy::Blocks => model.block_of(layer_id).map(str::to_string),
            WrapPolicy::Predicate(predicate) => {
                let mut prefix = String::new();
                for part in layer_id.split('.') {
                    if !prefix.is_empty() {
                        prefix.push('.');
                    }
                    prefix.push_str(part);
                    if predicate(&prefix) {
                        return Some(prefix);
                    }
                }
                None
            }
        }
    }
}

#[derive(Debug)]
struct ShardedParam {
    name: String,
    shape: Vec<i64>,
    numel: i64,
    /// This rank's flat chunk, or the full parameter when it isn't sharded.
    local: Tensor,
    sharded: bool,
}

#[derive(Debug)]
struct WrapUnit {
    name: String,
    params: Vec<ShardedParam>,
}

/// Output of [`ShardedModel::run_unit`], with what is needed to recompute it when
/// activations were not kept.
#[derive(Debug)]
pub struct Checkpoint {
    unit: String,
    input: Tensor,
}

impl Checkpoint {
    pub fn unit(&self) -> &str {
        &self.unit
    }
}

#[derive(Debug)]
pub struct UnitOutput {
    pub output: Tensor,
    pub checkpoint: Option<Checkpoint>,
}

/// Per-rank parameter memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub world_size: usize,
    pub local_param_bytes: u64,
    pub full_param_bytes: u64,
    pub offloaded: bool,
}

impl MemoryStats {
    pub fn savings(&self) -> f64 {
        match self.full_param_bytes {
            0 => 0.0,
            full => 1.0 - self.local_param_bytes as f64 / full as f64,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShardingPlanner {
    config: ShardingConfig,
    wrap_policy: WrapPolicy,
    replicate_group: Option<Group>,
}

impl ShardingPlanner {
    pub fn new(config: ShardingConfig) -> Self {
        Self {
            config,
            wrap_policy: WrapPolicy::default(),
            replicate_group: None,
        }
    }

    pub fn with_wrap_policy(mut self, wrap_policy: WrapPolicy) -> Self {
        self.wrap_policy = wrap_policy;
        self
    }

    /// Group of ranks holding the same shard, used by [`ShardingStrategy::HybridShard`].
    pub fn with_replicate_group(mut self, group: Group) -> Self {
        self.replicate_group = Some(group);
        self
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Partitions `model` across `group`. Every rank of the group must call this with a
    /// model of identical structure.
    pub fn shard(
        &self,
        mut model: ModelGraph,
        group: Option<Group>,
    ) -> Result<ShardedModel, ShardingError> {
        let mut config = self.config.clone();
        if config.activation_recompute && !config.requires_grad {
            warn!("activation recompute needs gradients, disabling it for inference");
            config.activation_recompute = false;
        }
        let replicate_group = match config.strategy {
            ShardingStrategy::HybridShard => self.replicate_group.clone(),
            _ => None,
        };
        let transport = CollectiveTransport::new(group.clone());
        let replicate = CollectiveTransport::new(replicate_group);
        let device = group.as_ref().map(|g| g.device()).unwrap_or(model.device());
        let (world_size, rank) = (transport.world_size(), transport.rank());
        let param_kind = config.mixed_precision.param_dtype.kind();
        let shard_params = config.strategy.shards_parameters() && world_size > 1;
        let home = match config.cpu_offload {
            true => Device::Cpu,
            false => device,
        };

        let _guard = tch::no_grad_guard();
        if config.sync_module_states {
            for (_, tensor) in model.parameters_mut() {
                sync_from_rank_zero(&transport, &replicate, tensor)?;
            }
        }

        let buffer_kind = config.mixed_precision.buffer_dtype.kind();
        for (_, buffer) in model.buffers_mut() {
            if config.sync_module_states {
                sync_from_rank_zero(&transport, &replicate, buffer)?;
            }
            *buffer = buffer.to_device(device).to_kind(buffer_kind);
        }

        let unit_names: Vec<Option<String>> = model
            .named_parameters()
            .iter()
            .map(|(name, _)| self.wrap_policy.unit_of(&model, layer_of(name)))
            .collect();
        let mut units: Vec<WrapUnit> = Vec::new();
        let mut root = WrapUnit {
            name: ROOT_UNIT.to_string(),
            params: Vec::new(),
        };
        for ((name, tensor), unit_name) in model.parameters_mut().into_iter().zip(unit_names) {
            let shape = tensor.size();
            let numel = tensor.numel() as i64;
            let full = tensor.to_kind(param_kind);
            let local = match shard_params {
                true => {
                    let chunk = chunk_len(numel, world_size as i64);
                    pad_flat(&full, chunk * world_size as i64)
                        .narrow(0, rank as i64 * chunk, chunk)
                        .copy()
                }
                false => full.copy(),
            }
            .to_device(home);
            *tensor = placeholder(&shape, param_kind);

            let param = ShardedParam {
                name,
                shape,
                numel,
                local,
                sharded: shard_params,
            };
            match unit_name {
                Some(unit_name) => match units.iter_mut().find(|u| u.name == unit_name) {
                    Some(unit) => unit.params.push(param),
                    None => units.push(WrapUnit {
                        name: unit_name,
                        params: vec![param],
                    }),
                },
                None => root.params.push(param),
            }
        }
        if !root.params.is_empty() {
            units.push(root);
        }

        let sharded = ShardedModel {
            model,
            transport,
            replicate,
            config,
            device,
            units,
        };
        let stats = sharded.memory_stats();
        info!(
            strategy = %sharded.config.strategy,
            world_size,
            rank,
            units = sharded.units.len(),
            offload = sharded.config.cpu_offload,
            local_mb = stats.local_param_bytes / (1 << 20),
            full_mb = stats.full_param_bytes / (1 << 20),
            "Sharded model"
        );
        Ok(sharded)
    }
}

fn layer_of(param_name: &str) -> &str {
    param_name
        .rsplit_once('.')
        .map(|(layer, _)| layer)
        .unwrap_or(param_name)
}

/// Zero-storage stand-in that still reports the parameter's shape.
fn placeholder(shape: &[i64], kind: Kind) -> Tensor {
    Tensor::from(0f32).to_kind(kind).expand(shape, false)
}

/// Per-rank chunk length of a parameter padded up to a multiple of `world_size`.
fn chunk_len(numel: i64, world_size: i64) -> i64 {
    (numel + world_size - 1) / world_size
}

fn pad_flat(tensor: &Tensor, len: i64) -> Tensor {
    let flat = tensor.reshape([-1]);
    let pad = len - flat.size()[0];
    match pad {
        0 => flat,
        pad => Tensor::cat(
            &[flat.shallow_clone(), Tensor::zeros([pad], (flat.kind(), flat.device()))],
            0,
        ),
    }
}

fn sync_from_rank_zero(
    transport: &CollectiveTransport,
    replicate: &CollectiveTransport,
    tensor: &mut Tensor,
) -> Result<(), CommError> {
    let synced = transport.efficient_broadcast(tensor, 0)?;
    let synced = replicate.efficient_broadcast(&synced, 0)?;
    tensor.copy_(&synced);
    Ok(())
}

/// A model partitioned over one process group (and, for hybrid sharding, replicated over
/// a second). Owns the model, so it cannot be sharded twice.
#[derive(Debug)]
pub struct ShardedModel {
    model: ModelGraph,
    transport: CollectiveTransport,
    replicate: CollectiveTransport,
    config: ShardingConfig,
    device: Device,
    units: Vec<WrapUnit>,
}

impl ShardedModel {
    pub fn strategy(&self) -> ShardingStrategy {
        self.config.strategy
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn mixed_precision(&self) -> MixedPrecision {
        self.config.mixed_precision
    }

    pub fn is_offloaded(&self) -> bool {
        self.config.cpu_offload
    }

    pub fn activation_recompute(&self) -> bool {
        self.config.activation_recompute
    }

    pub fn group(&self) -> Option<&Group> {
        self.transport.group()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Model structure. Parameters outside [`Self::with_unit`] are placeholders.
    pub fn model(&self) -> &ModelGraph {
        &self.model
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.name.as_str())
    }

    pub fn unit_parameters(&self, unit: &str) -> Result<Vec<&str>, ShardingError> {
        Ok(self
            .unit(unit)?
            .params
            .iter()
            .map(|p| p.name.as_str())
            .collect())
    }

    /// This rank's stored tensor for a parameter: a flat chunk when sharded.
    pub fn local_parameter(&self, name: &str) -> Result<&Tensor, ShardingError> {
        self.find_param(name).map(|p| &p.local)
    }

    fn unit(&self, name: &str) -> Result<&WrapUnit, ShardingError> {
        self.units
            .iter()
            .find(|u| u.name == name)
            .ok_or_else(|| ShardingError::UnknownUnit(name.to_string()))
    }

    fn find_param(&self, name: &str) -> Result<&ShardedParam, ShardingError> {
        self.units
            .iter()
            .flat_map(|u| &u.params)
            .find(|p| p.name == name)
            .ok_or_else(|| ShardingError::UnknownParameter(name.to_string()))
    }

    fn gather_param(&self, param: &ShardedParam) -> Result<Tensor, ShardingError> {
        let staged = stage_to_device(&param.local, self.device);
        match param.sharded {
            true => Ok(self
                .transport
                .all_gather(&staged, 0)?
                .narrow(0, 0, param.numel)
                .reshape(&param.shape)),
            false => Ok(staged),
        }
    }

    /// Full parameters of one unit on this rank's device. Collective: every rank must
    /// gather the same unit.
    pub fn gather_unit(&self, unit: &str) -> Result<BTreeMap<String, Tensor>, ShardingError> {
        let _guard = tch::no_grad_guard();
        self.unit(unit)?
            .params
            .iter()
            .map(|p| Ok((p.name.clone(), self.gather_param(p)?)))
            .collect()
    }

    fn install(&mut self, mut full: BTreeMap<String, Tensor>) {
        for (name, tensor) in self.model.parameters_mut() {
            if let Some(gathered) = full.remove(&name) {
                *tensor = gathered;
            }
        }
    }

    fn evict(&mut self, unit: &str) {
        let shapes: BTreeMap<&str, &[i64]> = self
            .units
            .iter()
            .filter(|u| u.name == unit)
            .flat_map(|u| &u.params)
            .map(|p| (p.name.as_str(), p.shape.as_slice()))
            .collect();
        let kind = self.config.mixed_precision.param_dtype.kind();
        for (name, tensor) in self.model.parameters_mut() {
            if let Some(shape) = shapes.get(name.as_str()) {
                *tensor = placeholder(shape, kind);
            }
        }
    }

    /// Gathers `unit`, runs `f` against the model with that unit materialized, and frees
    /// the gathered parameters again.
    pub fn with_unit<R>(
        &mut self,
        unit: &str,
        f: impl FnOnce(&ModelGraph) -> R,
    ) -> Result<R, ShardingError> {
        let full = self.gather_unit(unit)?;
        self.install(full);
        let result = f(&self.model);
        self.evict(unit);
        Ok(result)
    }

    /// Runs one unit's forward. With activation recompute on, nothing is retained for
    /// backward and the returned [`Checkpoint`] can re-run the unit with grad enabled.
    pub fn run_unit<F>(
        &mut self,
        unit: &str,
        input: &Tensor,
        f: F,
    ) -> Result<UnitOutput, ShardingError>
    where
        F: Fn(&ModelGraph, &Tensor) -> Result<Tensor, ModelError>,
    {
        let recompute = self.config.activation_recompute;
        let output = self.with_unit(unit, |model| match recompute {
            true => {
                let _guard = tch::no_grad_guard();
                f(model, input)
            }
            false => f(model, input),
        })??;
        let checkpoint = recompute.then(|| Checkpoint {
            unit: unit.to_string(),
            input: input.detach(),
        });
        Ok(UnitOutput { output, checkpoint })
    }

    /// Re-runs a checkpointed unit with grad enabled. Returns the input leaf (which will
    /// receive the gradient) and the recomputed output.
    pub fn recompute<F>(
        &mut self,
        checkpoint: &Checkpoint,
        f: F,
    ) -> Result<(Tensor, Tensor), ShardingError>
    where
        F: Fn(&ModelGraph, &Tensor) -> Result<Tensor, ModelError>,
    {
        debug!(unit = checkpoint.unit, "recomputing activations");
        let input = checkpoint.input.detach().set_requires_grad(true);
        let output = self.with_unit(&checkpoint.unit, |model| f(model, &input))??;
        Ok((input, output))
    }

    /// Averages full-shape gradients over every rank and returns this rank's shard of
    /// each, in the reduce dtype. Collective: all ranks must pass the same names.
    pub fn reduce_gradients(
        &self,
        grads: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, Tensor>, ShardingError> {
        let _guard = tch::no_grad_guard();
        let reduce_kind = self.config.mixed_precision.reduce_dtype.kind();
        let world_size = self.transport.world_size() as i64;
        let replicas = self.replicate.world_size() as i64;
        let mut reduced = BTreeMap::new();
        for (name, grad) in grads {
            let param = self.find_param(name)?;
            if grad.size() != param.shape {
                return Err(ShardingError::GradientShape {
                    name: name.clone(),
                    expected: param.shape.clone(),
                    actual: grad.size(),
                });
            }
            let chunk = chunk_len(param.numel, world_size);
            let padded = pad_flat(&grad.to_kind(reduce_kind), chunk * world_size);
            let shard = self.transport.reduce_scatter_sum(&padded, 0)?;
            let shard = self.replicate.all_reduce_sum(&shard)?;
            reduced.insert(name.clone(), shard / (world_size * replicas) as f64);
        }
        Ok(reduced)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let params = self.units.iter().flat_map(|u| &u.params);
        let param_bytes = self
            .config
            .mixed_precision
            .param_dtype
            .kind()
            .elt_size_in_bytes() as u64;
        MemoryStats {
            world_size: self.world_size(),
            local_param_bytes: params.clone().map(|p| tensor_bytes(&p.local)).sum(),
            full_param_bytes: params.map(|p| p.numel as u64 * param_bytes).sum(),
            offloaded: self.config.cpu_offload,
        }
    }

    /// Gathers every unit, lets `f` edit the full model (e.g. apply an adapter), then
    /// re-partitions from the edited parameters. Every rank must make the same edit.
    pub fn with_full_model<R>(
        &mut self,
        f: impl FnOnce(&mut ModelGraph) -> R,
    ) -> Result<R, ShardingError> {
        let names: Vec<String> = self.units.iter().map(|u| u.name.clone()).collect();
        for unit in &names {
            let full = self.gather_unit(unit)?;
            self.install(full);
        }
        let result = f(&mut self.model);

        let _guard = tch::no_grad_guard();
        let (world_size, rank) = (self.world_size() as i64, self.transport.rank() as i64);
        let kind = self.config.mixed_precision.param_dtype.kind();
        let home = match self.config.cpu_offload {
            true => Device::Cpu,
            false => self.device,
        };
        let mut params: BTreeMap<String, &mut ShardedParam> = self
            .units
            .iter_mut()
            .flat_map(|u| u.params.iter_mut())
            .map(|p| (p.name.clone(), p))
            .collect();
        for (name, tensor) in self.model.parameters_mut() {
            let Some(param) = params.get_mut(&name) else {
                continue;
            };
            let full = tensor.to_kind(kind);
            param.local = match param.sharded {
                true => {
                    let chunk = chunk_len(param.numel, world_size);
                    pad_flat(&full, chunk * world_size)
                        .narrow(0, rank * chunk, chunk)
                        .copy()
                }
                false => full.copy(),
            }
            .to_device(home);
            *tensor = placeholder(&param.shape, kind);
        }
        Ok(result)
    }

    /// Gathers every unit and hands back the unsharded model on this rank's device.
    pub fn release(mut self) -> Result<ModelGraph, ShardingError> {
        let names: Vec<String> = self.units.iter().map(|u| u.name.clone()).collect();
        for unit in &names {
            let full = self.gather_unit(unit)?;
            self.install(full);
        }
        debug!(units = names.len(), "released sharded model");
        Ok(self.model)
    }
}
