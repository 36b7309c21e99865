//! Low-rank adapters: the adapted linear layer and the registry that applies named
//! adapters to a [`ModelGraph`].

use crate::{
    model::{Layer, ModelError, ModelGraph},
    safetensor_utils::{
        load_safetensors, save_tensors_into_safetensors, LoadSafetensorsError,
        SaveSafetensorsError,
    },
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tch::{nn, nn::Module, nn::ModuleT, Device, Kind, Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_TARGET_MODULES: [&str; 4] = ["q", "k", "v", "o"];
pub const LORA_PRESETS: [&str; 3] = ["lightning", "quality", "balanced"];

/// Factor tensors keyed `"{layer}.lora_A"` / `"{layer}.lora_B"`.
pub type AdapterWeights = BTreeMap<String, Tensor>;

#[derive(Debug, Error)]
pub enum LoraError {
    #[error("LoRA adapter not found: {0}")]
    NotFound(PathBuf),

    #[error("adapter {0} not loaded")]
    NotLoaded(String),

    #[error("adapter factor {name} has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("invalid rank {0}, must be positive")]
    InvalidRank(i64),

    #[error("unknown LoRA preset {0}, choose from {LORA_PRESETS:?}")]
    UnknownPreset(String),

    #[error(transparent)]
    Load(#[from] LoadSafetensorsError),

    #[error(transparent)]
    Save(#[from] SaveSafetensorsError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

fn lora_a_key(layer: &str) -> String {
    format!("{layer}.lora_A")
}

fn lora_b_key(layer: &str) -> String {
    format!("{layer}.lora_B")
}

/// Kaiming-uniform with `a = √5` for an `[in, rank]` factor: torch computes fan-in from
/// the second dimension, which reduces the bound to `1 / √rank`.
fn kaiming_uniform(shape: [i64; 2], kind: Kind, device: Device) -> Tensor {
    let bound = 1.0 / (shape[1] as f64).sqrt();
    let mut t = Tensor::empty(shape, (kind, device));
    let _ = t.uniform_(-bound, bound);
    t
}

/// The adapter path `dropout(x · A · B · scaling)`.
#[derive(Debug)]
pub struct LoraLayer {
    pub lora_a: Tensor,
    pub lora_b: Tensor,
    pub scaling: f64,
    pub dropout: f64,
}

impl LoraLayer {
    pub fn rank(&self) -> i64 {
        self.lora_a.size()[1]
    }

    /// The adapter's contribution in `[out, in]` weight layout.
    pub fn delta_weight(&self) -> Tensor {
        (self.lora_a.matmul(&self.lora_b) * self.scaling).tr()
    }
}

impl ModuleT for LoraLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        (xs.matmul(&self.lora_a).matmul(&self.lora_b) * self.scaling).dropout(self.dropout, train)
    }
}

/// A base projection plus one adapter. While merged, the adapter lives inside the base
/// weight and the adapter path is skipped.
#[derive(Debug)]
pub struct LoraLinear {
    base: nn::Linear,
    lora: LoraLayer,
    merged: bool,
}

impl LoraLinear {
    /// Wraps `base` with a fresh adapter that contributes nothing until trained or loaded.
    pub fn new(base: nn::Linear, rank: i64, alpha: f64, dropout: f64) -> Result<Self, LoraError> {
        if rank <= 0 {
            return Err(LoraError::InvalidRank(rank));
        }
        Ok(Self::fresh(base, rank, alpha, dropout))
    }

    fn fresh(base: nn::Linear, rank: i64, alpha: f64, dropout: f64) -> Self {
        let (out_features, in_features) = out_in(&base);
        let (kind, device) = (base.ws.kind(), base.ws.device());
        let lora_a = kaiming_uniform([in_features, rank], kind, device);
        let lora_b = Tensor::zeros([rank, out_features], (kind, device));
        Self::with_factors(base, lora_a, lora_b, alpha, dropout)
    }

    /// Wraps `base` with existing factors. `A` must be `[in, rank]` and `B` `[rank, out]`.
    pub fn from_parts(
        base: nn::Linear,
        lora_a: Tensor,
        lora_b: Tensor,
        alpha: f64,
        dropout: f64,
    ) -> Result<Self, LoraError> {
        let rank = lora_a.size().get(1).copied().unwrap_or(0);
        check_factors("lora_A", "lora_B", &base, &lora_a, &lora_b, rank)?;
        Ok(Self::with_factors(base, lora_a, lora_b, alpha, dropout))
    }

    fn with_factors(
        base: nn::Linear,
        lora_a: Tensor,
        lora_b: Tensor,
        alpha: f64,
        dropout: f64,
    ) -> Self {
        let (kind, device) = (base.ws.kind(), base.ws.device());
        let rank = lora_a.size()[1];
        Self {
            lora: LoraLayer {
                lora_a: lora_a.to_device(device).to_kind(kind),
                lora_b: lora_b.to_device(device).to_kind(kind),
                scaling: alpha / rank as f64,
                dropout,
            },
            base,
            merged: false,
        }
    }

    pub fn base(&self) -> &nn::Linear {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut nn::Linear {
        &mut self.base
    }

    pub fn lora(&self) -> &LoraLayer {
        &self.lora
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Folds the adapter into the base weight. No-op when already merged.
    pub fn merge(&mut self) {
        if self.merged {
            return;
        }
        let _guard = tch::no_grad_guard();
        let delta = self.lora.delta_weight().to_kind(self.base.ws.kind());
        let _ = self.base.ws.g_add_(&delta);
        self.merged = true;
    }

    /// Takes the adapter back out of the base weight. No-op when not merged.
    pub fn unmerge(&mut self) {
        if !self.merged {
            return;
        }
        let _guard = tch::no_grad_guard();
        let delta = self.lora.delta_weight().to_kind(self.base.ws.kind());
        let _ = self.base.ws.g_sub_(&delta);
        self.merged = false;
    }

    /// Unmerges and returns the bare base projection.
    pub fn into_base(mut self) -> nn::Linear {
        self.unmerge();
        self.base
    }
}

impl ModuleT for LoraLinear {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let base = self.base.forward(xs);
        match self.merged {
            true => base,
            false => base + self.lora.forward_t(xs, train),
        }
    }
}

fn out_in(base: &nn::Linear) -> (i64, i64) {
    let size = base.ws.size();
    (size[0], size[1])
}

fn check_factors(
    a_name: &str,
    b_name: &str,
    base: &nn::Linear,
    lora_a: &Tensor,
    lora_b: &Tensor,
    rank: i64,
) -> Result<(), LoraError> {
    if rank <= 0 {
        return Err(LoraError::InvalidRank(rank));
    }
    let (out_features, in_features) = out_in(base);
    for (name, tensor, expected) in [
        (a_name, lora_a, vec![in_features, rank]),
        (b_name, lora_b, vec![rank, out_features]),
    ] {
        if tensor.size() != expected {
            return Err(LoraError::Shape {
                name: name.to_string(),
                expected,
                actual: tensor.size(),
            });
        }
    }
    Ok(())
}

/// Hyperparameters for applying an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: i64,
    pub alpha: f64,
    pub target_modules: Vec<String>,
    pub dropout: f64,
    pub merge: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 4,
            alpha: 1.0,
            target_modules: DEFAULT_TARGET_MODULES.map(String::from).to_vec(),
            dropout: 0.0,
            merge: true,
        }
    }
}

impl LoraConfig {
    pub fn preset(name: &str) -> Result<Self, LoraError> {
        let (rank, alpha, targets, dropout, merge): (_, _, &[&str], _, _) = match name {
            // merged for fast inference
            "lightning" => (4, 4.0, &["q", "v"], 0.0, true),
            "quality" => (16, 16.0, &["q", "k", "v", "o"], 0.1, false),
            "balanced" => (8, 8.0, &["q", "v", "o"], 0.05, true),
            _ => return Err(LoraError::UnknownPreset(name.to_string())),
        };
        Ok(Self {
            rank,
            alpha,
            target_modules: targets.iter().map(|t| t.to_string()).collect(),
            dropout,
            merge,
        })
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// Registry of named adapters with at most one of them applied to a model at a time.
#[derive(Debug, Default)]
pub struct LoraManager {
    adapters: BTreeMap<String, AdapterWeights>,
    active: Option<String>,
}

impl LoraManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the adapter at `path` into slot `name`, replacing whatever was there.
    pub fn load(&mut self, name: &str, path: &Path) -> Result<(), LoraError> {
        info!(adapter = name, path = %path.display(), "Loading LoRA adapter");
        let weights = load_safetensors(path, Device::Cpu).map_err(|err| match err {
            LoadSafetensorsError::NotFound(path) => LoraError::NotFound(path),
            err => LoraError::Load(err),
        })?;
        self.register(name, weights);
        Ok(())
    }

    pub fn register(&mut self, name: &str, weights: AdapterWeights) {
        self.adapters.insert(name.to_string(), weights);
    }

    pub fn adapter(&self, name: &str) -> Option<&AdapterWeights> {
        self.adapters.get(name)
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn active_adapter(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Wraps every linear layer whose identifier contains one of `target_modules` with
    /// adapter `name`. An empty target list means [`DEFAULT_TARGET_MODULES`]. Any
    /// adapter already active is removed first. Returns the number of adapted layers.
    pub fn apply(
        &mut self,
        model: &mut ModelGraph,
        name: &str,
        target_modules: &[String],
        rank: i64,
        alpha: f64,
        merge: bool,
    ) -> Result<usize, LoraError> {
        let config = LoraConfig {
            rank,
            alpha,
            target_modules: target_modules.to_vec(),
            dropout: 0.0,
            merge,
        };
        self.apply_config(model, name, &config)
    }

    pub fn apply_config(
        &mut self,
        model: &mut ModelGraph,
        name: &str,
        config: &LoraConfig,
    ) -> Result<usize, LoraError> {
        let weights = self
            .adapters
            .get(name)
            .ok_or_else(|| LoraError::NotLoaded(name.to_string()))?;
        if config.rank <= 0 {
            return Err(LoraError::InvalidRank(config.rank));
        }
        let targets: Vec<&str> = match config.target_modules.is_empty() {
            true => DEFAULT_TARGET_MODULES.to_vec(),
            false => config.target_modules.iter().map(String::as_str).collect(),
        };

        // every factor is validated before the model is touched
        let mut planned = Vec::new();
        for (id, layer) in model.layers() {
            // layers adapted by the adapter being replaced are unwrapped before editing
            let base = match layer {
                Layer::Linear(base) => base,
                Layer::Adapted(adapted) => adapted.base(),
                Layer::Params(_) => continue,
            };
            if !targets.iter().any(|target| id.contains(target)) {
                continue;
            }
            let (a_key, b_key) = (lora_a_key(id), lora_b_key(id));
            let factors = match (weights.get(&a_key), weights.get(&b_key)) {
                (Some(a), Some(b)) => {
                    check_factors(&a_key, &b_key, base, a, b, config.rank)?;
                    Some((a.shallow_clone(), b.shallow_clone()))
                }
                _ => None,
            };
            planned.push((id.to_string(), factors));
        }

        if let Some(previous) = self.active.clone() {
            debug!(previous = %previous, next = name, "replacing active adapter");
            self.remove(model)?;
        }

        let mut loaded = 0;
        let adapted_layers = planned.len();
        for (id, factors) in planned {
            model.replace_layer(&id, |layer| match layer {
                Layer::Linear(base) => {
                    let mut adapted = match factors {
                        Some((a, b)) => {
                            loaded += 1;
                            LoraLinear::with_factors(base, a, b, config.alpha, config.dropout)
                        }
                        None => LoraLinear::fresh(base, config.rank, config.alpha, config.dropout),
                    };
                    if config.merge {
                        adapted.merge();
                    }
                    Layer::Adapted(adapted)
                }
                other => other,
            })?;
        }

        self.active = Some(name.to_string());
        info!(
            adapter = name,
            layers = adapted_layers,
            loaded,
            merged = config.merge,
            "Applied LoRA adapter"
        );
        Ok(adapted_layers)
    }

    /// Unmerges and unwraps every adapted layer. No-op when nothing is active.
    pub fn remove(&mut self, model: &mut ModelGraph) -> Result<(), LoraError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let adapted: Vec<String> = model
            .layers()
            .filter(|(_, layer)| matches!(layer, Layer::Adapted(_)))
            .map(|(id, _)| id.to_string())
            .collect();
        for id in &adapted {
            model.replace_layer(id, |layer| match layer {
                Layer::Adapted(adapted) => Layer::Linear(adapted.into_base()),
                other => other,
            })?;
        }
        info!(adapter = %active, layers = adapted.len(), "Removed LoRA adapter");
        Ok(())
    }

    /// Writes the factors of every adapted layer to `path` and registers them as `name`.
    /// A model without adapted layers registers an empty adapter and writes no file.
    pub fn save(&mut self, model: &ModelGraph, name: &str, path: &Path) -> Result<(), LoraError> {
        let weights: AdapterWeights = model
            .layers()
            .filter_map(|(id, layer)| match layer {
                Layer::Adapted(adapted) => Some([
                    (lora_a_key(id), adapted.lora().lora_a.copy()),
                    (lora_b_key(id), adapted.lora().lora_b.copy()),
                ]),
                _ => None,
            })
            .flatten()
            .collect();
        match weights.is_empty() {
            true => warn!(
                adapter = name,
                path = %path.display(),
                "No adapted layers, nothing written"
            ),
            false => {
                save_tensors_into_safetensors(&weights, path)?;
                info!(adapter = name, path = %path.display(), tensors = weights.len(), "Saved LoRA adapter");
            }
        }
        self.register(name, weights);
        Ok(())
    }
}
