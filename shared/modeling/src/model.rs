use crate::lora::LoraLinear;

use std::collections::BTreeMap;
use tch::{nn, nn::ModuleT, Device, Kind, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no layer named {0}")]
    UnknownLayer(String),

    #[error("layer {0} already exists")]
    DuplicateLayer(String),

    #[error("layer {0} is not a linear projection")]
    NotLinear(String),

    #[error("block {0} does not contain any layer")]
    EmptyBlock(String),
}

/// A named submodule of a [`ModelGraph`].
#[derive(Debug)]
pub enum Layer {
    Linear(nn::Linear),
    Adapted(LoraLinear),
    /// Anything that isn't a projection: norms, embeddings, modulation tables.
    Params(BTreeMap<String, Tensor>),
}

impl Layer {
    /// Parameters owned by this layer, keyed by local name. Adapter factors are not
    /// model parameters and are excluded.
    pub fn parameters(&self) -> Vec<(String, Tensor)> {
        match self {
            Layer::Linear(linear) => linear_parameters(linear),
            Layer::Adapted(adapted) => linear_parameters(adapted.base()),
            Layer::Params(params) => params
                .iter()
                .map(|(name, t)| (name.clone(), t.shallow_clone()))
                .collect(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        fn linear_mut(linear: &mut nn::Linear) -> Vec<(String, &mut Tensor)> {
            let mut params = vec![("weight".to_string(), &mut linear.ws)];
            if let Some(bs) = linear.bs.as_mut() {
                params.push(("bias".to_string(), bs));
            }
            params
        }
        match self {
            Layer::Linear(linear) => linear_mut(linear),
            Layer::Adapted(adapted) => linear_mut(adapted.base_mut()),
            Layer::Params(params) => params.iter_mut().map(|(k, v)| (k.clone(), v)).collect(),
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, Layer::Linear(_))
    }
}

fn linear_parameters(linear: &nn::Linear) -> Vec<(String, Tensor)> {
    let mut params = vec![("weight".to_string(), linear.ws.shallow_clone())];
    if let Some(bs) = &linear.bs {
        params.push(("bias".to_string(), bs.shallow_clone()));
    }
    params
}

/// A model as a flat map of dotted layer identifiers, plus the list of repeated blocks
/// that sharding wraps as units.
#[derive(Debug, Default)]
pub struct ModelGraph {
    layers: BTreeMap<String, Layer>,
    blocks: Vec<String>,
    buffers: BTreeMap<String, Tensor>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_layer(&mut self, id: impl Into<String>, layer: Layer) -> Result<(), ModelError> {
        let id = id.into();
        if self.layers.contains_key(&id) {
            return Err(ModelError::DuplicateLayer(id));
        }
        self.layers.insert(id, layer);
        Ok(())
    }

    /// Inserts a `[out, in]` projection initialized uniformly in `±1/√in`.
    pub fn linear(
        &mut self,
        id: impl Into<String>,
        in_features: i64,
        out_features: i64,
        bias: bool,
        device: Device,
    ) -> Result<(), ModelError> {
        let _guard = tch::no_grad_guard();
        let bound = 1.0 / (in_features as f64).sqrt();
        let options = (Kind::Float, device);
        let mut ws = Tensor::empty([out_features, in_features], options);
        let _ = ws.uniform_(-bound, bound);
        let bs = bias.then(|| {
            let mut bs = Tensor::empty([out_features], options);
            let _ = bs.uniform_(-bound, bound);
            bs
        });
        self.insert_layer(id, Layer::Linear(nn::Linear { ws, bs }))
    }

    /// Marks `prefix` as a repeated block. Every layer under `prefix.` belongs to it.
    pub fn declare_block(&mut self, prefix: impl Into<String>) -> Result<(), ModelError> {
        let prefix = prefix.into();
        if !self.layers.keys().any(|id| is_under(id, &prefix)) {
            return Err(ModelError::EmptyBlock(prefix));
        }
        if !self.blocks.contains(&prefix) {
            self.blocks.push(prefix);
        }
        Ok(())
    }

    pub fn blocks(&self) -> &[String] {
        &self.blocks
    }

    pub fn block_of(&self, id: &str) -> Option<&str> {
        self.blocks
            .iter()
            .find(|prefix| is_under(id, prefix))
            .map(String::as_str)
    }

    pub fn insert_buffer(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.buffers.insert(name.into(), tensor);
    }

    pub fn buffers(&self) -> &BTreeMap<String, Tensor> {
        &self.buffers
    }

    pub(crate) fn buffers_mut(&mut self) -> impl Iterator<Item = (&String, &mut Tensor)> {
        self.buffers.iter_mut()
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.get(id)
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.layers.iter().map(|(id, layer)| (id.as_str(), layer))
    }

    /// Replaces the layer at `id` with whatever `edit` builds from it.
    pub fn replace_layer(
        &mut self,
        id: &str,
        edit: impl FnOnce(Layer) -> Layer,
    ) -> Result<(), ModelError> {
        let layer = self
            .layers
            .remove(id)
            .ok_or_else(|| ModelError::UnknownLayer(id.to_string()))?;
        self.layers.insert(id.to_string(), edit(layer));
        Ok(())
    }

    /// `(layer.param, tensor)` pairs in identifier order.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.layers
            .iter()
            .flat_map(|(id, layer)| {
                layer
                    .parameters()
                    .into_iter()
                    .map(move |(name, t)| (format!("{id}.{name}"), t))
            })
            .collect()
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.layers
            .iter_mut()
            .flat_map(|(id, layer)| {
                layer
                    .parameters_mut()
                    .into_iter()
                    .map(move |(name, t)| (format!("{id}.{name}"), t))
            })
            .collect()
    }

    pub fn num_parameters(&self) -> i64 {
        self.named_parameters().iter().map(|(_, t)| t.numel() as i64).sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.named_parameters()
            .iter()
            .map(|(_, t)| tensor_bytes(t))
            .sum()
    }

    pub fn device(&self) -> Device {
        self.named_parameters()
            .first()
            .map(|(_, t)| t.device())
            .unwrap_or(Device::Cpu)
    }

    pub fn forward_linear(&self, id: &str, xs: &Tensor) -> Result<Tensor, ModelError> {
        match self.layers.get(id) {
            Some(Layer::Linear(linear)) => Ok(xs.apply(linear)),
            Some(Layer::Adapted(adapted)) => Ok(adapted.forward_t(xs, false)),
            Some(Layer::Params(_)) => Err(ModelError::NotLinear(id.to_string())),
            None => Err(ModelError::UnknownLayer(id.to_string())),
        }
    }

    /// A stack of transformer blocks with attention projections `q,k,v,o`, a two-layer
    /// feed-forward, per-block norms, a patch embedding and an output head.
    pub fn transformer(
        num_blocks: usize,
        hidden: i64,
        ffn_hidden: i64,
        device: Device,
    ) -> Result<Self, ModelError> {
        let mut model = Self::new();
        model.linear("patch_embedding", hidden, hidden, true, device)?;
        for i in 0..num_blocks {
            let block = format!("layers.{i}");
            for proj in ["q", "k", "v", "o"] {
                model.linear(format!("{block}.self_attn.{proj}"), hidden, hidden, true, device)?;
            }
            model.linear(format!("{block}.ffn.0"), hidden, ffn_hidden, true, device)?;
            model.linear(format!("{block}.ffn.2"), ffn_hidden, hidden, true, device)?;
            model.insert_layer(
                format!("{block}.norm"),
                Layer::Params(BTreeMap::from([
                    ("weight".to_string(), Tensor::ones([hidden], (Kind::Float, device))),
                    ("bias".to_string(), Tensor::zeros([hidden], (Kind::Float, device))),
                ])),
            )?;
            model.declare_block(block)?;
        }
        model.linear("head", hidden, hidden, false, device)?;
        model.insert_buffer(
            "freqs",
            Tensor::arange(hidden / 2, (Kind::Double, device)) / (hidden / 2) as f64,
        );
        Ok(model)
    }
}

#[cfg(test)]
impl ModelGraph {
    /// Overwrites every parameter with a deterministic ramp shifted by `offset`, so each
    /// rank of a multi-rank test can build the same model without sharing an RNG.
    pub(crate) fn fill_deterministic(&mut self, offset: f64) {
        let _guard = tch::no_grad_guard();
        for (i, (_, tensor)) in self.parameters_mut().into_iter().enumerate() {
            let numel = tensor.numel() as i64;
            let ramp = (Tensor::arange(numel, (Kind::Float, tensor.device())) * 0.001 + i as f64)
                .sin()
                + offset;
            tensor.copy_(&ramp.reshape(tensor.size()).to_kind(tensor.kind()));
        }
    }
}

fn is_under(id: &str, prefix: &str) -> bool {
    id == prefix
        || id
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub(crate) fn tensor_bytes(tensor: &Tensor) -> u64 {
    tensor.numel() as u64 * tensor.kind().elt_size_in_bytes() as u64
}
