//! Llama decoder with adapter-aware projections.
//!
//! Every attention and MLP projection is a [`LoraLinear`], so the same graph
//! serves 4-bit adapter training, inference with a KV cache and the dense
//! full-precision reload used for merging. Embeddings, norms and the LM head
//! are always dense; norms run in f32.

use std::collections::HashMap;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Embedding, Linear, Module, RmsNorm, VarBuilder, VarMap};
use candle_transformers::models::llama::Config;

use crate::config::{AdapterConfig, QuantizationConfig, LLAMA_PROJECTIONS};
use crate::error::{HeartGptError, Result};
use crate::lora::{BaseWeight, LoraLinear, LoraWeights};

/// Rotary tables, causal masks and the per-layer KV cache.
pub struct Cache {
    cos: Tensor,
    sin: Tensor,
    kvs: Vec<Option<(Tensor, Tensor)>>,
    masks: HashMap<usize, Tensor>,
    use_kv_cache: bool,
    device: Device,
}

impl Cache {
    /// Precompute rotary embeddings for every position the model supports.
    ///
    /// # Errors
    /// Returns error if tensor creation fails.
    pub fn new(use_kv_cache: bool, dtype: DType, config: &Config, device: &Device) -> Result<Self> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        #[allow(clippy::cast_precision_loss)]
        let theta: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        let theta = Tensor::from_vec(theta, (head_dim / 2,), device)?;

        #[allow(clippy::cast_possible_truncation)]
        let idx_theta = Tensor::arange(0, config.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.max_position_embeddings, 1))?
            .matmul(&theta.reshape((1, theta.elem_count()))?)?;

        Ok(Self {
            cos: idx_theta.cos()?.to_dtype(dtype)?,
            sin: idx_theta.sin()?.to_dtype(dtype)?,
            kvs: vec![None; config.num_hidden_layers],
            masks: HashMap::new(),
            use_kv_cache,
            device: device.clone(),
        })
    }

    fn mask(&mut self, t: usize) -> Result<Tensor> {
        if let Some(mask) = self.masks.get(&t) {
            return Ok(mask.clone());
        }
        let mask: Vec<u8> = (0..t)
            .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
            .collect();
        let mask = Tensor::from_slice(&mask, (t, t), &self.device)?;
        self.masks.insert(t, mask.clone());
        Ok(mask)
    }

    /// Drop cached keys and values before a new sequence.
    pub fn reset(&mut self) {
        for kv in &mut self.kvs {
            *kv = None;
        }
    }

    // Fused `rope` has no backward pass.
    fn apply_rotary_emb(&self, x: &Tensor, index_pos: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = x.dims4()?;
        let cos = self.cos.narrow(0, index_pos, seq_len)?;
        let sin = self.sin.narrow(0, index_pos, seq_len)?;
        Ok(candle_nn::rotary_emb::rope_slow(x, &cos, &sin)?)
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.shape().dims())?;
    Ok(mask.where_cond(&on_true, on_false)?)
}

/// How projections are materialised while the model is built.
#[derive(Clone, Copy)]
pub struct ProjectionPlan<'a> {
    /// 4-bit settings for frozen projections, `None` keeps them dense.
    pub quantization: Option<&'a QuantizationConfig>,
    /// Adapter settings and the map holding the trainable tensors.
    pub adapter: Option<(&'a AdapterConfig, &'a VarMap)>,
    /// Dtype of activations and dense weights.
    pub compute_dtype: DType,
}

impl ProjectionPlan<'_> {
    /// Plain dense model without adapters.
    #[must_use]
    pub fn dense(compute_dtype: DType) -> Self {
        Self {
            quantization: None,
            adapter: None,
            compute_dtype,
        }
    }

    fn build(
        &self,
        vb: &VarBuilder,
        name: &str,
        module_path: &str,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<LoraLinear> {
        let weight = vb.pp(name).get((out_dim, in_dim), "weight")?;
        let base = BaseWeight::new(weight, self.quantization)?;
        let adapter = match self.adapter {
            Some((config, varmap)) if config.targets(name) => Some(LoraWeights::init(
                varmap,
                module_path,
                in_dim,
                out_dim,
                config,
                vb.device(),
            )?),
            _ => None,
        };
        Ok(LoraLinear::new(base, adapter, self.compute_dtype))
    }
}

/// RMS norm evaluated in f32 with a differentiable kernel.
#[derive(Debug, Clone)]
struct Norm {
    weight: Tensor,
    eps: f64,
}

impl Norm {
    fn load(size: usize, eps: f64, vb: &VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?.to_dtype(DType::F32)?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        // forward_diff keeps the graph; the fused kernel has no backward.
        let y = RmsNorm::new(self.weight.clone(), self.eps).forward_diff(&x.to_dtype(DType::F32)?)?;
        Ok(y.to_dtype(dtype)?)
    }
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_attention_heads: usize,
    num_key_value_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    fn load(vb: &VarBuilder, layer_idx: usize, config: &Config, plan: &ProjectionPlan) -> Result<Self> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        let size_q = head_dim * config.num_attention_heads;
        let size_kv = head_dim * config.num_key_value_heads;
        let h = config.hidden_size;
        let path = |name: &str| format!("model.layers.{layer_idx}.self_attn.{name}");
        Ok(Self {
            q_proj: plan.build(vb, "q_proj", &path("q_proj"), h, size_q)?,
            k_proj: plan.build(vb, "k_proj", &path("k_proj"), h, size_kv)?,
            v_proj: plan.build(vb, "v_proj", &path("v_proj"), h, size_kv)?,
            o_proj: plan.build(vb, "o_proj", &path("o_proj"), size_q, h)?,
            num_attention_heads: config.num_attention_heads,
            num_key_value_heads: config.num_key_value_heads,
            head_dim,
            hidden_size: h,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;
        let q = self.q_proj.forward(x, train)?;
        let k = self.k_proj.forward(x, train)?;
        let v = self.v_proj.forward(x, train)?;

        let q = q
            .reshape((b_sz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut v = v
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = cache.apply_rotary_emb(&q, index_pos)?;
        let mut k = cache.apply_rotary_emb(&k, index_pos)?;

        if cache.use_kv_cache {
            if let Some((cache_k, cache_v)) = &cache.kvs[block_idx] {
                k = Tensor::cat(&[cache_k, &k], 2)?.contiguous()?;
                v = Tensor::cat(&[cache_v, &v], 2)?.contiguous()?;
            }
            cache.kvs[block_idx] = Some((k.clone(), v.clone()));
        }

        let n_rep = self.num_attention_heads / self.num_key_value_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?;

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        #[allow(clippy::cast_precision_loss)]
        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = if seq_len == 1 {
            att
        } else {
            let mask = cache.mask(seq_len)?.broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v.contiguous()?)?.to_dtype(in_dtype)?;
        let y = y.transpose(1, 2)?.reshape((b_sz, seq_len, self.hidden_size))?;

        self.o_proj.forward(&y, train)
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(vb: &VarBuilder, layer_idx: usize, config: &Config, plan: &ProjectionPlan) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        let path = |name: &str| format!("model.layers.{layer_idx}.mlp.{name}");
        Ok(Self {
            gate_proj: plan.build(vb, "gate_proj", &path("gate_proj"), h, i)?,
            up_proj: plan.build(vb, "up_proj", &path("up_proj"), h, i)?,
            down_proj: plan.build(vb, "down_proj", &path("down_proj"), i, h)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, train)?)?;
        let up = self.up_proj.forward(x, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

struct Block {
    attention: Attention,
    mlp: Mlp,
    input_layernorm: Norm,
    post_attention_layernorm: Norm,
}

impl Block {
    fn load(vb: &VarBuilder, layer_idx: usize, config: &Config, plan: &ProjectionPlan) -> Result<Self> {
        Ok(Self {
            attention: Attention::load(&vb.pp("self_attn"), layer_idx, config, plan)?,
            mlp: Mlp::load(&vb.pp("mlp"), layer_idx, config, plan)?,
            input_layernorm: Norm::load(
                config.hidden_size,
                config.rms_norm_eps,
                &vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: Norm::load(
                config.hidden_size,
                config.rms_norm_eps,
                &vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(x)?;
        let x = (x + self.attention.forward(&normed, index_pos, block_idx, cache, train)?)?;
        let normed = self.post_attention_layernorm.forward(&x)?;
        Ok((&x + self.mlp.forward(&normed, train)?)?)
    }

    fn projections(&self) -> [(&'static str, &LoraLinear); 7] {
        [
            ("self_attn.q_proj", &self.attention.q_proj),
            ("self_attn.k_proj", &self.attention.k_proj),
            ("self_attn.v_proj", &self.attention.v_proj),
            ("self_attn.o_proj", &self.attention.o_proj),
            ("mlp.gate_proj", &self.mlp.gate_proj),
            ("mlp.up_proj", &self.mlp.up_proj),
            ("mlp.down_proj", &self.mlp.down_proj),
        ]
    }

    fn projection_mut(&mut self, name: &str) -> Option<&mut LoraLinear> {
        match name {
            "q_proj" => Some(&mut self.attention.q_proj),
            "k_proj" => Some(&mut self.attention.k_proj),
            "v_proj" => Some(&mut self.attention.v_proj),
            "o_proj" => Some(&mut self.attention.o_proj),
            "gate_proj" => Some(&mut self.mlp.gate_proj),
            "up_proj" => Some(&mut self.mlp.up_proj),
            "down_proj" => Some(&mut self.mlp.down_proj),
            _ => None,
        }
    }
}

/// Llama causal LM.
pub struct Llama {
    embed_tokens: Embedding,
    layers: Vec<Block>,
    norm: Norm,
    lm_head: Linear,
    config: Config,
    dtype: DType,
    device: Device,
}

impl Llama {
    /// Build the model from HF-layout weights.
    ///
    /// # Errors
    /// Returns error if a tensor is missing or has the wrong shape.
    pub fn load(vb: &VarBuilder, config: &Config, plan: &ProjectionPlan) -> Result<Self> {
        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )?;

        let vb_layers = vb.pp("model.layers");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            layers.push(Block::load(&vb_layers.pp(layer_idx), layer_idx, config, plan)?);
            tracing::debug!("Loaded layer {}/{}", layer_idx + 1, config.num_hidden_layers);
        }

        let norm = Norm::load(config.hidden_size, config.rms_norm_eps, &vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            Linear::new(
                vb.pp("lm_head")
                    .get((config.vocab_size, config.hidden_size), "weight")?,
                None,
            )
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            config: config.clone(),
            dtype: plan.compute_dtype,
            device: vb.device().clone(),
        })
    }

    /// Model hyperparameters.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Activation dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device holding the weights.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// A fresh cache matching this model.
    ///
    /// # Errors
    /// Returns error if the rotary tables cannot be built.
    pub fn new_cache(&self, use_kv_cache: bool) -> Result<Cache> {
        Cache::new(use_kv_cache, self.dtype, &self.config, &self.device)
    }

    fn hidden_states(
        &self,
        input_ids: &Tensor,
        index_pos: usize,
        cache: &mut Cache,
        train: bool,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if index_pos + seq_len > self.config.max_position_embeddings {
            return Err(HeartGptError::Model(format!(
                "sequence of {} tokens exceeds max_position_embeddings {}",
                index_pos + seq_len,
                self.config.max_position_embeddings
            )));
        }
        let mut x = self.embed_tokens.forward(input_ids)?;
        for (block_idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, index_pos, block_idx, cache, train)?;
        }
        self.norm.forward(&x)
    }

    /// Logits for every position, `[batch, seq, vocab]` in f32.
    ///
    /// # Errors
    /// Returns error on shape mismatch.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        index_pos: usize,
        cache: &mut Cache,
        train: bool,
    ) -> Result<Tensor> {
        let x = self.hidden_states(input_ids, index_pos, cache, train)?;
        Ok(self.lm_head.forward(&x)?.to_dtype(DType::F32)?)
    }

    /// Logits for the last position only, `[batch, vocab]` in f32.
    ///
    /// # Errors
    /// Returns error on shape mismatch.
    pub fn forward_last(&self, input_ids: &Tensor, index_pos: usize, cache: &mut Cache) -> Result<Tensor> {
        let x = self.hidden_states(input_ids, index_pos, cache, false)?;
        let seq_len = x.dim(1)?;
        let last = x.i((.., seq_len - 1, ..))?.contiguous()?;
        Ok(self.lm_head.forward(&last)?.to_dtype(DType::F32)?)
    }

    /// Whether any projection is stored in 4-bit.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.layers
            .iter()
            .flat_map(Block::projections)
            .any(|(_, p)| p.base().is_quantized())
    }

    /// Adapted projections keyed by module path (`model.layers.{i}.self_attn.q_proj`).
    #[must_use]
    pub fn adapters(&self) -> Vec<(String, &LoraWeights)> {
        let mut out = Vec::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for (name, proj) in layer.projections() {
                if let Some(adapter) = proj.adapter() {
                    out.push((format!("model.layers.{idx}.{name}"), adapter));
                }
            }
        }
        out
    }

    /// Fold an adapter into the dense projection `name` of layer `layer_idx`.
    ///
    /// # Errors
    /// Returns error if the layer or projection does not exist, or the base is 4-bit.
    pub fn merge_projection(&mut self, layer_idx: usize, name: &str, adapter: &LoraWeights) -> Result<()> {
        let layer = self.layers.get_mut(layer_idx).ok_or_else(|| {
            HeartGptError::Model(format!("layer {layer_idx} out of range"))
        })?;
        let proj = layer
            .projection_mut(name)
            .ok_or_else(|| HeartGptError::Model(format!("unknown projection '{name}'")))?;
        proj.merge_adapter(adapter)
    }

    /// Every weight in HF tensor naming, with adapters folded in.
    ///
    /// # Errors
    /// Returns error if a weight cannot be dequantized.
    pub fn named_weights(&self) -> Result<Vec<(String, Tensor)>> {
        let mut out = Vec::with_capacity(self.layers.len() * 9 + 3);
        out.push((
            "model.embed_tokens.weight".to_string(),
            self.embed_tokens.embeddings().clone(),
        ));
        for (idx, layer) in self.layers.iter().enumerate() {
            for (name, proj) in layer.projections() {
                out.push((format!("model.layers.{idx}.{name}.weight"), proj.merged_weight()?));
            }
            out.push((
                format!("model.layers.{idx}.input_layernorm.weight"),
                layer.input_layernorm.weight.to_dtype(self.dtype)?,
            ));
            out.push((
                format!("model.layers.{idx}.post_attention_layernorm.weight"),
                layer.post_attention_layernorm.weight.to_dtype(self.dtype)?,
            ));
        }
        out.push(("model.norm.weight".to_string(), self.norm.weight.to_dtype(self.dtype)?));
        if !self.config.tie_word_embeddings {
            out.push(("lm_head.weight".to_string(), self.lm_head.weight().clone()));
        }
        Ok(out)
    }
}

/// Split a PEFT module path into layer index and projection name.
///
/// `model.layers.3.self_attn.q_proj` gives `(3, "q_proj")`.
#[must_use]
pub fn parse_module_path(path: &str) -> Option<(usize, &str)> {
    let rest = path.strip_prefix("model.layers.")?;
    let (idx, rest) = rest.split_once('.')?;
    let name = rest.rsplit('.').next()?;
    if !LLAMA_PROJECTIONS.contains(&name) {
        return None;
    }
    Some((idx.parse().ok()?, name))
}
