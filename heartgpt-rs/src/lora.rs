//! Linear projections with an optional low-rank adapter.
//!
//! A [`LoraLinear`] holds a frozen base weight `W` (dense or 4-bit) and, when
//! the projection is targeted, trainable matrices `A [r, in]` and
//! `B [out, r]`. The forward pass computes
//! `x·Wᵀ + (alpha / r) · dropout(x)·Aᵀ·Bᵀ`.
//!
//! `B` starts at zero so the adapted model initially matches the base model.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Linear, Module, VarMap};
use serde::{Deserialize, Serialize};

use crate::config::{AdapterConfig, BiasMode, QuantizationConfig, TaskType};
use crate::error::{HeartGptError, Result};
use crate::quantization::QuantizedWeight;

/// Prefix PEFT puts in front of every adapter tensor name.
pub const PEFT_PREFIX: &str = "base_model.model";
/// Adapter weights file inside an adapter directory.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// Adapter hyperparameters file inside an adapter directory.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Frozen base weight of a projection.
#[derive(Debug, Clone)]
pub enum BaseWeight {
    /// Full weight in the compute dtype.
    Dense(Tensor),
    /// Packed 4-bit weight, dequantized on every forward pass.
    Quantized(QuantizedWeight),
}

impl BaseWeight {
    /// Build the base weight, quantizing it when a quantization config is given.
    ///
    /// # Errors
    ///
    /// Returns an error if quantization fails.
    pub fn new(weight: Tensor, quantization: Option<&QuantizationConfig>) -> Result<Self> {
        match quantization {
            Some(config) if config.load_in_4bit => {
                Ok(Self::Quantized(QuantizedWeight::quantize(&weight, config)?))
            }
            _ => Ok(Self::Dense(weight)),
        }
    }

    /// Dense view of the weight in `dtype`.
    ///
    /// # Errors
    ///
    /// Returns an error if dequantization fails.
    pub fn dense(&self, dtype: DType) -> Result<Tensor> {
        match self {
            Self::Dense(w) => Ok(w.to_dtype(dtype)?),
            Self::Quantized(q) => q.dequantize(dtype),
        }
    }

    /// Whether the weight is stored in 4-bit.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

/// Trainable low-rank update.
#[derive(Debug, Clone)]
pub struct LoraWeights {
    /// Down projection `[r, in]`.
    pub a: Tensor,
    /// Up projection `[out, r]`.
    pub b: Tensor,
    /// `alpha / r`.
    pub scaling: f64,
    /// Dropout probability on the adapter input.
    pub dropout: f32,
}

impl LoraWeights {
    /// Register `A` and `B` for a projection in `varmap` under its PEFT names.
    ///
    /// `A` is drawn from `U(-1/sqrt(in), 1/sqrt(in))`, `B` is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the variables cannot be created.
    pub fn init(
        varmap: &VarMap,
        module_path: &str,
        in_dim: usize,
        out_dim: usize,
        config: &AdapterConfig,
        device: &Device,
    ) -> Result<Self> {
        #[allow(clippy::cast_precision_loss)]
        let bound = 1.0 / (in_dim as f64).sqrt();
        let a = varmap.get(
            (config.rank, in_dim),
            &lora_a_name(module_path),
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
            DType::F32,
            device,
        )?;
        let b = varmap.get(
            (out_dim, config.rank),
            &lora_b_name(module_path),
            candle_nn::init::ZERO,
            DType::F32,
            device,
        )?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            a,
            b,
            scaling: config.scaling(),
            dropout: config.dropout as f32,
        })
    }

    /// `scaling · B·A` as an `[out, in]` f32 tensor.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn delta(&self) -> Result<Tensor> {
        Ok((self.b.matmul(&self.a)? * self.scaling)?)
    }
}

/// PEFT tensor name of `lora_A` for a module such as `model.layers.0.self_attn.q_proj`.
#[must_use]
pub fn lora_a_name(module_path: &str) -> String {
    format!("{PEFT_PREFIX}.{module_path}.lora_A.weight")
}

/// PEFT tensor name of `lora_B`.
#[must_use]
pub fn lora_b_name(module_path: &str) -> String {
    format!("{PEFT_PREFIX}.{module_path}.lora_B.weight")
}

/// Module path of an adapter tensor name, the inverse of [`lora_a_name`].
#[must_use]
pub fn module_path_of(tensor_name: &str) -> Option<&str> {
    tensor_name
        .strip_prefix(PEFT_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".lora_A.weight")
}

/// `adapter_config.json` in the layout PEFT reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    /// Adapter rank.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: usize,
    /// Dropout used during training.
    pub lora_dropout: f64,
    /// Bias handling.
    pub bias: BiasMode,
    /// Task the adapter was trained for.
    pub task_type: TaskType,
    /// Adapted projections.
    pub target_modules: Vec<String>,
    /// Model the adapter was trained on.
    pub base_model_name_or_path: String,
    /// Always `LORA`.
    pub peft_type: String,
}

impl PeftAdapterConfig {
    /// Describe an adapter trained with `config` on `base_model`.
    #[must_use]
    pub fn new(config: &AdapterConfig, base_model: &str) -> Self {
        Self {
            r: config.rank,
            lora_alpha: config.alpha,
            lora_dropout: config.dropout,
            bias: config.bias,
            task_type: config.task_type,
            target_modules: config.target_modules.clone(),
            base_model_name_or_path: base_model.to_string(),
            peft_type: "LORA".to_string(),
        }
    }

    /// `lora_alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.r as f64
    }
}

/// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
///
/// `adapters` pairs module paths such as `model.layers.0.self_attn.q_proj`
/// with their weights.
///
/// # Errors
///
/// Returns an error if the directory or either file cannot be written.
pub fn save_adapter(
    dir: &Path,
    adapters: &[(String, &LoraWeights)],
    config: &PeftAdapterConfig,
) -> Result<()> {
    if adapters.is_empty() {
        return Err(HeartGptError::Checkpoint("model has no adapter to save".into()));
    }
    std::fs::create_dir_all(dir)?;

    let mut tensors: Vec<(String, Tensor)> = Vec::with_capacity(adapters.len() * 2);
    for (module_path, weights) in adapters {
        tensors.push((lora_a_name(module_path), weights.a.contiguous()?));
        tensors.push((lora_b_name(module_path), weights.b.contiguous()?));
    }
    let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
    safetensors::tensor::serialize_to_file(tensors, Some(metadata), &dir.join(ADAPTER_WEIGHTS_FILE))?;

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(dir.join(ADAPTER_CONFIG_FILE), json)?;

    tracing::info!("Saved {} adapted projections to {}", adapters.len(), dir.display());
    Ok(())
}

/// Read an adapter directory written by [`save_adapter`] or PEFT.
///
/// # Errors
///
/// Returns an error if either file is missing or malformed.
pub fn load_adapter(dir: &Path, device: &Device) -> Result<(PeftAdapterConfig, HashMap<String, Tensor>)> {
    let config_path = dir.join(ADAPTER_CONFIG_FILE);
    let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
    if !config_path.exists() || !weights_path.exists() {
        return Err(HeartGptError::Checkpoint(format!(
            "{} must contain {ADAPTER_CONFIG_FILE} and {ADAPTER_WEIGHTS_FILE}",
            dir.display()
        )));
    }
    let config: PeftAdapterConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
    if config.r == 0 {
        return Err(HeartGptError::Checkpoint("adapter rank is 0".into()));
    }
    let tensors = candle_core::safetensors::load(weights_path, device)?;
    Ok((config, tensors))
}

/// A Llama projection (no bias) with an optional adapter.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: BaseWeight,
    adapter: Option<LoraWeights>,
    compute_dtype: DType,
}

impl LoraLinear {
    /// Create a projection from its parts.
    #[must_use]
    pub fn new(base: BaseWeight, adapter: Option<LoraWeights>, compute_dtype: DType) -> Self {
        Self {
            base,
            adapter,
            compute_dtype,
        }
    }

    /// The frozen base weight.
    #[must_use]
    pub fn base(&self) -> &BaseWeight {
        &self.base
    }

    /// The adapter, if this projection is targeted.
    #[must_use]
    pub fn adapter(&self) -> Option<&LoraWeights> {
        self.adapter.as_ref()
    }

    /// Forward pass. Adapter dropout is only active when `train` is set.
    ///
    /// # Errors
    ///
    /// Returns an error on shape or dtype mismatch.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let weight = self.base.dense(self.compute_dtype)?;
        let base_out = Linear::new(weight, None).forward(x)?;
        let Some(adapter) = &self.adapter else {
            return Ok(base_out);
        };

        let x32 = x.to_dtype(DType::F32)?;
        let x32 = if train && adapter.dropout > 0.0 {
            candle_nn::ops::dropout(&x32, adapter.dropout)?
        } else {
            x32
        };
        let hidden = Linear::new(adapter.a.clone(), None).forward(&x32)?;
        let update = (Linear::new(adapter.b.clone(), None).forward(&hidden)? * adapter.scaling)?;
        let dtype = base_out.dtype();
        Ok((base_out + update.to_dtype(dtype)?)?)
    }

    /// `W + scaling·B·A` in the compute dtype.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be combined.
    pub fn merged_weight(&self) -> Result<Tensor> {
        let weight = self.base.dense(DType::F32)?;
        let merged = match &self.adapter {
            Some(adapter) => (weight + adapter.delta()?)?,
            None => weight,
        };
        Ok(merged.to_dtype(self.compute_dtype)?)
    }

    /// Fold an externally loaded adapter into a dense base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the base is quantized or the shapes disagree.
    pub fn merge_adapter(&mut self, adapter: &LoraWeights) -> Result<()> {
        let BaseWeight::Dense(weight) = &self.base else {
            return Err(HeartGptError::Model(
                "cannot merge an adapter into a 4-bit weight; reload at full precision".into(),
            ));
        };
        let delta = adapter.delta()?;
        if delta.dims() != weight.dims() {
            return Err(HeartGptError::Model(format!(
                "adapter delta {:?} does not match base weight {:?}",
                delta.dims(),
                weight.dims()
            )));
        }
        let merged = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
        self.base = BaseWeight::Dense(merged);
        Ok(())
    }
}
