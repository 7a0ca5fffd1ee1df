//! Folding a trained adapter into the full-precision base model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use serde_json::json;

use crate::error::{HeartGptError, Result};
use crate::llama::parse_module_path;
use crate::lora::{self, LoraWeights};
use crate::model::{LlamaModel, TextTokenizer, OPTIONAL_FILES};

/// Largest shard written by [`MergedModel::save_pretrained`].
pub const MAX_SHARD_BYTES: usize = 5_000_000_000;

/// Module path of projection `target` in layer `layer`.
#[must_use]
pub fn projection_path(layer: usize, target: &str) -> String {
    let block = match target {
        "gate_proj" | "up_proj" | "down_proj" => "mlp",
        _ => "self_attn",
    };
    format!("model.layers.{layer}.{block}.{target}")
}

/// Dense model with the adapter folded into its weights.
pub struct MergedModel {
    model: LlamaModel,
    merged_projections: usize,
}

/// Fold the adapter stored in `adapter_dir` into `base`.
///
/// `base` must be the dense reload; every projection listed in the
/// adapter's `target_modules` must have both tensors present.
///
/// # Errors
///
/// Returns an error if the adapter files are missing or malformed, a
/// tensor is absent, or shapes disagree.
pub fn merge_adapter(mut base: LlamaModel, adapter_dir: &Path) -> Result<MergedModel> {
    let device = base.llama().device().clone();
    let (peft, tensors) = lora::load_adapter(adapter_dir, &device)?;
    if peft.base_model_name_or_path != base.source().model_id {
        tracing::warn!(
            "adapter was trained on '{}', merging into '{}'",
            peft.base_model_name_or_path,
            base.source().model_id
        );
    }

    let scaling = peft.scaling();
    let num_layers = base.llama().config().num_hidden_layers;
    for name in tensors.keys() {
        let Some(path) = lora::module_path_of(name) else {
            continue;
        };
        match parse_module_path(path) {
            Some((layer, target)) if layer < num_layers && peft.target_modules.iter().any(|t| t == target) => {}
            _ => tracing::warn!("ignoring adapter tensor '{name}': not a listed target of this model"),
        }
    }
    let mut merged = 0;
    for layer in 0..num_layers {
        for target in &peft.target_modules {
            let path = projection_path(layer, target);
            let weights = LoraWeights {
                a: tensor(&tensors, &lora::lora_a_name(&path))?,
                b: tensor(&tensors, &lora::lora_b_name(&path))?,
                scaling,
                dropout: 0.0,
            };
            base.llama_mut().merge_projection(layer, target, &weights)?;
            merged += 1;
        }
    }

    tracing::info!(
        "Merged {} projections (r={}, alpha={}) from {}",
        merged,
        peft.r,
        peft.lora_alpha,
        adapter_dir.display()
    );
    Ok(MergedModel {
        model: base,
        merged_projections: merged,
    })
}

fn tensor(tensors: &HashMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .get(name)
        .cloned()
        .ok_or_else(|| HeartGptError::Checkpoint(format!("adapter tensor '{name}' is missing")))
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        _ => "float32",
    }
}

impl MergedModel {
    /// The merged network.
    #[must_use]
    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// Number of projections an adapter was folded into.
    #[must_use]
    pub fn merged_projections(&self) -> usize {
        self.merged_projections
    }

    /// Write the model in the HF layout and return the files written.
    ///
    /// Weights go to `model.safetensors`, or to numbered shards plus
    /// `model.safetensors.index.json` above [`MAX_SHARD_BYTES`].
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn save_pretrained(&self, dir: &Path, tokenizer: &TextTokenizer) -> Result<Vec<PathBuf>> {
        self.save_with_shard_size(dir, tokenizer, MAX_SHARD_BYTES)
    }

    fn save_with_shard_size(
        &self,
        dir: &Path,
        tokenizer: &TextTokenizer,
        max_shard_bytes: usize,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = self.write_weights(dir, max_shard_bytes)?;

        let source = self.model.source();
        let dtype = self.model.llama().dtype();
        let mut config = source.raw_config()?;
        if let Some(map) = config.as_object_mut() {
            map.insert("torch_dtype".into(), json!(dtype_name(dtype)));
        }
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
        written.push(config_path);

        let tokenizer_path = dir.join("tokenizer.json");
        std::fs::copy(&source.tokenizer_path, &tokenizer_path)?;
        written.push(tokenizer_path);

        for name in OPTIONAL_FILES {
            let dest = dir.join(name);
            match source.extra_files.iter().find(|p| p.file_name().is_some_and(|f| f == name)) {
                Some(src) => {
                    std::fs::copy(src, &dest)?;
                }
                None => {
                    let generated = self.default_side_file(name, tokenizer)?;
                    std::fs::write(&dest, serde_json::to_string_pretty(&generated)?)?;
                }
            }
            written.push(dest);
        }

        tracing::info!("Saved merged model ({} files) to {}", written.len(), dir.display());
        Ok(written)
    }

    fn write_weights(&self, dir: &Path, max_shard_bytes: usize) -> Result<Vec<PathBuf>> {
        let weights = self.model.llama().named_weights()?;
        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));

        let mut shards: Vec<Vec<(String, Tensor)>> = vec![Vec::new()];
        let mut current = 0usize;
        for (name, tensor) in weights {
            let bytes = tensor.elem_count() * tensor.dtype().size_in_bytes();
            if current > 0 && current + bytes > max_shard_bytes {
                shards.push(Vec::new());
                current = 0;
            }
            current += bytes;
            if let Some(shard) = shards.last_mut() {
                shard.push((name, tensor.contiguous()?));
            }
        }

        if shards.len() == 1 {
            let path = dir.join("model.safetensors");
            let shard = shards.pop().unwrap_or_default();
            safetensors::tensor::serialize_to_file(shard, metadata, &path)?;
            return Ok(vec![path]);
        }

        let total = shards.len();
        let mut total_size = 0usize;
        let mut weight_map = serde_json::Map::new();
        let mut written = Vec::with_capacity(total + 1);
        for (idx, shard) in shards.into_iter().enumerate() {
            let file = format!("model-{:05}-of-{:05}.safetensors", idx + 1, total);
            for (name, tensor) in &shard {
                total_size += tensor.elem_count() * tensor.dtype().size_in_bytes();
                weight_map.insert(name.clone(), json!(file));
            }
            let path = dir.join(&file);
            safetensors::tensor::serialize_to_file(shard, metadata.clone(), &path)?;
            written.push(path);
        }
        let index = json!({
            "metadata": { "total_size": total_size },
            "weight_map": weight_map,
        });
        let index_path = dir.join("model.safetensors.index.json");
        std::fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        written.push(index_path);
        Ok(written)
    }

    fn default_side_file(&self, name: &str, tokenizer: &TextTokenizer) -> Result<serde_json::Value> {
        let token = |id: Option<u32>| id.and_then(|id| tokenizer.inner().id_to_token(id));
        let bos = token(tokenizer.bos_id());
        let eos = token(Some(tokenizer.eos_id()));
        let value = match name {
            "generation_config.json" => json!({
                "bos_token_id": tokenizer.bos_id(),
                "eos_token_id": tokenizer.eos_id(),
                "pad_token_id": tokenizer.pad_id(),
            }),
            "tokenizer_config.json" => json!({
                "bos_token": bos,
                "eos_token": eos,
                "pad_token": eos,
                "padding_side": "right",
                "model_max_length": self.model.llama().config().max_position_embeddings,
            }),
            "special_tokens_map.json" => json!({
                "bos_token": bos,
                "eos_token": eos,
                "pad_token": eos,
            }),
            other => {
                return Err(HeartGptError::Other(format!("no default for {other}")));
            }
        };
        Ok(value)
    }
}
