//! Model acquisition: hub download, tokenizer and weight loading.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama::{Config, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::{Api, ApiBuilder};
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer};

use crate::config::{AdapterConfig, QuantizationConfig};
use crate::error::{HeartGptError, Result};
use crate::llama::{Llama, ProjectionPlan};
use crate::lora::{self, PeftAdapterConfig};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Side files copied along with a merged model when the source has them.
pub const OPTIONAL_FILES: [&str; 3] = [
    "generation_config.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
];

/// Pick the compute device.
///
/// CUDA is used when the `cuda` feature is enabled and a device is present.
/// `HEARTGPT_FORCE_CPU=1` forces the CPU, `HEARTGPT_CUDA_DEVICE` selects the
/// ordinal.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var("HEARTGPT_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let ordinal = std::env::var("HEARTGPT_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu {
        tracing::info!("CPU forced via HEARTGPT_FORCE_CPU");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::warn!("Built without the cuda feature; running on CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Using CUDA device {}", ordinal);
            device
        }
        Ok(_) => {
            tracing::warn!("No CUDA device found; running on CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); running on CPU");
            Device::Cpu
        }
    }
}

/// Build a sync hub client, honouring an explicit cache dir and token.
pub(crate) fn hub_api(cache_dir: Option<&str>, token: Option<&str>) -> Result<Api> {
    let mut builder = ApiBuilder::new().with_progress(false);
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(PathBuf::from(dir));
    }
    if let Some(token) = token {
        builder = builder.with_token(Some(token.to_string()));
    }
    Ok(builder.build()?)
}

/// Files making up a Llama checkpoint on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    /// Hub id or directory the files came from.
    pub model_id: String,
    /// `config.json`.
    pub config_path: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer_path: PathBuf,
    /// Safetensors shards in load order.
    pub weight_files: Vec<PathBuf>,
    /// Present optional side files (see [`OPTIONAL_FILES`]).
    pub extra_files: Vec<PathBuf>,
}

impl ModelSource {
    /// Locate or download a checkpoint.
    ///
    /// A local directory containing `config.json` is used as is; anything
    /// else is treated as a hub model id and downloaded into the hub cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is incomplete or a download fails.
    pub fn resolve(model_id: &str, cache_dir: Option<&str>, token: Option<&str>) -> Result<Self> {
        let local = Path::new(model_id);
        if local.join(CONFIG_FILE).is_file() {
            tracing::info!("Using local model at {}", local.display());
            return Self::from_dir(local);
        }

        tracing::info!("Fetching {} from the hub", model_id);
        let api = hub_api(cache_dir, token)?;
        let repo = api.model(model_id.to_string());
        let info = repo.info()?;
        let available: HashSet<&str> = info.siblings.iter().map(|s| s.rfilename.as_str()).collect();

        let config_path = repo.get(CONFIG_FILE)?;
        let tokenizer_path = repo.get(TOKENIZER_FILE)?;

        let weight_files = if available.contains(WEIGHTS_INDEX_FILE) {
            let index = repo.get(WEIGHTS_INDEX_FILE)?;
            shard_names(&index)?
                .iter()
                .map(|shard| repo.get(shard))
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else if available.contains(SINGLE_WEIGHTS_FILE) {
            vec![repo.get(SINGLE_WEIGHTS_FILE)?]
        } else {
            return Err(HeartGptError::Model(format!(
                "{model_id} has no safetensors weights"
            )));
        };

        let mut extra_files = Vec::new();
        for name in OPTIONAL_FILES {
            if available.contains(name) {
                extra_files.push(repo.get(name)?);
            }
        }

        tracing::info!("Resolved {} weight file(s) for {}", weight_files.len(), model_id);
        Ok(Self {
            model_id: model_id.to_string(),
            config_path,
            tokenizer_path,
            weight_files,
            extra_files,
        })
    }

    /// Use a checkpoint laid out in a local directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.json`, `tokenizer.json` or the weights are missing.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        for required in [&config_path, &tokenizer_path] {
            if !required.is_file() {
                return Err(HeartGptError::Model(format!(
                    "{} not found",
                    required.display()
                )));
            }
        }

        let index = dir.join(WEIGHTS_INDEX_FILE);
        let weight_files = if index.is_file() {
            shard_names(&index)?.iter().map(|s| dir.join(s)).collect()
        } else if dir.join(SINGLE_WEIGHTS_FILE).is_file() {
            vec![dir.join(SINGLE_WEIGHTS_FILE)]
        } else {
            return Err(HeartGptError::Model(format!(
                "no {SINGLE_WEIGHTS_FILE} or {WEIGHTS_INDEX_FILE} in {}",
                dir.display()
            )));
        };

        let extra_files = OPTIONAL_FILES
            .iter()
            .map(|name| dir.join(name))
            .filter(|p| p.is_file())
            .collect();

        Ok(Self {
            model_id: dir.display().to_string(),
            config_path,
            tokenizer_path,
            weight_files,
            extra_files,
        })
    }

    /// Raw `config.json` contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn raw_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&std::fs::read_to_string(&self.config_path)?)?)
    }

    /// Parsed Llama hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.json` is not a Llama config.
    pub fn llama_config(&self) -> Result<Config> {
        let raw = std::fs::read_to_string(&self.config_path)?;
        let config: LlamaConfig = serde_json::from_str(&raw)
            .map_err(|e| HeartGptError::Model(format!("failed to parse config.json: {e}")))?;
        Ok(config.into_config(false))
    }

    /// Load the tokenizer with eos as the pad token and right padding.
    ///
    /// # Errors
    ///
    /// Returns an error if `tokenizer.json` cannot be read or has no eos token.
    pub fn load_tokenizer(&self) -> Result<TextTokenizer> {
        let inner = Tokenizer::from_file(&self.tokenizer_path)?;
        let config = self.llama_config()?;
        TextTokenizer::new(inner, &config)
    }

    fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        // SAFETY: the weight files are not modified while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&self.weight_files, dtype, device)? };
        Ok(vb)
    }
}

/// Distinct shard file names listed in a safetensors index.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let weight_map = index
        .get("weight_map")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| {
            HeartGptError::Model(format!("{} has no weight_map", index_path.display()))
        })?;
    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

/// Tokenizer plus the special ids the trainer and generator need.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    eos_id: u32,
    bos_id: Option<u32>,
}

impl TextTokenizer {
    /// Wrap a tokenizer, taking special ids from the model config.
    ///
    /// # Errors
    ///
    /// Returns an error if no eos id can be found.
    pub fn new(mut inner: Tokenizer, config: &Config) -> Result<Self> {
        let eos_id = match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => Some(*id),
            Some(LlamaEosToks::Multiple(ids)) => ids.first().copied(),
            None => None,
        }
        .or_else(|| inner.token_to_id("</s>"))
        .ok_or_else(|| HeartGptError::Model("tokenizer has no eos token".into()))?;
        let bos_id = config.bos_token_id.or_else(|| inner.token_to_id("<s>"));

        let pad_token = inner.id_to_token(eos_id).unwrap_or_else(|| "</s>".to_string());
        inner.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_id: eos_id,
            pad_token,
            ..PaddingParams::default()
        }));

        Ok(Self {
            inner,
            eos_id,
            bos_id,
        })
    }

    /// Token ids of `text`, with bos when `add_special_tokens` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(self.inner.encode(text, add_special_tokens)?.get_ids().to_vec())
    }

    /// Text of `ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        Ok(self.inner.decode(ids, skip_special_tokens)?)
    }

    /// End-of-sequence id.
    #[must_use]
    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Padding id, equal to eos.
    #[must_use]
    pub fn pad_id(&self) -> u32 {
        self.eos_id
    }

    /// Beginning-of-sequence id, if the vocabulary has one.
    #[must_use]
    pub fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// The wrapped tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

/// A Llama model together with its adapter parameters.
pub struct LlamaModel {
    llama: Llama,
    varmap: VarMap,
    adapter: Option<AdapterConfig>,
    source: ModelSource,
}

impl LlamaModel {
    /// Load the base model for adapter training.
    ///
    /// With `load_in_4bit` every projection is stored as a 4-bit
    /// [`QuantizedWeight`](crate::quantization::QuantizedWeight); the
    /// projections named in `adapter.target_modules` get trainable adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be read or quantized.
    pub fn load(
        source: ModelSource,
        quantization: &QuantizationConfig,
        adapter: &AdapterConfig,
        device: &Device,
    ) -> Result<Self> {
        let config = source.llama_config()?;
        let dtype = quantization.compute_dtype.dtype();
        let vb = source.var_builder(dtype, device)?;
        let varmap = VarMap::new();
        let plan = ProjectionPlan {
            quantization: quantization.load_in_4bit.then_some(quantization),
            adapter: Some((adapter, &varmap)),
            compute_dtype: dtype,
        };

        tracing::info!(
            "Loading {} ({} layers, {}) as {}",
            source.model_id,
            config.num_hidden_layers,
            quantization.compute_dtype,
            if quantization.load_in_4bit {
                format!("4-bit {}", quantization.quant_type)
            } else {
                "dense".to_string()
            }
        );
        let llama = Llama::load(&vb, &config, &plan)?;
        let model = Self {
            llama,
            varmap,
            adapter: Some(adapter.clone()),
            source,
        };
        tracing::info!("Trainable parameters: {}", model.trainable_param_count());
        Ok(model)
    }

    /// Load the plain dense model in `dtype`, without adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be read.
    pub fn load_full_precision(source: ModelSource, dtype: DType, device: &Device) -> Result<Self> {
        let config = source.llama_config()?;
        let vb = source.var_builder(dtype, device)?;
        tracing::info!("Reloading {} in {:?}", source.model_id, dtype);
        let llama = Llama::load(&vb, &config, &ProjectionPlan::dense(dtype))?;
        Ok(Self {
            llama,
            varmap: VarMap::new(),
            adapter: None,
            source,
        })
    }

    /// The network.
    #[must_use]
    pub fn llama(&self) -> &Llama {
        &self.llama
    }

    /// Mutable access to the network, used when merging.
    pub fn llama_mut(&mut self) -> &mut Llama {
        &mut self.llama
    }

    /// Trainable adapter tensors.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Where the weights came from.
    #[must_use]
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Adapter settings the model was built with.
    #[must_use]
    pub fn adapter_config(&self) -> Option<&AdapterConfig> {
        self.adapter.as_ref()
    }

    /// Number of trainable scalars.
    #[must_use]
    pub fn trainable_param_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write the adapter in PEFT layout into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model has no adapter or the write fails.
    pub fn save_adapter(&self, dir: &Path) -> Result<()> {
        let config = self
            .adapter
            .as_ref()
            .ok_or_else(|| HeartGptError::Checkpoint("model was loaded without an adapter".into()))?;
        let peft = PeftAdapterConfig::new(config, &self.source.model_id);
        lora::save_adapter(dir, &self.llama.adapters(), &peft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dir_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelSource::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_from_dir_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), "{}").unwrap();
        let err = ModelSource::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("model.safetensors"));
    }

    #[test]
    fn test_shard_names_are_unique_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(WEIGHTS_INDEX_FILE);
        std::fs::write(
            &index,
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        assert_eq!(
            shard_names(&index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn test_shard_names_without_weight_map() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(WEIGHTS_INDEX_FILE);
        std::fs::write(&index, "{}").unwrap();
        assert!(shard_names(&index).is_err());
    }

    #[test]
    fn test_force_cpu() {
        std::env::set_var("HEARTGPT_FORCE_CPU", "1");
        assert!(matches!(select_device(), Device::Cpu));
        std::env::remove_var("HEARTGPT_FORCE_CPU");
    }
}
