//! Configuration parsing and validation.
//!
//! A run is described by one [`PipelineConfig`] holding the quantization,
//! adapter, training, SFT, generation and hub settings. Every field defaults
//! to the HeartGPT recipe, so an empty YAML document is a complete config.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{HeartGptError, Result};
use crate::prompt;

/// Projection names a LoRA adapter can attach to.
pub const LLAMA_PROJECTIONS: [&str; 7] = [
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
];

/// Top-level configuration for a fine-tune run.
///
/// # Example
///
/// ```rust
/// use heartgpt_rs::PipelineConfig;
///
/// # fn main() -> heartgpt_rs::Result<()> {
/// let config = PipelineConfig::from_preset("heartgpt")?;
/// assert_eq!(config.model_name, "NousResearch/Llama-2-7b-chat-hf");
/// assert_eq!(config.adapter.rank, 64);
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base model identifier (hub id or local directory).
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Instruction dataset identifier (hub id or local file).
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,

    /// Dataset split to train on.
    #[serde(default = "default_dataset_split")]
    pub dataset_split: String,

    /// Directory the trained adapter is saved to.
    #[serde(default = "default_new_model")]
    pub new_model: String,

    /// Directory the merged full-precision model is written to.
    #[serde(default = "default_merged_output_dir")]
    pub merged_output_dir: String,

    /// Hub cache directory override.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// 4-bit loading settings.
    #[serde(default)]
    pub quantization: QuantizationConfig,

    /// LoRA adapter settings.
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Trainer hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Supervised fine-tuning data settings.
    #[serde(default)]
    pub sft: SftConfig,

    /// Smoke-test generation settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Publishing settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// Run the inference smoke tests after training.
    #[serde(default = "default_true")]
    pub run_inference: bool,

    /// Push the merged model at the end of the run.
    #[serde(default = "default_true")]
    pub push_to_hub: bool,
}

fn default_model_name() -> String {
    "NousResearch/Llama-2-7b-chat-hf".into()
}
fn default_dataset_name() -> String {
    "adarsha30735/datafood".into()
}
fn default_dataset_split() -> String {
    "train".into()
}
fn default_new_model() -> String {
    "llama-2-7b-heartgpt".into()
}
fn default_merged_output_dir() -> String {
    "./merged".into()
}
fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            dataset_name: default_dataset_name(),
            dataset_split: default_dataset_split(),
            new_model: default_new_model(),
            merged_output_dir: default_merged_output_dir(),
            cache_dir: None,
            quantization: QuantizationConfig::default(),
            adapter: AdapterConfig::default(),
            training: TrainingConfig::default(),
            sft: SftConfig::default(),
            generation: GenerationConfig::default(),
            hub: HubConfig::default(),
            run_inference: true,
            push_to_hub: true,
        }
    }
}

/// 4-bit quantization settings applied when the base model is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Load the frozen base weights in 4-bit.
    #[serde(default = "default_true")]
    pub load_in_4bit: bool,

    /// 4-bit code book.
    #[serde(default)]
    pub quant_type: QuantType,

    /// Dtype used for matmuls against dequantized weights.
    #[serde(default)]
    pub compute_dtype: ComputeDtype,

    /// Quantize the per-block absmax scales a second time.
    #[serde(default)]
    pub double_quant: bool,

    /// Number of weights sharing one absmax scale.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_block_size() -> usize {
    64
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::Nf4,
            compute_dtype: ComputeDtype::Float16,
            double_quant: false,
            block_size: default_block_size(),
        }
    }
}

impl QuantizationConfig {
    /// Validate the quantization settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is zero or odd.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 2 != 0 {
            return Err(HeartGptError::Config(format!(
                "quantization.block_size must be a positive even number, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// 4-bit code book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit float (1 sign, 2 exponent, 1 mantissa bit).
    Fp4,
    /// 4-bit `NormalFloat`.
    #[default]
    Nf4,
}

impl FromStr for QuantType {
    type Err = HeartGptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp4" => Ok(Self::Fp4),
            "nf4" => Ok(Self::Nf4),
            other => Err(HeartGptError::Config(format!(
                "unsupported quant_type '{other}', expected fp4 or nf4"
            ))),
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp4 => f.write_str("fp4"),
            Self::Nf4 => f.write_str("nf4"),
        }
    }
}

/// Compute dtype for the quantized model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    /// IEEE half precision.
    #[default]
    Float16,
    /// Brain float.
    Bfloat16,
}

impl ComputeDtype {
    /// The candle dtype for this compute dtype.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Float16 => DType::F16,
            Self::Bfloat16 => DType::BF16,
        }
    }
}

impl FromStr for ComputeDtype {
    type Err = HeartGptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float16" => Ok(Self::Float16),
            "bfloat16" => Ok(Self::Bfloat16),
            other => Err(HeartGptError::Config(format!(
                "unsupported compute_dtype '{other}', expected float16 or bfloat16"
            ))),
        }
    }
}

impl fmt::Display for ComputeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float16 => f.write_str("float16"),
            Self::Bfloat16 => f.write_str("bfloat16"),
        }
    }
}

/// Low-rank adapter settings.
///
/// # Example
///
/// ```rust
/// use heartgpt_rs::config::AdapterConfig;
///
/// let adapter = AdapterConfig { dropout: 1.0, ..Default::default() };
/// assert!(adapter.validate().is_err());
/// assert!((AdapterConfig::default().scaling() - 0.25).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Rank of the low-rank decomposition.
    #[serde(default = "default_rank")]
    pub rank: usize,

    /// Scaling numerator; the update is scaled by `alpha / rank`.
    #[serde(default = "default_alpha")]
    pub alpha: usize,

    /// Dropout applied to the adapter input while training.
    #[serde(default = "default_lora_dropout")]
    pub dropout: f64,

    /// Which biases are trained.
    #[serde(default)]
    pub bias: BiasMode,

    /// Task the adapter is trained for.
    #[serde(default)]
    pub task_type: TaskType,

    /// Projections that receive an adapter.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

fn default_rank() -> usize {
    64
}
fn default_alpha() -> usize {
    16
}
fn default_lora_dropout() -> f64 {
    0.1
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_lora_dropout(),
            bias: BiasMode::None,
            task_type: TaskType::CausalLm,
            target_modules: default_target_modules(),
        }
    }
}

impl AdapterConfig {
    /// Scale applied to the adapter update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.rank as f64
    }

    /// Whether `module` (e.g. `"q_proj"`) receives an adapter.
    #[must_use]
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    /// Validate the adapter settings.
    ///
    /// # Errors
    ///
    /// Returns an error if rank or alpha is zero, dropout is outside `[0, 1)`,
    /// or a target module is not a Llama projection.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(HeartGptError::Config("adapter.rank must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(HeartGptError::Config("adapter.alpha must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(HeartGptError::Config(format!(
                "adapter.dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(HeartGptError::Config(
                "adapter.target_modules must not be empty".into(),
            ));
        }
        if let Some(unknown) = self
            .target_modules
            .iter()
            .find(|m| !LLAMA_PROJECTIONS.contains(&m.as_str()))
        {
            return Err(HeartGptError::Config(format!(
                "unknown adapter target module '{unknown}'"
            )));
        }
        Ok(())
    }
}

/// Bias training mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    /// Biases stay frozen.
    #[default]
    None,
    /// Every bias is trained.
    All,
    /// Only biases of adapted layers are trained.
    LoraOnly,
}

impl fmt::Display for BiasMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::All => f.write_str("all"),
            Self::LoraOnly => f.write_str("lora_only"),
        }
    }
}

/// Adapter task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Causal language modelling.
    #[default]
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CausalLm => f.write_str("CAUSAL_LM"),
        }
    }
}

/// Trainer hyperparameters.
///
/// # Example
///
/// ```rust
/// use heartgpt_rs::TrainingConfig;
///
/// let training = TrainingConfig { max_steps: Some(10), ..Default::default() };
/// assert_eq!(training.logging_steps, 25);
/// assert!(training.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Directory for checkpoints and logs.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Number of passes over the dataset.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Training batch size.
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Evaluation batch size.
    #[serde(default = "default_batch_size")]
    pub per_device_eval_batch_size: usize,

    /// Micro-batches per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Recompute activations in the backward pass.
    #[serde(default = "default_true")]
    pub gradient_checkpointing: bool,

    /// Global gradient norm clip.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Optimizer name.
    #[serde(default)]
    pub optim: OptimizerKind,

    /// Learning rate schedule.
    #[serde(default)]
    pub lr_scheduler_type: LrScheduler,

    /// Total optimizer steps; overrides the epoch count when set.
    #[serde(default, deserialize_with = "deserialize_max_steps")]
    pub max_steps: Option<usize>,

    /// Fraction of steps spent warming up.
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,

    /// Batch examples of similar length together.
    #[serde(default = "default_true")]
    pub group_by_length: bool,

    /// Checkpoint every N steps, 0 disables.
    #[serde(default)]
    pub save_steps: usize,

    /// Log every N steps.
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,

    /// Train in half precision.
    #[serde(default)]
    pub fp16: bool,

    /// Train in bfloat16.
    #[serde(default)]
    pub bf16: bool,

    /// Logging integration.
    #[serde(default = "default_report_to")]
    pub report_to: String,

    /// Seed for shuffling, dropout and adapter init.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./results".into()
}
fn default_epochs() -> usize {
    1
}
fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    1
}
fn default_max_grad_norm() -> f64 {
    0.3
}
fn default_lr() -> f64 {
    2e-4
}
fn default_weight_decay() -> f64 {
    0.001
}
fn default_warmup_ratio() -> f64 {
    0.03
}
fn default_logging_steps() -> usize {
    25
}
fn default_report_to() -> String {
    "tensorboard".into()
}
fn default_seed() -> u64 {
    42
}

/// `max_steps: -1` means "derive from epochs", as in the transformers trainer.
fn deserialize_max_steps<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<i64>::deserialize(deserializer)? {
        None | Some(-1) => Ok(None),
        Some(v) => usize::try_from(v).map(Some).map_err(|_| {
            serde::de::Error::custom(format!("max_steps must be -1 or non-negative, got {v}"))
        }),
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            num_train_epochs: default_epochs(),
            per_device_train_batch_size: default_batch_size(),
            per_device_eval_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            gradient_checkpointing: true,
            max_grad_norm: default_max_grad_norm(),
            learning_rate: default_lr(),
            weight_decay: default_weight_decay(),
            optim: OptimizerKind::PagedAdamw32bit,
            lr_scheduler_type: LrScheduler::Cosine,
            max_steps: None,
            warmup_ratio: default_warmup_ratio(),
            group_by_length: true,
            save_steps: 0,
            logging_steps: default_logging_steps(),
            fp16: false,
            bf16: false,
            report_to: default_report_to(),
            seed: default_seed(),
        }
    }
}

impl TrainingConfig {
    /// Validate the training hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.is_empty() {
            return Err(HeartGptError::Config("training.output_dir is required".into()));
        }
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(HeartGptError::Config("batch sizes must be > 0".into()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(HeartGptError::Config(
                "training.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if !(self.max_grad_norm >= 0.0 && self.max_grad_norm.is_finite()) {
            return Err(HeartGptError::Config(format!(
                "training.max_grad_norm must be non-negative, got {}",
                self.max_grad_norm
            )));
        }
        if !(self.weight_decay >= 0.0 && self.weight_decay.is_finite()) {
            return Err(HeartGptError::Config(format!(
                "training.weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(HeartGptError::Config(
                "training.learning_rate must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(HeartGptError::Config(format!(
                "training.warmup_ratio must be in [0, 1], got {}",
                self.warmup_ratio
            )));
        }
        if self.fp16 && self.bf16 {
            return Err(HeartGptError::Config(
                "fp16 and bf16 are mutually exclusive".into(),
            ));
        }
        if self.logging_steps == 0 {
            return Err(HeartGptError::Config("training.logging_steps must be > 0".into()));
        }
        if self.max_steps == Some(0) {
            return Err(HeartGptError::Config("training.max_steps must be > 0".into()));
        }
        Ok(())
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// AdamW.
    #[serde(rename = "adamw_torch")]
    AdamwTorch,
    /// AdamW with f32 state.
    #[serde(rename = "adamw_32bit")]
    Adamw32bit,
    /// AdamW with f32 state and paged memory.
    #[default]
    #[serde(rename = "paged_adamw_32bit")]
    PagedAdamw32bit,
    /// AdamW with 8-bit state and paged memory.
    #[serde(rename = "paged_adamw_8bit")]
    PagedAdamw8bit,
    /// Plain SGD.
    #[serde(rename = "sgd")]
    Sgd,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AdamwTorch => "adamw_torch",
            Self::Adamw32bit => "adamw_32bit",
            Self::PagedAdamw32bit => "paged_adamw_32bit",
            Self::PagedAdamw8bit => "paged_adamw_8bit",
            Self::Sgd => "sgd",
        };
        f.write_str(name)
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Cosine annealing.
    #[default]
    Cosine,
    /// Linear decay.
    Linear,
    /// Constant learning rate.
    Constant,
}

/// Supervised fine-tuning data settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftConfig {
    /// Dataset column holding the training text.
    #[serde(default = "default_text_field")]
    pub dataset_text_field: String,

    /// Truncation length; `None` picks `min(1024, model max positions)`.
    #[serde(default)]
    pub max_seq_length: Option<usize>,

    /// Concatenate examples into fixed-length windows.
    #[serde(default)]
    pub packing: bool,
}

fn default_text_field() -> String {
    "text".into()
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            dataset_text_field: default_text_field(),
            max_seq_length: None,
            packing: false,
        }
    }
}

impl SftConfig {
    /// Sequence length used when `max_seq_length` is unset.
    pub const DEFAULT_MAX_SEQ_LENGTH: usize = 1024;

    /// Resolve the effective sequence length against the model limit.
    #[must_use]
    pub fn effective_max_seq_length(&self, model_max_positions: usize) -> usize {
        self.max_seq_length
            .unwrap_or_else(|| Self::DEFAULT_MAX_SEQ_LENGTH.min(model_max_positions))
    }
}

/// Text generation settings for the smoke tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum total tokens, prompt included.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Sampling temperature; `None` decodes greedily.
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold.
    #[serde(default)]
    pub top_p: Option<f64>,

    /// Penalty applied to already generated tokens, 1.0 disables.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Sampling seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Prompts run through the model, before template wrapping.
    #[serde(default = "prompt::heartgpt_queries")]
    pub prompts: Vec<String>,
}

fn default_max_length() -> usize {
    1000
}
fn default_repeat_penalty() -> f32 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            temperature: None,
            top_p: None,
            repeat_penalty: default_repeat_penalty(),
            seed: default_seed(),
            prompts: prompt::heartgpt_queries(),
        }
    }
}

/// Model hub publishing settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Target repository, `name` or `namespace/name`.
    #[serde(default = "default_repo_id")]
    pub repo_id: String,

    /// Create the repository as private.
    #[serde(default)]
    pub private: bool,

    /// Commit message for the upload.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Access token; never serialized.
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_repo_id() -> String {
    "2_llma-heart-status-dataset".into()
}
fn default_commit_message() -> String {
    "Upload merged model".into()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            repo_id: default_repo_id(),
            private: false,
            commit_message: default_commit_message(),
            token: None,
        }
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("repo_id", &self.repo_id)
            .field("private", &self.private)
            .field("commit_message", &self.commit_message)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a named preset.
    ///
    /// Available presets:
    /// - `"heartgpt"` - Llama-2 7B chat, NF4, r=64 on the food dataset
    /// - `"heartgpt-smoke"` - same recipe capped at 10 steps without push
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "heartgpt" => Ok(Self::default()),
            "heartgpt-smoke" => Ok(Self::smoke_preset()),
            _ => Err(HeartGptError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// A short run for checking the plumbing end to end.
    #[must_use]
    pub fn smoke_preset() -> Self {
        Self {
            training: TrainingConfig {
                max_steps: Some(10),
                logging_steps: 1,
                ..TrainingConfig::default()
            },
            generation: GenerationConfig {
                max_length: 256,
                ..GenerationConfig::default()
            },
            push_to_hub: false,
            ..Self::default()
        }
    }

    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(HeartGptError::Config("model_name is required".into()));
        }
        if self.dataset_name.is_empty() {
            return Err(HeartGptError::Config("dataset_name is required".into()));
        }
        if self.new_model.is_empty() {
            return Err(HeartGptError::Config("new_model is required".into()));
        }
        if self.sft.dataset_text_field.is_empty() {
            return Err(HeartGptError::Config(
                "sft.dataset_text_field is required".into(),
            ));
        }
        if self.generation.max_length == 0 {
            return Err(HeartGptError::Config(
                "generation.max_length must be > 0".into(),
            ));
        }
        if self.push_to_hub && self.hub.repo_id.is_empty() {
            return Err(HeartGptError::Config("hub.repo_id is required".into()));
        }
        self.quantization.validate()?;
        self.adapter.validate()?;
        self.training.validate()?;
        Ok(())
    }
}
