//! # heartgpt-rs
//!
//! QLoRA fine-tuning pipeline for the HeartGPT food-categorisation model.
//!
//! The crate loads a Llama-2 style checkpoint with 4-bit base weights,
//! trains a LoRA adapter on an instruction dataset, runs a handful of smoke
//! prompts, merges the adapter into a full-precision reload, and publishes
//! the result to the model hub.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file describes the whole run; an empty file is the HeartGPT recipe
//! - **4-bit Base Weights** - NF4/FP4 blockwise quantization with optional double quant
//! - **PEFT-compatible Adapters** - `adapter_model.safetensors` + `adapter_config.json`
//! - **Hub Round Trip** - Datasets and models come from the hub, merged models go back
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Validate configuration
//! heartgpt validate config.yaml
//!
//! # Full pipeline without the upload
//! heartgpt run config.yaml --skip-push
//!
//! # Merge an adapter by hand
//! heartgpt merge --config config.yaml --adapter ./llama-2-7b-heartgpt --output ./merged
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use heartgpt_rs::{CandleBackend, Pipeline, PipelineConfig};
//!
//! # fn main() -> heartgpt_rs::Result<()> {
//! let config = PipelineConfig::from_file("config.yaml")?;
//! let pipeline = Pipeline::new(config)?;
//! let mut backend = CandleBackend::for_pipeline(&pipeline)?;
//! let report = pipeline.run(&mut backend)?;
//! println!("trained for {} steps", report.train_output.global_step);
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use heartgpt_rs::PipelineConfig;
//!
//! # fn main() -> heartgpt_rs::Result<()> {
//! let mut config = PipelineConfig::from_preset("heartgpt")?;
//! config.training.max_steps = Some(50);
//! config.push_to_hub = false;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dataset;
pub mod error;
pub mod generation;
pub mod hub;
pub mod llama;
pub mod lora;
pub mod merge;
pub mod model;
pub mod optimizer;
pub mod pipeline;
pub mod prompt;
pub mod quantization;
pub mod scheduler;
pub mod trainer;

pub use config::{
    AdapterConfig, GenerationConfig, HubConfig, PipelineConfig, QuantizationConfig, SftConfig,
    TrainingConfig,
};
pub use dataset::Dataset;
pub use error::{HeartGptError, Result};
pub use generation::{Generation, TextGenerator};
pub use hub::{Credentials, HfPublisher, PublishReport};
pub use merge::{merge_adapter, MergedModel};
pub use model::{LlamaModel, ModelSource, TextTokenizer};
pub use pipeline::{Backend, CandleBackend, Pipeline, PipelineReport};
pub use prompt::instruction_prompt;
pub use trainer::{TrainOutput, Trainer};
