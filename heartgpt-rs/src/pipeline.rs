//! End-to-end fine-tune pipeline.
//!
//! [`Pipeline::run`] drives the stages strictly in order: fetch the dataset,
//! load the quantized model, train the adapter, save it, run the smoke
//! prompts, reload the base in full precision, merge, and publish. The heavy
//! work sits behind [`Backend`] so the ordering can be tested without a
//! model.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::Serialize;

use crate::config::{AdapterConfig, GenerationConfig, HubConfig, PipelineConfig, SftConfig, TrainingConfig};
use crate::dataset::Dataset;
use crate::error::{HeartGptError, Result};
use crate::generation::{Generation, TextGenerator};
use crate::hub::{Credentials, HfPublisher, PublishReport};
use crate::merge;
use crate::model::{self, LlamaModel, ModelSource, TextTokenizer};
use crate::prompt::instruction_prompt;
use crate::trainer::{TrainOutput, Trainer};

/// The collaborators the pipeline delegates to.
pub trait Backend {
    /// Loaded training data.
    type Dataset;
    /// A loaded model together with whatever it needs to run.
    type Model;
    /// Trained state; dropping it releases the quantized model.
    type Session;

    /// Fetch the training split.
    fn fetch_dataset(&mut self, config: &PipelineConfig) -> Result<Self::Dataset>;

    /// Load the base model in 4-bit with fresh adapters.
    fn load_quantized_model(&mut self, config: &PipelineConfig) -> Result<Self::Model>;

    /// Train the adapter.
    fn train(
        &mut self,
        model: Self::Model,
        dataset: Self::Dataset,
        adapter: AdapterConfig,
        training: TrainingConfig,
        sft: SftConfig,
    ) -> Result<(Self::Session, TrainOutput)>;

    /// Write the trained adapter to `path`.
    fn save_adapter(&mut self, session: &Self::Session, path: &Path) -> Result<()>;

    /// Run one already-templated prompt.
    fn generate(
        &mut self,
        session: &Self::Session,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Vec<Generation>>;

    /// Load the base model densely in the compute dtype.
    fn load_full_precision(&mut self, config: &PipelineConfig) -> Result<Self::Model>;

    /// Fold the adapter at `adapter_dir` into `base` and save to `output_dir`.
    fn merge(&mut self, base: Self::Model, adapter_dir: &Path, output_dir: &Path) -> Result<PathBuf>;

    /// Upload `model_dir` to `repo_id`.
    fn publish(
        &mut self,
        model_dir: &Path,
        repo_id: &str,
        hub: &HubConfig,
        credentials: &Credentials,
    ) -> Result<PublishReport>;
}

/// Smoke-test output for one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptResult {
    /// Prompt as sent to the model, template included.
    pub prompt: String,
    /// Generator output.
    pub generations: Vec<Generation>,
}

/// Everything a pipeline run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    /// Training summary.
    pub train_output: TrainOutput,
    /// Where the adapter was saved.
    pub adapter_path: PathBuf,
    /// Smoke-test results, empty when inference is disabled.
    pub generations: Vec<PromptResult>,
    /// Where the merged model was saved.
    pub merged_path: PathBuf,
    /// Hub upload result, absent when publishing is disabled.
    pub publish: Option<PublishReport>,
}

/// A validated configuration with its credentials.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    credentials: Option<Credentials>,
}

impl Pipeline {
    /// Validate `config` and resolve credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if publishing is
    /// enabled and no token can be found.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let credentials = if config.push_to_hub {
            Some(Credentials::require(config.hub.token.as_deref())?)
        } else {
            Credentials::resolve(config.hub.token.as_deref())
        };
        Ok(Self { config, credentials })
    }

    /// Use explicit credentials instead of resolving them.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_credentials(config: PipelineConfig, credentials: Option<Credentials>) -> Result<Self> {
        config.validate()?;
        if config.push_to_hub && credentials.is_none() {
            return Err(HeartGptError::Auth("push_to_hub is set but no credentials were given".into()));
        }
        Ok(Self { config, credentials })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolved credentials, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Run every stage in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any stage.
    pub fn run<B: Backend>(&self, backend: &mut B) -> Result<PipelineReport> {
        let config = &self.config;
        let adapter_path = PathBuf::from(&config.new_model);

        tracing::info!("Fetching dataset {} [{}]", config.dataset_name, config.dataset_split);
        let dataset = backend.fetch_dataset(config)?;

        // The quantized model and trainer live only in this scope.
        let (train_output, generations) = {
            tracing::info!("Loading {} in 4-bit", config.model_name);
            let model = backend.load_quantized_model(config)?;
            let (session, train_output) = backend.train(
                model,
                dataset,
                config.adapter.clone(),
                config.training.clone(),
                config.sft.clone(),
            )?;
            backend.save_adapter(&session, &adapter_path)?;
            tracing::info!("Adapter saved to {}", adapter_path.display());

            let mut generations = Vec::new();
            if config.run_inference {
                for prompt in &config.generation.prompts {
                    let prompt = instruction_prompt(prompt);
                    let output = backend.generate(&session, &prompt, &config.generation)?;
                    generations.push(PromptResult {
                        prompt,
                        generations: output,
                    });
                }
            } else {
                tracing::info!("Skipping inference smoke tests");
            }
            (train_output, generations)
        };

        let base = backend.load_full_precision(config)?;
        let merged_path = backend.merge(base, &adapter_path, Path::new(&config.merged_output_dir))?;

        let publish = match (&self.credentials, config.push_to_hub) {
            (Some(credentials), true) => Some(backend.publish(
                &merged_path,
                &config.hub.repo_id,
                &config.hub,
                credentials,
            )?),
            _ => {
                tracing::info!("Skipping hub upload");
                None
            }
        };

        Ok(PipelineReport {
            train_output,
            adapter_path,
            generations,
            merged_path,
            publish,
        })
    }
}

/// Model weights paired with their tokenizer.
pub struct LoadedModel {
    /// The network.
    pub model: LlamaModel,
    /// Its tokenizer.
    pub tokenizer: TextTokenizer,
}

/// Production backend on candle and the hub APIs.
pub struct CandleBackend {
    device: Device,
    token: Option<String>,
    echo: bool,
}

impl CandleBackend {
    /// Select the device and seed it.
    ///
    /// # Errors
    ///
    /// Returns an error if seeding the accelerator fails.
    pub fn new(seed: u64, credentials: Option<&Credentials>) -> Result<Self> {
        let device = model::select_device();
        if device.is_cpu() {
            tracing::debug!("CPU device: adapter init is not seeded");
        } else {
            device.set_seed(seed)?;
        }
        Ok(Self {
            device,
            token: credentials.map(|c| c.token().to_string()),
            echo: true,
        })
    }

    /// Backend for `config`, seeded from its training seed.
    ///
    /// # Errors
    ///
    /// Returns an error if seeding the accelerator fails.
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<Self> {
        Self::new(pipeline.config().training.seed, pipeline.credentials())
    }

    /// Print generated text to stdout. On by default.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// The device in use.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn source(&self, config: &PipelineConfig) -> Result<ModelSource> {
        ModelSource::resolve(&config.model_name, config.cache_dir.as_deref(), self.token.as_deref())
    }
}

impl Backend for CandleBackend {
    type Dataset = Dataset;
    type Model = LoadedModel;
    type Session = Trainer;

    fn fetch_dataset(&mut self, config: &PipelineConfig) -> Result<Dataset> {
        Dataset::load(
            &config.dataset_name,
            &config.dataset_split,
            &config.sft.dataset_text_field,
            config.cache_dir.as_deref(),
            self.token.as_deref(),
        )
    }

    fn load_quantized_model(&mut self, config: &PipelineConfig) -> Result<LoadedModel> {
        let source = self.source(config)?;
        let tokenizer = source.load_tokenizer()?;
        let model = LlamaModel::load(source, &config.quantization, &config.adapter, &self.device)?;
        Ok(LoadedModel { model, tokenizer })
    }

    fn train(
        &mut self,
        model: LoadedModel,
        dataset: Dataset,
        adapter: AdapterConfig,
        training: TrainingConfig,
        sft: SftConfig,
    ) -> Result<(Trainer, TrainOutput)> {
        let mut trainer = Trainer::new(model.model, model.tokenizer, dataset, adapter, training, sft)?;
        let output = trainer.train()?;
        Ok((trainer, output))
    }

    fn save_adapter(&mut self, session: &Trainer, path: &Path) -> Result<()> {
        session.save_model(path)
    }

    fn generate(&mut self, session: &Trainer, prompt: &str, config: &GenerationConfig) -> Result<Vec<Generation>> {
        let generator = TextGenerator::new(session.model().llama(), session.tokenizer(), config.clone());
        let generations = generator.generate(prompt)?;
        if self.echo {
            if let Some(first) = generations.first() {
                println!("{}", first.generated_text);
            }
        }
        Ok(generations)
    }

    fn load_full_precision(&mut self, config: &PipelineConfig) -> Result<LoadedModel> {
        let source = self.source(config)?;
        let tokenizer = source.load_tokenizer()?;
        let dtype = config.quantization.compute_dtype.dtype();
        let model = LlamaModel::load_full_precision(source, dtype, &self.device)?;
        Ok(LoadedModel { model, tokenizer })
    }

    fn merge(&mut self, base: LoadedModel, adapter_dir: &Path, output_dir: &Path) -> Result<PathBuf> {
        let merged = merge::merge_adapter(base.model, adapter_dir)?;
        merged.save_pretrained(output_dir, &base.tokenizer)?;
        Ok(output_dir.to_path_buf())
    }

    fn publish(
        &mut self,
        model_dir: &Path,
        repo_id: &str,
        hub: &HubConfig,
        credentials: &Credentials,
    ) -> Result<PublishReport> {
        let publisher = HfPublisher::new(credentials.clone())?;
        publisher.push(model_dir, repo_id, hub.private, &hub.commit_message)
    }
}
