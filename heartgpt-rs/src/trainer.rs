//! Supervised fine-tuning loop for the adapter.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var, D};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::config::{AdapterConfig, BiasMode, SftConfig, TrainingConfig};
use crate::dataset::{self, Dataset};
use crate::error::{HeartGptError, Result};
use crate::model::{LlamaModel, TextTokenizer};
use crate::optimizer::OptimizerConfig;
use crate::scheduler::{warmup_steps, LRScheduler};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// One `logging_steps` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Optimizer step the record was taken at.
    pub step: usize,
    /// Fractional epoch.
    pub epoch: f64,
    /// Mean loss since the previous record.
    pub loss: f64,
    /// Global gradient norm before clipping at this step.
    pub grad_norm: f64,
    /// Learning rate used for this step.
    pub learning_rate: f64,
}

/// Summary returned by [`Trainer::train`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutput {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Mean loss over every step.
    pub training_loss: f64,
    /// Wall-clock training time in seconds.
    pub train_runtime: f64,
    /// Training examples processed per second.
    pub train_samples_per_second: f64,
}

/// Result of [`Trainer::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutput {
    /// Mean batch loss.
    pub eval_loss: f64,
    /// Examples evaluated.
    pub eval_samples: usize,
}

/// `trainer_state.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Fractional epoch reached.
    pub epoch: f64,
    /// Planned optimizer steps.
    pub max_steps: usize,
    /// Planned passes over the data.
    pub num_train_epochs: usize,
    /// Logging interval.
    pub logging_steps: usize,
    /// Checkpoint interval, 0 when disabled.
    pub save_steps: usize,
    /// Micro-batch size.
    pub train_batch_size: usize,
    /// Periodic log records.
    pub log_history: Vec<LogEntry>,
}

/// The hyperparameters stored next to each checkpoint as `config.yaml`.
#[derive(Debug, Serialize)]
struct CheckpointConfig<'a> {
    adapter: &'a AdapterConfig,
    training: &'a TrainingConfig,
    sft: &'a SftConfig,
}

/// A tokenised training row.
struct Sequence {
    ids: Vec<u32>,
}

/// Step counts derived from the data size and the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    /// Micro-batches per epoch.
    pub batches_per_epoch: usize,
    /// Optimizer steps per epoch.
    pub steps_per_epoch: usize,
    /// Optimizer steps in total.
    pub total_steps: usize,
    /// Epochs needed to reach `total_steps`.
    pub epochs: usize,
}

impl StepPlan {
    /// Plan a run over `num_examples` examples.
    #[must_use]
    pub fn new(num_examples: usize, training: &TrainingConfig) -> Self {
        let batches_per_epoch = num_examples.div_ceil(training.per_device_train_batch_size);
        let steps_per_epoch = (batches_per_epoch / training.gradient_accumulation_steps).max(1);
        match training.max_steps {
            Some(max_steps) => Self {
                batches_per_epoch,
                steps_per_epoch,
                total_steps: max_steps,
                epochs: max_steps.div_ceil(steps_per_epoch),
            },
            None => Self {
                batches_per_epoch,
                steps_per_epoch,
                total_steps: steps_per_epoch * training.num_train_epochs,
                epochs: training.num_train_epochs,
            },
        }
    }
}

/// Shuffle seed for `epoch`; wraps for seeds near `u64::MAX`.
fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_add(epoch as u64)
}

/// Adapter trainer.
///
/// Owns the model, tokenizer and dataset for the duration of training and
/// exposes the configurations it was built with read-only.
///
/// # Example
///
/// ```no_run
/// use heartgpt_rs::dataset::Dataset;
/// use heartgpt_rs::model::{select_device, LlamaModel, ModelSource};
/// use heartgpt_rs::{PipelineConfig, Trainer};
///
/// # fn main() -> heartgpt_rs::Result<()> {
/// let config = PipelineConfig::from_preset("heartgpt-smoke")?;
/// let source = ModelSource::resolve(&config.model_name, None, None)?;
/// let tokenizer = source.load_tokenizer()?;
/// let model = LlamaModel::load(source, &config.quantization, &config.adapter, &select_device())?;
/// let dataset = Dataset::load(&config.dataset_name, "train", "text", None, None)?;
///
/// let mut trainer = Trainer::new(
///     model,
///     tokenizer,
///     dataset,
///     config.adapter.clone(),
///     config.training.clone(),
///     config.sft.clone(),
/// )?;
/// let output = trainer.train()?;
/// println!("final loss {:.4}", output.training_loss);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    model: LlamaModel,
    tokenizer: TextTokenizer,
    dataset: Dataset,
    adapter: AdapterConfig,
    training: TrainingConfig,
    sft: SftConfig,
    max_seq_length: usize,
    step: usize,
    epoch: f64,
    log_history: Vec<LogEntry>,
    output: Option<TrainOutput>,
}

impl Trainer {
    /// Create a trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration is invalid, the adapter config
    /// differs from the one the model was loaded with, or bias training is
    /// requested.
    pub fn new(
        model: LlamaModel,
        tokenizer: TextTokenizer,
        dataset: Dataset,
        adapter: AdapterConfig,
        training: TrainingConfig,
        sft: SftConfig,
    ) -> Result<Self> {
        adapter.validate()?;
        training.validate()?;
        if adapter.bias != BiasMode::None {
            return Err(HeartGptError::Config(format!(
                "adapter.bias '{}' is not supported: Llama projections have no bias",
                adapter.bias
            )));
        }
        if model.adapter_config() != Some(&adapter) {
            return Err(HeartGptError::Config(
                "adapter config does not match the one the model was loaded with".into(),
            ));
        }

        let max_positions = model.llama().config().max_position_embeddings;
        let max_seq_length = sft.effective_max_seq_length(max_positions);
        if max_seq_length == 0 || max_seq_length > max_positions {
            return Err(HeartGptError::Config(format!(
                "sft.max_seq_length {max_seq_length} must be in 1..={max_positions}"
            )));
        }

        if training.gradient_checkpointing {
            tracing::debug!("gradient_checkpointing requested; activations are kept in memory");
        }
        if training.fp16 || training.bf16 {
            tracing::info!("fp16/bf16 flags ignored; compute dtype comes from the quantization config");
        }
        if training.report_to != "none" {
            tracing::info!("report_to '{}' ignored; metrics go to the log", training.report_to);
        }

        Ok(Self {
            model,
            tokenizer,
            dataset,
            adapter,
            training,
            sft,
            max_seq_length,
            step: 0,
            epoch: 0.0,
            log_history: Vec::new(),
            output: None,
        })
    }

    /// Adapter settings.
    #[must_use]
    pub fn adapter_config(&self) -> &AdapterConfig {
        &self.adapter
    }

    /// Trainer hyperparameters.
    #[must_use]
    pub fn training_config(&self) -> &TrainingConfig {
        &self.training
    }

    /// SFT data settings.
    #[must_use]
    pub fn sft_config(&self) -> &SftConfig {
        &self.sft
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// The tokenizer used for training.
    #[must_use]
    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Release the trained model and tokenizer.
    #[must_use]
    pub fn into_parts(self) -> (LlamaModel, TextTokenizer) {
        (self.model, self.tokenizer)
    }

    /// Sequence length examples are truncated to.
    #[must_use]
    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Optimizer steps taken.
    #[must_use]
    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Records written every `logging_steps`.
    #[must_use]
    pub fn log_history(&self) -> &[LogEntry] {
        &self.log_history
    }

    /// Run the training loop.
    ///
    /// Calling `train` again after it completed does nothing and returns the
    /// first run's output.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset is empty, a step fails or a
    /// checkpoint cannot be written.
    pub fn train(&mut self) -> Result<TrainOutput> {
        if let Some(output) = &self.output {
            tracing::warn!("train() called again after completion; weights left untouched");
            return Ok(output.clone());
        }
        if self.dataset.is_empty() {
            return Err(HeartGptError::Dataset("training dataset is empty".into()));
        }

        let started = Instant::now();
        let sequences = self.tokenize(&self.dataset)?;
        let lengths: Vec<usize> = sequences.iter().map(|s| s.ids.len()).collect();
        let plan = StepPlan::new(sequences.len(), &self.training);
        let warmup = warmup_steps(self.training.warmup_ratio, plan.total_steps);

        let mut optimizer = OptimizerConfig::from_training(&self.training).build(self.model.varmap())?;
        let mut scheduler = LRScheduler::new(
            self.training.lr_scheduler_type,
            self.training.learning_rate,
            warmup,
            plan.total_steps,
        );
        optimizer.set_learning_rate(scheduler.get_lr());

        tracing::info!("Starting training");
        tracing::info!("  Examples: {}", sequences.len());
        tracing::info!("  Epochs: {}", plan.epochs);
        tracing::info!("  Batch size: {}", self.training.per_device_train_batch_size);
        tracing::info!("  Gradient accumulation: {}", self.training.gradient_accumulation_steps);
        tracing::info!("  Total optimization steps: {} ({} warmup)", plan.total_steps, warmup);
        tracing::info!("  Optimizer: {}, schedule: {:?}", self.training.optim, self.training.lr_scheduler_type);
        tracing::info!("  Trainable parameters: {}", self.model.trainable_param_count());

        std::fs::create_dir_all(&self.training.output_dir)?;

        let pb = ProgressBar::new(plan.total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );

        let vars = self.model.varmap().all_vars();
        let accum = self.training.gradient_accumulation_steps;
        let mut loss_sum = 0.0;
        let mut interval_loss = 0.0;
        let mut interval_steps = 0usize;
        let mut samples = 0usize;

        'epochs: for epoch in 0..plan.epochs {
            let batches = dataset::batches(
                &lengths,
                self.training.per_device_train_batch_size,
                self.training.group_by_length,
                epoch_seed(self.training.seed, epoch),
            );
            let usable = plan.steps_per_epoch * accum;
            for group in batches[..usable.min(batches.len())].chunks(accum) {
                let mut grads: Option<GradStore> = None;
                let mut step_loss = 0.0;
                for batch in group {
                    let rows: Vec<&Sequence> = batch.iter().map(|&i| &sequences[i]).collect();
                    let (input, labels) = collate(&rows, self.tokenizer.pad_id(), self.model.llama().device())?;
                    let mut cache = self.model.llama().new_cache(false)?;
                    let logits = self.model.llama().forward(&input, 0, &mut cache, true)?;
                    let loss = masked_cross_entropy(&logits, &labels)?;
                    step_loss += f64::from(loss.to_scalar::<f32>()?) / group.len() as f64;
                    let micro = loss.affine(1.0 / group.len() as f64, 0.0)?.backward()?;
                    grads = Some(match grads {
                        None => micro,
                        Some(acc) => accumulate(acc, micro, &vars)?,
                    });
                    samples += rows.len();
                }
                let Some(mut grads) = grads else { continue };

                let grad_norm = global_norm(&grads, &vars)?;
                if self.training.max_grad_norm > 0.0 && grad_norm > self.training.max_grad_norm {
                    scale_grads(&mut grads, &vars, self.training.max_grad_norm / (grad_norm + 1e-6))?;
                }
                let lr = optimizer.learning_rate();
                optimizer.step(&grads)?;
                optimizer.set_learning_rate(scheduler.step());

                self.step += 1;
                #[allow(clippy::cast_precision_loss)]
                let epoch_progress = self.step as f64 / plan.steps_per_epoch as f64;
                self.epoch = epoch_progress;
                loss_sum += step_loss;
                interval_loss += step_loss;
                interval_steps += 1;
                pb.set_message(format!("loss {step_loss:.4}"));
                pb.inc(1);

                if self.step % self.training.logging_steps == 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let entry = LogEntry {
                        step: self.step,
                        epoch: self.epoch,
                        loss: interval_loss / interval_steps as f64,
                        grad_norm,
                        learning_rate: lr,
                    };
                    tracing::info!(
                        "Step {}/{}, Epoch {:.2}, Loss: {:.4}, GradNorm: {:.4}, LR: {:.2e}",
                        entry.step,
                        plan.total_steps,
                        entry.epoch,
                        entry.loss,
                        entry.grad_norm,
                        entry.learning_rate
                    );
                    self.log_history.push(entry);
                    interval_loss = 0.0;
                    interval_steps = 0;
                }

                if self.training.save_steps > 0 && self.step % self.training.save_steps == 0 {
                    self.save_checkpoint(plan)?;
                }
                if self.step >= plan.total_steps {
                    break 'epochs;
                }
            }
        }
        pb.finish_with_message("training complete");

        if self.training.save_steps == 0 || self.step % self.training.save_steps != 0 {
            self.save_checkpoint(plan)?;
        }
        let state = self.state(plan);
        std::fs::write(
            Path::new(&self.training.output_dir).join("trainer_state.json"),
            serde_json::to_string_pretty(&state)?,
        )?;

        let runtime = started.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let output = TrainOutput {
            global_step: self.step,
            training_loss: if self.step == 0 { 0.0 } else { loss_sum / self.step as f64 },
            train_runtime: runtime,
            train_samples_per_second: if runtime > 0.0 { samples as f64 / runtime } else { 0.0 },
        };
        tracing::info!(
            "Training finished: {} steps, mean loss {:.4}, {:.1}s",
            output.global_step,
            output.training_loss,
            output.train_runtime
        );
        self.output = Some(output.clone());
        Ok(output)
    }

    /// Mean loss over `dataset` in batches of `per_device_eval_batch_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset is empty or a forward pass fails.
    pub fn evaluate(&self, dataset: &Dataset) -> Result<EvalOutput> {
        if dataset.is_empty() {
            return Err(HeartGptError::Dataset("evaluation dataset is empty".into()));
        }
        let sequences = self.tokenize(dataset)?;
        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in sequences.chunks(self.training.per_device_eval_batch_size) {
            let rows: Vec<&Sequence> = chunk.iter().collect();
            let (input, labels) = collate(&rows, self.tokenizer.pad_id(), self.model.llama().device())?;
            let mut cache = self.model.llama().new_cache(false)?;
            let logits = self.model.llama().forward(&input, 0, &mut cache, false)?;
            total += f64::from(masked_cross_entropy(&logits, &labels)?.to_scalar::<f32>()?);
            batches += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let eval_loss = total / batches as f64;
        tracing::info!("Eval loss {:.4} over {} examples", eval_loss, sequences.len());
        Ok(EvalOutput {
            eval_loss,
            eval_samples: sequences.len(),
        })
    }

    /// Write the adapter to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter files cannot be written.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        self.model.save_adapter(path)
    }

    fn tokenize(&self, dataset: &Dataset) -> Result<Vec<Sequence>> {
        let mut encoded = Vec::with_capacity(dataset.len());
        for example in &dataset.examples {
            encoded.push(self.tokenizer.encode(&example.text, true)?);
        }
        let rows = if self.sft.packing {
            dataset::pack(&encoded, self.tokenizer.eos_id(), self.max_seq_length)
        } else {
            for ids in &mut encoded {
                ids.truncate(self.max_seq_length);
            }
            encoded
        };
        if rows.is_empty() {
            return Err(HeartGptError::Dataset(format!(
                "packing produced no {}-token windows",
                self.max_seq_length
            )));
        }
        Ok(rows.into_iter().map(|ids| Sequence { ids }).collect())
    }

    fn state(&self, plan: StepPlan) -> TrainerState {
        TrainerState {
            global_step: self.step,
            epoch: self.epoch,
            max_steps: plan.total_steps,
            num_train_epochs: plan.epochs,
            logging_steps: self.training.logging_steps,
            save_steps: self.training.save_steps,
            train_batch_size: self.training.per_device_train_batch_size,
            log_history: self.log_history.clone(),
        }
    }

    /// Save `checkpoint-{step}` with the adapter, trainer state and config.
    fn save_checkpoint(&self, plan: StepPlan) -> Result<PathBuf> {
        let dir = Path::new(&self.training.output_dir).join(format!("checkpoint-{}", self.step));
        std::fs::create_dir_all(&dir)?;
        self.model.save_adapter(&dir)?;
        std::fs::write(
            dir.join("trainer_state.json"),
            serde_json::to_string_pretty(&self.state(plan))?,
        )?;
        let config = CheckpointConfig {
            adapter: &self.adapter,
            training: &self.training,
            sft: &self.sft,
        };
        std::fs::write(dir.join("config.yaml"), serde_yaml::to_string(&config)?)?;
        tracing::info!("Saved checkpoint to: {}", dir.display());
        Ok(dir)
    }
}

/// Right-pad rows to the longest one and build shifted labels.
///
/// Position `i` is labelled with token `i + 1`; positions without a next
/// real token get [`IGNORE_INDEX`].
fn collate(rows: &[&Sequence], pad_id: u32, device: &Device) -> Result<(Tensor, Vec<i64>)> {
    let width = rows.iter().map(|r| r.ids.len()).max().unwrap_or(0).max(1);
    let mut input = Vec::with_capacity(rows.len() * width);
    let mut labels = Vec::with_capacity(rows.len() * width);
    for row in rows {
        for i in 0..width {
            input.push(row.ids.get(i).copied().unwrap_or(pad_id));
            labels.push(row.ids.get(i + 1).map_or(IGNORE_INDEX, |&t| i64::from(t)));
        }
    }
    let input = Tensor::from_vec(input, (rows.len(), width), device)?;
    Ok((input, labels))
}

/// Mean negative log-likelihood over positions whose label is not ignored.
///
/// `logits` is `[batch, seq, vocab]`, `labels` holds `batch * seq` entries.
pub fn masked_cross_entropy(logits: &Tensor, labels: &[i64]) -> Result<Tensor> {
    let (b, s, vocab) = logits.dims3()?;
    let positions = b * s;
    if labels.len() != positions {
        return Err(HeartGptError::Training(format!(
            "logits cover {positions} positions but {} labels were given",
            labels.len()
        )));
    }
    let device = logits.device();

    let mut targets = Vec::with_capacity(positions);
    let mut mask = Vec::with_capacity(positions);
    for &label in labels {
        match usize::try_from(label) {
            Ok(t) if t < vocab => {
                #[allow(clippy::cast_possible_truncation)]
                targets.push(t as u32);
                mask.push(1f32);
            }
            _ => {
                targets.push(0);
                mask.push(0.0);
            }
        }
    }
    let valid: f32 = mask.iter().sum();
    if valid == 0.0 {
        return Ok(Tensor::new(0f32, device)?);
    }

    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((positions, vocab))?, D::Minus1)?;
    let targets = Tensor::from_vec(targets, (positions, 1), device)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
    let mask = Tensor::from_vec(mask, positions, device)?;
    let total = (picked * mask)?.sum_all()?.neg()?;
    Ok((total / f64::from(valid))?)
}

fn accumulate(mut acc: GradStore, micro: GradStore, vars: &[Var]) -> Result<GradStore> {
    for var in vars {
        let Some(g) = micro.get(var.as_tensor()) else {
            continue;
        };
        let summed = match acc.get(var.as_tensor()) {
            Some(prev) => (prev + g)?,
            None => g.clone(),
        };
        acc.insert(var.as_tensor(), summed);
    }
    Ok(acc)
}

/// L2 norm over every variable's gradient.
fn global_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum += f64::from(g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?);
        }
    }
    Ok(sum.sqrt())
}

fn scale_grads(grads: &mut GradStore, vars: &[Var], factor: f64) -> Result<()> {
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let scaled = g.affine(factor, 0.0)?;
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(())
}
