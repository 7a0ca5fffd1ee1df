//! CLI entry point for heartgpt-rs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use heartgpt_rs::{
    instruction_prompt, merge_adapter, Backend, CandleBackend, Credentials, HfPublisher, Pipeline,
    PipelineConfig, Result, TextGenerator,
};

#[derive(Parser)]
#[command(name = "heartgpt")]
#[command(about = "QLoRA fine-tuning pipeline for the HeartGPT model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline
    Run {
        /// Path to configuration file
        config: String,
        /// Skip the inference smoke tests
        #[arg(long)]
        skip_inference: bool,
        /// Skip the hub upload
        #[arg(long)]
        skip_push: bool,
    },
    /// Train and save the adapter
    Train {
        /// Path to configuration file
        config: String,
    },
    /// Generate text with a base model plus adapter
    Generate {
        /// Path to configuration file
        config: String,
        /// Path to adapter directory
        #[arg(long)]
        adapter: String,
        /// Prompt to run; defaults to the configured prompts
        #[arg(long)]
        prompt: Vec<String>,
    },
    /// Merge adapter weights into base model
    Merge {
        /// Path to configuration file
        #[arg(long)]
        config: String,
        /// Path to adapter directory
        #[arg(long)]
        adapter: Option<String>,
        /// Output directory for merged model
        #[arg(long)]
        output: String,
    },
    /// Upload a model directory to the hub
    Push {
        /// Path to configuration file
        #[arg(long)]
        config: String,
        /// Directory to upload
        #[arg(long)]
        model_dir: String,
        /// Repository to push to; defaults to hub.repo_id
        #[arg(long)]
        repo_id: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (heartgpt, heartgpt-smoke)
        #[arg(long, default_value = "heartgpt")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            skip_inference,
            skip_push,
        } => {
            tracing::info!("Running pipeline with config: {}", config);
            let mut config = PipelineConfig::from_file(&config)?;
            config.run_inference &= !skip_inference;
            config.push_to_hub &= !skip_push;

            let pipeline = Pipeline::new(config)?;
            let mut backend = CandleBackend::for_pipeline(&pipeline)?;
            let report = pipeline.run(&mut backend)?;

            println!("✓ Training finished after {} steps", report.train_output.global_step);
            println!("  Loss: {:.4}", report.train_output.training_loss);
            println!("  Adapter: {}", report.adapter_path.display());
            println!("  Merged model: {}", report.merged_path.display());
            if let Some(publish) = report.publish {
                println!("✓ Pushed {} files to {}", publish.files_uploaded, publish.repo_url);
            }
        }
        Commands::Train { config } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = PipelineConfig::from_file(&config)?;
            config.push_to_hub = false;
            let pipeline = Pipeline::new(config)?;
            let config = pipeline.config();
            let mut backend = CandleBackend::for_pipeline(&pipeline)?;

            let dataset = backend.fetch_dataset(config)?;
            let model = backend.load_quantized_model(config)?;
            let (session, output) = backend.train(
                model,
                dataset,
                config.adapter.clone(),
                config.training.clone(),
                config.sft.clone(),
            )?;
            backend.save_adapter(&session, Path::new(&config.new_model))?;
            println!("✓ Training finished after {} steps", output.global_step);
            println!("  Adapter saved to: {}", config.new_model);
        }
        Commands::Generate {
            config,
            adapter,
            prompt,
        } => {
            let config = PipelineConfig::from_file(&config)?;
            config.validate()?;
            let credentials = Credentials::resolve(config.hub.token.as_deref());
            let mut backend = CandleBackend::new(config.generation.seed, credentials.as_ref())?;

            let base = backend.load_full_precision(&config)?;
            let merged = merge_adapter(base.model, Path::new(&adapter))?;
            let generator = TextGenerator::new(merged.model().llama(), &base.tokenizer, config.generation.clone());

            let prompts = if prompt.is_empty() {
                config.generation.prompts.clone()
            } else {
                prompt
            };
            for p in prompts {
                for generation in generator.generate(&instruction_prompt(&p))? {
                    println!("{}", generation.generated_text);
                }
            }
        }
        Commands::Merge {
            config,
            adapter,
            output,
        } => {
            tracing::info!("Merging adapter to: {}", output);
            let config = PipelineConfig::from_file(&config)?;
            config.validate()?;
            let adapter_path = adapter.unwrap_or_else(|| config.new_model.clone());
            let credentials = Credentials::resolve(config.hub.token.as_deref());
            let mut backend = CandleBackend::new(config.training.seed, credentials.as_ref())?;

            let base = backend.load_full_precision(&config)?;
            backend.merge(base, Path::new(&adapter_path), &PathBuf::from(&output))?;
            println!("✓ Merged model saved to: {output}");
        }
        Commands::Push {
            config,
            model_dir,
            repo_id,
        } => {
            let config = PipelineConfig::from_file(&config)?;
            let repo_id = repo_id.unwrap_or_else(|| config.hub.repo_id.clone());
            let credentials = Credentials::require(config.hub.token.as_deref())?;
            tracing::info!("Pushing {} to {}", model_dir, repo_id);

            let publisher = HfPublisher::new(credentials)?;
            let report = publisher.push(
                Path::new(&model_dir),
                &repo_id,
                config.hub.private,
                &config.hub.commit_message,
            )?;
            println!("✓ Pushed {} files to {}", report.files_uploaded, report.repo_url);
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = PipelineConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model_name);
            println!("  Dataset: {}", config.dataset_name);
            println!(
                "  Adapter: r={} alpha={} targets={}",
                config.adapter.rank,
                config.adapter.alpha,
                config.adapter.target_modules.join(",")
            );
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = PipelineConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
