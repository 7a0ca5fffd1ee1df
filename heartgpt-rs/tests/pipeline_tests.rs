//! Stage ordering and hand-off checks for the pipeline orchestrator.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use heartgpt_rs::config::{AdapterConfig, GenerationConfig, HubConfig, SftConfig, TrainingConfig};
use heartgpt_rs::{
    Backend, Credentials, Generation, HeartGptError, Pipeline, PipelineConfig, PublishReport,
    Result, TrainOutput,
};

type Log = Rc<RefCell<Vec<String>>>;

struct StubSession {
    log: Log,
}

impl Drop for StubSession {
    fn drop(&mut self) {
        self.log.borrow_mut().push("drop_session".into());
    }
}

#[derive(Default)]
struct Received {
    adapter: Option<AdapterConfig>,
    training: Option<TrainingConfig>,
    sft: Option<SftConfig>,
    saved_adapter: Option<PathBuf>,
    merged_adapter: Option<PathBuf>,
    prompts: Vec<String>,
    published_repo: Option<String>,
    published_dir: Option<PathBuf>,
}

struct StubBackend {
    log: Log,
    received: Received,
    fail_at: Option<&'static str>,
}

impl StubBackend {
    fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            received: Received::default(),
            fail_at: None,
        }
    }

    fn failing_at(stage: &'static str) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::new()
        }
    }

    fn record(&self, stage: &str) -> Result<()> {
        self.log.borrow_mut().push(stage.to_string());
        if self.fail_at == Some(stage) {
            return Err(HeartGptError::Other(format!("{stage} failed")));
        }
        Ok(())
    }

    fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

fn train_output() -> TrainOutput {
    TrainOutput {
        global_step: 3,
        training_loss: 1.25,
        train_runtime: 0.5,
        train_samples_per_second: 24.0,
    }
}

impl Backend for StubBackend {
    type Dataset = Vec<String>;
    type Model = &'static str;
    type Session = StubSession;

    fn fetch_dataset(&mut self, _config: &PipelineConfig) -> Result<Vec<String>> {
        self.record("fetch_dataset")?;
        Ok(vec!["<s>[INST] apple [/INST] Heart-healthy".into()])
    }

    fn load_quantized_model(&mut self, _config: &PipelineConfig) -> Result<&'static str> {
        self.record("load_quantized_model")?;
        Ok("quantized")
    }

    fn train(
        &mut self,
        model: &'static str,
        dataset: Vec<String>,
        adapter: AdapterConfig,
        training: TrainingConfig,
        sft: SftConfig,
    ) -> Result<(StubSession, TrainOutput)> {
        assert_eq!(model, "quantized");
        assert_eq!(dataset.len(), 1);
        self.record("train")?;
        self.received.adapter = Some(adapter);
        self.received.training = Some(training);
        self.received.sft = Some(sft);
        Ok((
            StubSession {
                log: Rc::clone(&self.log),
            },
            train_output(),
        ))
    }

    fn save_adapter(&mut self, _session: &StubSession, path: &Path) -> Result<()> {
        self.record("save_adapter")?;
        self.received.saved_adapter = Some(path.to_path_buf());
        Ok(())
    }

    fn generate(
        &mut self,
        _session: &StubSession,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<Vec<Generation>> {
        self.record("generate")?;
        self.received.prompts.push(prompt.to_string());
        Ok(vec![Generation {
            generated_text: format!("{prompt} Heart-healthy"),
        }])
    }

    fn load_full_precision(&mut self, _config: &PipelineConfig) -> Result<&'static str> {
        self.record("load_full_precision")?;
        Ok("dense")
    }

    fn merge(&mut self, base: &'static str, adapter_dir: &Path, output_dir: &Path) -> Result<PathBuf> {
        assert_eq!(base, "dense");
        self.record("merge")?;
        self.received.merged_adapter = Some(adapter_dir.to_path_buf());
        Ok(output_dir.to_path_buf())
    }

    fn publish(
        &mut self,
        model_dir: &Path,
        repo_id: &str,
        _hub: &HubConfig,
        credentials: &Credentials,
    ) -> Result<PublishReport> {
        assert_eq!(credentials.token(), "hf_test");
        self.record("publish")?;
        self.received.published_repo = Some(repo_id.to_string());
        self.received.published_dir = Some(model_dir.to_path_buf());
        Ok(PublishReport {
            repo_id: format!("someone/{repo_id}"),
            repo_url: format!("https://huggingface.co/someone/{repo_id}"),
            files_uploaded: 6,
        })
    }
}

fn pipeline(config: PipelineConfig) -> Pipeline {
    Pipeline::with_credentials(config, Some(Credentials::new("hf_test"))).unwrap()
}

#[test]
fn test_stages_run_in_order_and_session_drops_before_reload() {
    let mut config = PipelineConfig::default();
    config.generation.prompts = vec!["what is an apple####".into()];
    let mut backend = StubBackend::new();

    pipeline(config).run(&mut backend).unwrap();

    assert_eq!(
        backend.events(),
        vec![
            "fetch_dataset",
            "load_quantized_model",
            "train",
            "save_adapter",
            "generate",
            "drop_session",
            "load_full_precision",
            "merge",
            "publish",
        ]
    );
}

#[test]
fn test_configs_reach_trainer_unmodified() {
    let mut config = PipelineConfig::default();
    config.adapter.rank = 8;
    config.training.max_steps = Some(5);
    config.sft.packing = true;
    let mut backend = StubBackend::new();

    pipeline(config.clone()).run(&mut backend).unwrap();

    assert_eq!(backend.received.adapter.as_ref(), Some(&config.adapter));
    assert_eq!(backend.received.training.as_ref(), Some(&config.training));
    assert_eq!(backend.received.sft.as_ref(), Some(&config.sft));
}

#[test]
fn test_merge_uses_saved_adapter_path_and_publish_uses_repo_name() {
    let mut config = PipelineConfig::default();
    config.new_model = "adapters/heartgpt-test".into();
    config.merged_output_dir = "out/merged".into();
    config.hub.repo_id = "heartgpt-test-repo".into();
    let mut backend = StubBackend::new();

    let report = pipeline(config).run(&mut backend).unwrap();

    let saved = backend.received.saved_adapter.clone().unwrap();
    assert_eq!(saved, PathBuf::from("adapters/heartgpt-test"));
    assert_eq!(backend.received.merged_adapter, Some(saved.clone()));
    assert_eq!(report.adapter_path, saved);
    assert_eq!(backend.received.published_repo.as_deref(), Some("heartgpt-test-repo"));
    assert_eq!(backend.received.published_dir, Some(PathBuf::from("out/merged")));
    assert_eq!(report.merged_path, PathBuf::from("out/merged"));
    assert_eq!(report.publish.unwrap().files_uploaded, 6);
}

#[test]
fn test_prompts_are_wrapped_in_instruction_template() {
    let mut config = PipelineConfig::default();
    config.generation.prompts = vec!["  spaced  prompt ".into(), "second".into()];
    let mut backend = StubBackend::new();

    let report = pipeline(config).run(&mut backend).unwrap();

    assert_eq!(
        backend.received.prompts,
        vec!["<s>[INST]   spaced  prompt  [/INST]", "<s>[INST] second [/INST]"]
    );
    assert_eq!(report.generations.len(), 2);
    assert!(report.generations[0].generations[0]
        .generated_text
        .starts_with(&report.generations[0].prompt));
}

#[test]
fn test_toggles_skip_inference_and_push() {
    let mut config = PipelineConfig::default();
    config.run_inference = false;
    config.push_to_hub = false;
    let mut backend = StubBackend::new();

    let report = pipeline(config).run(&mut backend).unwrap();

    let events = backend.events();
    assert!(!events.iter().any(|e| e == "generate" || e == "publish"));
    assert!(report.generations.is_empty());
    assert!(report.publish.is_none());
    assert_eq!(report.train_output, train_output());
}

#[test]
fn test_failure_stops_later_stages() {
    let mut backend = StubBackend::failing_at("train");

    let err = pipeline(PipelineConfig::default()).run(&mut backend).unwrap_err();

    assert!(err.to_string().contains("train failed"));
    assert_eq!(backend.events(), vec!["fetch_dataset", "load_quantized_model", "train"]);
}

#[test]
fn test_merge_failure_skips_publish() {
    let mut backend = StubBackend::failing_at("merge");

    assert!(pipeline(PipelineConfig::default()).run(&mut backend).is_err());
    assert!(!backend.events().iter().any(|e| e == "publish"));
}

#[test]
fn test_missing_credentials_rejected_before_any_stage() {
    let config = PipelineConfig::default();
    assert!(config.push_to_hub);

    let err = Pipeline::with_credentials(config, None).unwrap_err();
    assert!(matches!(err, HeartGptError::Auth(_)));
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let mut config = PipelineConfig::default();
    config.adapter.dropout = 1.0;

    let err = Pipeline::with_credentials(config, Some(Credentials::new("hf_test"))).unwrap_err();
    assert!(matches!(err, HeartGptError::Config(_)));
}
