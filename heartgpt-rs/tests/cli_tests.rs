//! Integration tests for the heartgpt CLI.

use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` to `config.yaml` inside `dir`.
fn create_test_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// Run the heartgpt CLI with the given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("heartgpt").expect("Failed to find heartgpt binary");
    cmd.args(args);
    cmd
}

fn valid_config_yaml() -> &'static str {
    r#"
model_name: "NousResearch/Llama-2-7b-chat-hf"
dataset_name: "adarsha30735/datafood"
new_model: "llama-2-7b-heartgpt"

quantization:
  quant_type: nf4
  compute_dtype: float16

adapter:
  rank: 64
  alpha: 16
  dropout: 0.1
  target_modules:
    - q_proj
    - v_proj

training:
  num_train_epochs: 1
  per_device_train_batch_size: 4
  learning_rate: 0.0002
  max_steps: -1
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), valid_config_yaml());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("r=64 alpha=16 targets=q_proj,v_proj"));
}

#[test]
fn test_validate_command_empty_config_is_recipe() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "{}\n");

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("NousResearch/Llama-2-7b-chat-hf"));
}

#[test]
fn test_validate_command_rejects_zero_rank() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "adapter:\n  rank: 0\n");

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("rank"));
}

#[test]
fn test_validate_command_rejects_unknown_quant_type() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "quantization:\n  quant_type: int3\n");

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicates::str::contains("ConfigParse"));
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"]).assert().failure();
}

#[test]
fn test_run_command_help() {
    run_cli(&["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Run the whole pipeline"))
        .stdout(predicates::str::contains("--skip-inference"))
        .stdout(predicates::str::contains("--skip-push"));
}

#[test]
fn test_merge_command_help() {
    run_cli(&["merge", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Merge adapter weights"))
        .stdout(predicates::str::contains("--config"))
        .stdout(predicates::str::contains("--adapter"))
        .stdout(predicates::str::contains("--output"));
}

#[test]
fn test_push_command_help() {
    run_cli(&["push", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--model-dir"))
        .stdout(predicates::str::contains("--repo-id"));
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("test_config.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--preset", "heartgpt"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration written"));

    let content = fs::read_to_string(&output_path).expect("Failed to read generated config");
    assert!(content.contains("model_name"));
    assert!(content.contains("adarsha30735/datafood"));
    assert!(!content.contains("token:"));
}

#[test]
fn test_init_then_validate_roundtrip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("smoke.yaml");
    let output = output_path.to_str().unwrap();

    run_cli(&["init", output, "--preset", "heartgpt-smoke"]).assert().success();
    run_cli(&["validate", output]).assert().success();
}

#[test]
fn test_init_unknown_preset_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("x.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--preset", "gpt-9"])
        .assert()
        .failure();
    assert!(!output_path.exists());
}

#[test]
fn test_push_without_token_fails_before_upload() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "{}\n");
    let home = TempDir::new().expect("Failed to create temp home");

    run_cli(&[
        "push",
        "--config",
        config_path.to_str().unwrap(),
        "--model-dir",
        temp_dir.path().to_str().unwrap(),
    ])
    .env_remove("HF_TOKEN")
    .env("HOME", home.path())
    .assert()
    .failure()
    .stderr(predicates::str::contains("Auth"));
}

#[test]
fn test_cli_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("QLoRA fine-tuning pipeline"))
        .stdout(predicates::str::contains("run"))
        .stdout(predicates::str::contains("generate"))
        .stdout(predicates::str::contains("merge"))
        .stdout(predicates::str::contains("push"));
}

#[test]
fn test_cli_version() {
    run_cli(&["--version"])
        .assert()
        .success()
        .stdout(predicates::str::contains("heartgpt"));
}
