//! Integration tests for the finetune CLI.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("finetune").expect("Failed to find finetune binary");
    cmd.args(args)
        .env_remove("FINETUNE_TRAINER")
        .env_remove("RANK")
        .env_remove("LOCAL_RANK");
    cmd
}

fn write_run_file(dir: &Path, content: &str) -> String {
    let path = dir.join("run.yaml");
    fs::write(&path, content).expect("Failed to write run file");
    path.to_string_lossy().into_owned()
}

/// Run file pointing at a local tiny model and dataset.
fn local_run_yaml(root: &Path) -> String {
    let model = common::write_tiny_model(root);
    let data = root.join("train.jsonl");
    common::write_records(&data, 4);
    format!(
        "model:\n  model_name: {}\ndata:\n  hf_data_path: {}\ntraining:\n  output_dir: {}\n  model_max_length: 48\nadapter:\n  lora_r: 8\n",
        model.display(),
        data.display(),
        root.join("out").display()
    )
}

#[test]
fn test_help_lists_commands() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("checkpoints"));
}

#[test]
fn test_train_help_shows_argument_groups() {
    run_cli(&["train", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--model-name"))
        .stdout(predicate::str::contains("--bnb-4bit-quant-type"))
        .stdout(predicate::str::contains("--lora-r"))
        .stdout(predicate::str::contains("--trainer-cmd"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_init_then_validate() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("run.yaml");
    let output = output.to_str().unwrap();

    run_cli(&["init", output])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run file written"));

    let content = fs::read_to_string(output).unwrap();
    assert!(content.contains("model_name: meta-llama/Llama-2-7b-hf"));
    assert!(content.contains("bnb_4bit_quant_type: nf4"));

    run_cli(&["validate", output])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run file is valid"))
        .stdout(predicate::str::contains("meta-llama/Llama-2-7b-hf"));
}

#[test]
fn test_validate_rejects_bad_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), "adapter:\n  lora_r: 0\n");

    run_cli(&["validate", &path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lora_r"));
}

#[test]
fn test_validate_rejects_unknown_quant_type() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), "quantization:\n  bnb_4bit_quant_type: int3\n");

    run_cli(&["validate", &path]).assert().failure();
}

#[test]
fn test_validate_missing_file() {
    run_cli(&["validate", "/nonexistent/run.yaml"]).assert().failure();
}

#[test]
fn test_train_requires_launch_mode() {
    run_cli(&["train"]).assert().failure();
}

#[test]
fn test_dry_run_overrides_trainer_from_env() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), &local_run_yaml(temp_dir.path()));

    run_cli(&["run", &path, "--dry-run"])
        .env("FINETUNE_TRAINER", "false")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));
}

#[cfg(unix)]
#[test]
fn test_trainer_cmd_from_env() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), &local_run_yaml(temp_dir.path()));

    run_cli(&["run", &path])
        .env("FINETUNE_TRAINER", "true")
        .assert()
        .success()
        .stdout(predicate::str::contains("Training finished at step 0"));
}

#[test]
fn test_train_rejects_invalid_enum_flag() {
    run_cli(&["train", "--dry-run", "--bias", "some"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn test_checkpoints_command() {
    let temp_dir = TempDir::new().unwrap();
    for step in [5, 12] {
        fs::create_dir(temp_dir.path().join(format!("checkpoint-{step}"))).unwrap();
    }
    fs::create_dir(temp_dir.path().join("logs")).unwrap();

    run_cli(&["checkpoints", temp_dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("(step 5)"))
        .stdout(predicate::str::contains("(step 12)"))
        .stdout(predicate::str::contains("logs").not())
        .stdout(predicate::str::is_match("Resume target: .*checkpoint-12").unwrap());
}

#[test]
fn test_checkpoints_empty_dir() {
    let temp_dir = TempDir::new().unwrap();

    run_cli(&["checkpoints", temp_dir.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints"))
        .stdout(predicate::str::contains("Resume target: none"));
}

#[test]
fn test_run_dry_run_writes_artifacts() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), &local_run_yaml(temp_dir.path()));

    run_cli(&["run", &path, "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"));

    let out = temp_dir.path().join("out");
    for name in [
        "adapter_config.json",
        "quantization_config.json",
        "train_dataset.jsonl",
        "finetune_args.yaml",
        "finetune_job.json",
    ] {
        assert!(out.join(name).exists(), "{name} missing");
    }

    let adapter: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("adapter_config.json")).unwrap())
            .unwrap();
    assert_eq!(adapter["r"], 8);
    assert_eq!(adapter["task_type"], "CAUSAL_LM");
}

#[test]
fn test_train_flags_dry_run() {
    let temp_dir = TempDir::new().unwrap();
    let model = common::write_tiny_model(temp_dir.path());
    let data = temp_dir.path().join("train.jsonl");
    common::write_records(&data, 2);
    let out = temp_dir.path().join("out");

    run_cli(&[
        "train",
        "--model-name",
        model.to_str().unwrap(),
        "--hf-data-path",
        data.to_str().unwrap(),
        "--output-dir",
        out.to_str().unwrap(),
        "--bnb-4bit-quant-type",
        "fp4",
        "--use-nested-quant",
        "--dry-run",
    ])
    .assert()
    .success();

    let bnb: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("quantization_config.json")).unwrap())
            .unwrap();
    assert_eq!(bnb["bnb_4bit_quant_type"], "fp4");
    assert_eq!(bnb["bnb_4bit_compute_dtype"], "float16");
    assert_eq!(bnb["bnb_4bit_use_double_quant"], true);
}

#[cfg(unix)]
#[test]
fn test_run_with_external_trainer() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_run_file(temp_dir.path(), &local_run_yaml(temp_dir.path()));

    run_cli(&["run", &path, "--trainer-cmd", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Training finished at step 0"));

    run_cli(&["run", &path, "--trainer-cmd", "false"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Training"));
}
