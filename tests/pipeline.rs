//! End-to-end preparation against a local model snapshot and dataset.

mod common;

use std::fs;
use std::path::Path;

use finetune_rs::adapter::{LoraBias, LoraConfig};
use finetune_rs::dataset::{TokenizedExample, IGNORE_INDEX};
use finetune_rs::trainer::{
    finetune, prepare, DryRun, PrepareOptions, JOB_MANIFEST_NAME, TRAIN_DATA_NAME,
};
use finetune_rs::{FinetuneArgs, FinetuneError};
use tempfile::TempDir;

fn local_args(root: &Path) -> FinetuneArgs {
    let model = common::write_tiny_model(root);

    let data = root.join("dataset");
    common::write_records(&data.join("data/train-00000-of-00001.jsonl"), 3);
    common::write_records(&data.join("data/test-00000-of-00001.jsonl"), 7);

    let mut args = FinetuneArgs::default();
    args.model.model_name = model.to_string_lossy().into_owned();
    args.data.hf_data_path = data.to_string_lossy().into_owned();
    args.training.output_dir = root.join("results");
    args.training.model_max_length = 48;
    args.training.process_index = 0;
    args.training.local_process_index = 0;
    args.adapter.lora_r = 16;
    args.adapter.bias = LoraBias::LoraOnly;
    args
}

fn read_examples(path: &Path) -> Vec<TokenizedExample> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_prepare_uses_requested_split_only() {
    let dir = TempDir::new().unwrap();
    let args = local_args(dir.path());

    let job = prepare(&args, &PrepareOptions::default()).unwrap();
    assert_eq!(job.num_train_examples, 3);

    let examples = read_examples(&job.train_dataset);
    assert_eq!(examples.len(), 3);
    for example in &examples {
        assert_eq!(example.input_ids.len(), example.labels.len());
        assert_eq!(example.input_ids.len(), example.attention_mask.len());
        assert_eq!(example.labels[0], IGNORE_INDEX);
        assert_eq!(example.input_ids.last(), Some(&2));
        assert_eq!(example.labels.last(), Some(&2));
    }
}

#[test]
fn test_adapter_config_matches_arguments() {
    let dir = TempDir::new().unwrap();
    let args = local_args(dir.path());

    prepare(&args, &PrepareOptions::default()).unwrap();

    let config = LoraConfig::from_pretrained(&args.training.output_dir).unwrap();
    assert_eq!(config.r, 16);
    assert_eq!(config.lora_alpha, 16);
    assert_eq!(config.bias, LoraBias::LoraOnly);
    assert_eq!(
        config.base_model_name_or_path.as_deref(),
        Some(args.model.model_name.as_str())
    );
}

#[test]
fn test_saved_run_file_reloads() {
    let dir = TempDir::new().unwrap();
    let args = local_args(dir.path());

    prepare(&args, &PrepareOptions::default()).unwrap();

    let reloaded =
        FinetuneArgs::from_file(args.training.output_dir.join("finetune_args.yaml")).unwrap();
    assert_eq!(reloaded.adapter, args.adapter);
    assert_eq!(reloaded.quantization, args.quantization);
    assert_eq!(reloaded.data, args.data);
}

#[test]
fn test_resume_from_existing_checkpoints() {
    let dir = TempDir::new().unwrap();
    let args = local_args(dir.path());
    for step in [5, 12] {
        fs::create_dir_all(args.training.output_dir.join(format!("checkpoint-{step}"))).unwrap();
    }
    fs::write(args.training.output_dir.join("checkpoint-99"), b"stray file").unwrap();

    let job = prepare(&args, &PrepareOptions::default()).unwrap();
    let resume = job.resume_from_checkpoint.unwrap();
    assert!(resume.ends_with("checkpoint-12"));

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(args.training.output_dir.join(JOB_MANIFEST_NAME)).unwrap(),
    )
    .unwrap();
    assert!(manifest["resume_from_checkpoint"]
        .as_str()
        .unwrap()
        .ends_with("checkpoint-12"));

    let outcome = finetune(&args, &PrepareOptions::default(), &mut DryRun).unwrap();
    assert_eq!(outcome.global_step, 12);
}

#[test]
fn test_overwrite_output_dir_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let mut args = local_args(dir.path());
    args.training.overwrite_output_dir = true;
    fs::create_dir_all(args.training.output_dir.join("checkpoint-5")).unwrap();

    let job = prepare(&args, &PrepareOptions::default()).unwrap();
    assert!(job.resume_from_checkpoint.is_none());
}

#[test]
fn test_resume_latest_without_checkpoints_fails() {
    let dir = TempDir::new().unwrap();
    let mut args = local_args(dir.path());
    args.training.resume_from_checkpoint = Some("latest".into());

    assert!(matches!(
        prepare(&args, &PrepareOptions::default()),
        Err(FinetuneError::Checkpoint(_))
    ));
}

#[test]
fn test_personal_data_only() {
    let dir = TempDir::new().unwrap();
    let mut args = local_args(dir.path());
    let personal = dir.path().join("notes.json");
    fs::write(
        &personal,
        r#"[{"instruction": "print hello", "output": "print hello"}]"#,
    )
    .unwrap();
    args.data.hf_data_path = String::new();
    args.data.personal_data = Some(personal);

    let job = prepare(&args, &PrepareOptions::default()).unwrap();
    assert_eq!(job.num_train_examples, 1);
    assert!(args.training.output_dir.join(TRAIN_DATA_NAME).exists());
}

#[test]
fn test_missing_split_is_dataset_error() {
    let dir = TempDir::new().unwrap();
    let mut args = local_args(dir.path());
    args.data.data_split = "validation".into();

    assert!(matches!(
        prepare(&args, &PrepareOptions::default()),
        Err(FinetuneError::Dataset(_))
    ));
}
