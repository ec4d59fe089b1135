//! Fine-tuning entry point.
//!
//! [`prepare`] turns [`FinetuneArgs`] into a [`FinetuneJob`]: configs built,
//! model and tokenizer acquired, resume point decided, data tokenized, and
//! every artifact the trainer needs written into the output directory.
//! [`finetune`] then hands the job to a [`TrainerBackend`] and saves whatever
//! weights the backend returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::adapter::{build_lora_config, LoraConfig};
use crate::args::{FinetuneArgs, TrainingArguments};
use crate::checkpoint::{checkpoint_step, latest_checkpoint, resolve_resume};
use crate::dataset::{acquire_dataset, load_records, preprocess_data, write_jsonl};
use crate::error::{FinetuneError, Result};
use crate::model::{acquire_model, load_tokenizer};
use crate::quantization::{build_bnb_config, BitsAndBytesConfig};

/// Job manifest handed to the trainer.
pub const JOB_MANIFEST_NAME: &str = "finetune_job.json";
/// Tokenized training set.
pub const TRAIN_DATA_NAME: &str = "train_dataset.jsonl";
/// Resolved arguments, loadable with `finetune run`.
pub const ARGS_FILE_NAME: &str = "finetune_args.yaml";
/// Adapter weights written by [`safe_save_model`].
pub const ADAPTER_WEIGHTS_NAME: &str = "adapter_model.safetensors";

/// Knobs for [`prepare`] that are not part of the run description.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Download base model weights, not just config and tokenizer.
    pub fetch_weights: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            fetch_weights: true,
        }
    }
}

/// Everything a trainer needs to run.
#[derive(Debug, Clone, Serialize)]
pub struct FinetuneJob {
    /// Base model id or path as given.
    pub model_name: String,
    /// Name of the fine-tuned model.
    pub new_model_name: String,
    /// Local snapshot directory.
    pub model_dir: PathBuf,
    /// Base model weight files.
    pub weights: Vec<PathBuf>,
    /// Device placement passed through.
    pub device_map: String,
    /// 4-bit loading config.
    pub quantization_config: BitsAndBytesConfig,
    /// Adapter config.
    pub lora_config: LoraConfig,
    /// Trainer hyperparameters.
    pub training_args: TrainingArguments,
    /// Tokenized training set.
    pub train_dataset: PathBuf,
    /// Number of tokenized examples.
    pub num_train_examples: usize,
    /// Checkpoint to resume from.
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Padding id (the tokenizer's EOS).
    pub pad_token_id: u32,
}

impl FinetuneJob {
    /// Path of the written manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.training_args.output_dir.join(JOB_MANIFEST_NAME)
    }

    /// Where the final model is saved.
    #[must_use]
    pub fn final_model_dir(&self) -> PathBuf {
        self.training_args.output_dir.join(&self.new_model_name)
    }

    /// Optimizer steps per epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        let per_step = self.training_args.per_device_train_batch_size
            * self.training_args.gradient_accumulation_steps;
        self.num_train_examples.div_ceil(per_step.max(1))
    }
}

/// Result of a training run.
#[derive(Debug, Default)]
pub struct TrainOutcome {
    /// Last completed optimizer step.
    pub global_step: usize,
    /// Trained weights, when the backend trains in-process.
    pub state_dict: Option<HashMap<String, Tensor>>,
}

/// Something that can execute a prepared job.
pub trait TrainerBackend {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run training for `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if training fails.
    fn train(&mut self, job: &FinetuneJob) -> Result<TrainOutcome>;
}

/// Runs an external trainer program with `--job <manifest>`.
#[derive(Debug, Clone)]
pub struct ExternalTrainer {
    program: String,
    args: Vec<String>,
}

impl ExternalTrainer {
    /// Trainer invoked as `program args... --job <manifest>`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] for an empty command.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| FinetuneError::Config("trainer command is empty".into()))?;
        Ok(Self::new(program, parts.collect()))
    }
}

impl TrainerBackend for ExternalTrainer {
    fn name(&self) -> &str {
        &self.program
    }

    fn train(&mut self, job: &FinetuneJob) -> Result<TrainOutcome> {
        let manifest = job.manifest_path();
        tracing::info!("Launching {} {:?} --job {}", self.program, self.args, manifest.display());

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--job")
            .arg(&manifest)
            .env("FINETUNE_JOB", &manifest)
            .status()
            .map_err(|e| FinetuneError::Training(format!("failed to start {}: {e}", self.program)))?;

        if !status.success() {
            return Err(FinetuneError::Training(format!(
                "{} exited with {status}",
                self.program
            )));
        }

        let global_step = latest_checkpoint(&job.training_args.output_dir)?
            .and_then(|p| checkpoint_step(&p))
            .unwrap_or(0);
        Ok(TrainOutcome {
            global_step,
            state_dict: None,
        })
    }
}

/// Logs the plan and trains nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRun;

impl TrainerBackend for DryRun {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn train(&mut self, job: &FinetuneJob) -> Result<TrainOutcome> {
        tracing::info!("Dry run, not training");
        tracing::info!("  Base model: {} ({})", job.model_name, job.model_dir.display());
        tracing::info!(
            "  Quantization: {:?}-bit {} / compute {}",
            job.quantization_config.bits(),
            job.quantization_config.bnb_4bit_quant_type,
            job.quantization_config.bnb_4bit_compute_dtype
        );
        tracing::info!(
            "  LoRA: r={}, alpha={}, dropout={}",
            job.lora_config.r,
            job.lora_config.lora_alpha,
            job.lora_config.lora_dropout
        );
        tracing::info!(
            "  Examples: {} ({} steps/epoch)",
            job.num_train_examples,
            job.steps_per_epoch()
        );
        if let Some(ref checkpoint) = job.resume_from_checkpoint {
            tracing::info!("  Resume from: {}", checkpoint.display());
        }

        Ok(TrainOutcome {
            global_step: job
                .resume_from_checkpoint
                .as_deref()
                .and_then(checkpoint_step)
                .unwrap_or(0),
            state_dict: None,
        })
    }
}

/// Build the job for a run and write its artifacts into the output directory.
///
/// # Errors
///
/// Returns an error if validation, acquisition, preprocessing or any write fails.
pub fn prepare(args: &FinetuneArgs, options: &PrepareOptions) -> Result<FinetuneJob> {
    args.validate()?;
    let training = &args.training;
    let cache_dir = training.cache_dir.as_deref();

    let quantization_config = build_bnb_config(&args.quantization);
    let lora_config = build_lora_config(&args.adapter).with_base_model(&args.model.model_name);

    let resume_from_checkpoint = resolve_resume(training)?;
    std::fs::create_dir_all(&training.output_dir)?;

    let model_files = acquire_model(&args.model, cache_dir, options.fetch_weights)?;
    let info = model_files.info()?;
    if !info.architectures.is_empty() && !info.is_causal_lm() {
        tracing::warn!(
            "{} declares {:?}, not a causal LM head",
            args.model.model_name,
            info.architectures
        );
    }
    if let Some(max_positions) = info.max_position_embeddings {
        if training.model_max_length > max_positions {
            tracing::warn!(
                "model_max_length {} exceeds the model's {} positions",
                training.model_max_length,
                max_positions
            );
        }
    }

    let tokenizer = load_tokenizer(&model_files, training.model_max_length)?;

    let mut data_files = acquire_dataset(&args.data, cache_dir, args.model.hub_token.clone())?;
    if let Some(ref personal) = args.data.personal_data {
        if !personal.exists() {
            return Err(FinetuneError::Dataset(format!(
                "personal data not found: {}",
                personal.display()
            )));
        }
        data_files.push(personal.clone());
    }

    let records = load_records(&data_files)?;
    tracing::info!("Loaded {} records from {} files", records.len(), data_files.len());
    let examples = preprocess_data(&records, &tokenizer)?;
    if examples.is_empty() {
        return Err(FinetuneError::Dataset("no training examples after preprocessing".into()));
    }

    let train_dataset = training.output_dir.join(TRAIN_DATA_NAME);
    write_jsonl(&examples, &train_dataset)?;
    lora_config.save_pretrained(&training.output_dir)?;
    quantization_config.save_to_dir(&training.output_dir)?;
    args.to_file(training.output_dir.join(ARGS_FILE_NAME))?;

    let job = FinetuneJob {
        model_name: args.model.model_name.clone(),
        new_model_name: args.model.new_model_name.clone(),
        model_dir: model_files.root.clone(),
        weights: model_files.weights.clone(),
        device_map: args.model.device_map.clone(),
        quantization_config,
        lora_config,
        training_args: training.clone(),
        train_dataset,
        num_train_examples: examples.len(),
        resume_from_checkpoint,
        pad_token_id: tokenizer.eos_token_id(),
    };
    std::fs::write(job.manifest_path(), serde_json::to_string_pretty(&job)?)?;
    tracing::info!("Wrote job manifest to {}", job.manifest_path().display());

    Ok(job)
}

/// Prepare the job, train it with `backend`, and save returned weights.
///
/// # Errors
///
/// Returns an error if preparation, training or saving fails.
pub fn finetune(
    args: &FinetuneArgs,
    options: &PrepareOptions,
    backend: &mut dyn TrainerBackend,
) -> Result<TrainOutcome> {
    let job = prepare(args, options)?;

    tracing::info!("Handing off to trainer: {}", backend.name());
    let mut outcome = backend.train(&job)?;
    tracing::info!("Training finished at step {}", outcome.global_step);

    if let Some(state_dict) = outcome.state_dict.take() {
        if let Some(path) =
            safe_save_model(state_dict, &job.final_model_dir(), job.training_args.should_save())?
        {
            tracing::info!("Saved final model to {}", path.display());
        }
    }

    Ok(outcome)
}

/// Save a state dict after moving every tensor to host memory.
///
/// The device copies are dropped before writing, so accelerator memory is
/// released as soon as the host copy exists. Nothing is written when
/// `should_save` is false.
///
/// # Errors
///
/// Returns an error if a tensor cannot be copied or the file cannot be written.
pub fn safe_save_model(
    state_dict: HashMap<String, Tensor>,
    output_dir: &Path,
    should_save: bool,
) -> Result<Option<PathBuf>> {
    if !should_save {
        return Ok(None);
    }

    let cpu_state_dict = state_dict
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(&Device::Cpu)?)))
        .collect::<Result<HashMap<_, _>>>()?;

    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(ADAPTER_WEIGHTS_NAME);
    candle_core::safetensors::save(&cpu_state_dict, &path)?;
    Ok(Some(path))
}
