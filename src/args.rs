//! Argument groups for a fine-tuning run.
//!
//! The five groups ([`ModelArguments`], [`DataArguments`],
//! [`TrainingArguments`], [`QuantizationArguments`], [`AdapterArguments`])
//! are flattened into [`FinetuneArgs`], which is both a clap argument set and
//! a serde document. A run can therefore be described on the command line or
//! in a YAML/JSON run file; absent fields take the same defaults either way.
//!
//! # Example
//!
//! ```rust
//! use finetune_rs::FinetuneArgs;
//!
//! # fn main() -> finetune_rs::Result<()> {
//! let args: FinetuneArgs = serde_yaml::from_str(
//!     "model:\n  model_name: mistralai/Mistral-7B-v0.1\nadapter:\n  lora_r: 16\n",
//! )?;
//!
//! assert_eq!(args.model.model_name, "mistralai/Mistral-7B-v0.1");
//! assert_eq!(args.adapter.lora_r, 16);
//! assert_eq!(args.training.model_max_length, 512);
//! args.validate()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::adapter::{LoraBias, TaskType};
use crate::error::{FinetuneError, Result};
use crate::quantization::{ComputeDtype, QuantType};

const DEFAULT_MODEL_NAME: &str = "meta-llama/Llama-2-7b-hf";
const DEFAULT_NEW_MODEL_NAME: &str = "airpodmaxsucks-7b-chat";
const DEFAULT_DEVICE_MAP: &str = "auto";
const DEFAULT_HF_DATA_PATH: &str = "iamtarun/python_code_instructions_18k_alpaca";
const DEFAULT_DATA_SPLIT: &str = "train";
const DEFAULT_OUTPUT_DIR: &str = "./results";
const DEFAULT_OPTIM: &str = "adamw_torch";

/// Which pretrained model to fine-tune and what to call the result.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArguments {
    /// Hub model id or local directory of the base model.
    #[arg(long, default_value = DEFAULT_MODEL_NAME)]
    pub model_name: String,

    /// Name of the fine-tuned model.
    #[arg(long, default_value = DEFAULT_NEW_MODEL_NAME)]
    pub new_model_name: String,

    /// Hub revision (branch, tag or commit) of the base model.
    #[arg(long)]
    pub revision: Option<String>,

    /// Hub access token.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    #[serde(skip)]
    pub hub_token: Option<String>,

    /// Device placement passed through to the trainer.
    #[arg(long, default_value = DEFAULT_DEVICE_MAP)]
    pub device_map: String,
}

impl Default for ModelArguments {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.into(),
            new_model_name: DEFAULT_NEW_MODEL_NAME.into(),
            revision: None,
            hub_token: None,
            device_map: DEFAULT_DEVICE_MAP.into(),
        }
    }
}

/// Where the training data comes from.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct DataArguments {
    /// Hub dataset id, or a local file/directory.
    #[arg(long, default_value = DEFAULT_HF_DATA_PATH)]
    pub hf_data_path: String,

    /// Path to additional proprietary data (JSON, JSONL or Parquet).
    #[arg(long)]
    pub personal_data: Option<PathBuf>,

    /// Dataset split to train on.
    #[arg(long, default_value = DEFAULT_DATA_SPLIT)]
    pub data_split: String,
}

impl Default for DataArguments {
    fn default() -> Self {
        Self {
            hf_data_path: DEFAULT_HF_DATA_PATH.into(),
            personal_data: None,
            data_split: DEFAULT_DATA_SPLIT.into(),
        }
    }
}

/// Learning rate schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Linear decay to zero.
    #[default]
    Linear,
    /// Cosine annealing.
    Cosine,
    /// Constant learning rate.
    Constant,
}

/// Trainer hyperparameters and run layout.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArguments {
    /// Directory for checkpoints, run artifacts and the final model.
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Shared download cache (useful when distributed workers read one cache).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum sequence length; longer examples are truncated.
    #[arg(long, default_value_t = 512)]
    pub model_max_length: usize,

    /// Number of passes over the training set.
    #[arg(long, default_value_t = 3.0)]
    pub num_train_epochs: f64,

    /// Stop after this many optimizer steps, overriding epochs.
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Batch size per device.
    #[arg(long, default_value_t = 8)]
    pub per_device_train_batch_size: usize,

    /// Micro-batches accumulated per optimizer step.
    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate.
    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,

    /// Decoupled weight decay.
    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    /// Fraction of steps spent warming up.
    #[arg(long, default_value_t = 0.0)]
    pub warmup_ratio: f64,

    /// Learning rate schedule.
    #[arg(long, value_enum, default_value_t = LrScheduler::Linear)]
    pub lr_scheduler_type: LrScheduler,

    /// Optimizer name understood by the trainer.
    #[arg(long, default_value = DEFAULT_OPTIM)]
    pub optim: String,

    /// Log every N steps.
    #[arg(long, default_value_t = 500)]
    pub logging_steps: usize,

    /// Checkpoint every N steps.
    #[arg(long, default_value_t = 500)]
    pub save_steps: usize,

    /// Keep at most this many checkpoints.
    #[arg(long)]
    pub save_total_limit: Option<usize>,

    /// Recompute activations in the backward pass.
    #[arg(long)]
    pub gradient_checkpointing: bool,

    /// Mixed precision with float16.
    #[arg(long)]
    pub fp16: bool,

    /// Mixed precision with bfloat16.
    #[arg(long)]
    pub bf16: bool,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Checkpoint to resume from: a path, or `latest`.
    #[arg(long)]
    pub resume_from_checkpoint: Option<String>,

    /// Start fresh even if the output directory holds checkpoints.
    #[arg(long)]
    pub overwrite_output_dir: bool,

    /// Save on every node instead of only the global main process.
    #[arg(long)]
    pub save_on_each_node: bool,

    /// Global rank of this process.
    #[arg(long, env = "RANK", default_value_t = 0, hide = true)]
    #[serde(skip)]
    pub process_index: usize,

    /// Rank of this process on its node.
    #[arg(long, env = "LOCAL_RANK", default_value_t = 0, hide = true)]
    #[serde(skip)]
    pub local_process_index: usize,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            cache_dir: None,
            model_max_length: 512,
            num_train_epochs: 3.0,
            max_steps: None,
            per_device_train_batch_size: 8,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            warmup_ratio: 0.0,
            lr_scheduler_type: LrScheduler::Linear,
            optim: DEFAULT_OPTIM.into(),
            logging_steps: 500,
            save_steps: 500,
            save_total_limit: None,
            gradient_checkpointing: false,
            fp16: false,
            bf16: false,
            seed: 42,
            resume_from_checkpoint: None,
            overwrite_output_dir: false,
            save_on_each_node: false,
            process_index: 0,
            local_process_index: 0,
        }
    }
}

impl TrainingArguments {
    /// Whether this process is the one that writes model files.
    #[must_use]
    pub fn should_save(&self) -> bool {
        if self.save_on_each_node {
            self.local_process_index == 0
        } else {
            self.process_index == 0
        }
    }
}

/// 4-bit loading of the base model.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationArguments {
    /// Load the base model in 4 bits.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub load_in_4bit: bool,

    /// Compute dtype for 4-bit base models.
    #[arg(long, value_enum, default_value_t = ComputeDtype::Float16)]
    pub bnb_4bit_compute_dtype: ComputeDtype,

    /// Quantization type.
    #[arg(long, value_enum, default_value_t = QuantType::Nf4)]
    pub bnb_4bit_quant_type: QuantType,

    /// Nested (double) quantization of the quantization constants.
    #[arg(long)]
    pub use_nested_quant: bool,
}

impl Default for QuantizationArguments {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            bnb_4bit_compute_dtype: ComputeDtype::Float16,
            bnb_4bit_quant_type: QuantType::Nf4,
            use_nested_quant: false,
        }
    }
}

/// Low-rank adapter hyperparameters.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterArguments {
    /// LoRA attention dimension.
    #[arg(long, default_value_t = 64)]
    pub lora_r: usize,

    /// Alpha parameter for LoRA scaling.
    #[arg(long, default_value_t = 16)]
    pub lora_alpha: usize,

    /// Dropout probability for LoRA layers.
    #[arg(long, default_value_t = 0.1)]
    pub lora_dropout: f64,

    /// Which biases to train.
    #[arg(long, value_enum, default_value_t = LoraBias::None)]
    pub bias: LoraBias,

    /// PEFT task type.
    #[arg(long, value_enum, default_value_t = TaskType::CausalLm)]
    pub task_type: TaskType,

    /// Comma-separated module names to adapt (empty: architecture default).
    #[arg(long, value_delimiter = ',')]
    pub lora_target_modules: Vec<String>,
}

impl Default for AdapterArguments {
    fn default() -> Self {
        Self {
            lora_r: 64,
            lora_alpha: 16,
            lora_dropout: 0.1,
            bias: LoraBias::None,
            task_type: TaskType::CausalLm,
            lora_target_modules: Vec::new(),
        }
    }
}

/// All argument groups of a run.
#[derive(Debug, Clone, Default, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneArgs {
    /// Model selection.
    #[command(flatten, next_help_heading = "Model")]
    pub model: ModelArguments,

    /// Dataset selection.
    #[command(flatten, next_help_heading = "Data")]
    pub data: DataArguments,

    /// Trainer hyperparameters.
    #[command(flatten, next_help_heading = "Training")]
    pub training: TrainingArguments,

    /// Quantization parameters.
    #[command(flatten, next_help_heading = "Quantization")]
    pub quantization: QuantizationArguments,

    /// Adapter parameters.
    #[command(flatten, next_help_heading = "Adapter")]
    pub adapter: AdapterArguments,
}

impl FinetuneArgs {
    /// Load a run file. `.json` files are parsed as JSON, anything else as YAML.
    ///
    /// Fields that only make sense per process (hub token, ranks) are taken
    /// from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut args: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        args.apply_env();
        Ok(args)
    }

    /// Write a run file, picking the format from the extension like [`Self::from_file`].
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fill process-local fields from `HF_TOKEN`, `RANK` and `LOCAL_RANK`.
    pub fn apply_env(&mut self) {
        if self.model.hub_token.is_none() {
            self.model.hub_token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        }
        if let Some(rank) = env_usize("RANK") {
            self.training.process_index = rank;
        }
        if let Some(rank) = env_usize("LOCAL_RANK") {
            self.training.local_process_index = rank;
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.model.model_name.trim().is_empty() {
            return Err(FinetuneError::Config("model_name is required".into()));
        }

        if self.model.new_model_name.trim().is_empty() {
            return Err(FinetuneError::Config("new_model_name is required".into()));
        }

        if self.data.hf_data_path.trim().is_empty() && self.data.personal_data.is_none() {
            return Err(FinetuneError::Config(
                "either hf_data_path or personal_data is required".into(),
            ));
        }

        if self.training.output_dir.as_os_str().is_empty() {
            return Err(FinetuneError::Config("output_dir is required".into()));
        }

        if self.training.model_max_length == 0 {
            return Err(FinetuneError::Config("model_max_length must be > 0".into()));
        }

        if self.training.per_device_train_batch_size == 0
            || self.training.gradient_accumulation_steps == 0
        {
            return Err(FinetuneError::Config(
                "batch size and gradient_accumulation_steps must be > 0".into(),
            ));
        }

        if self.training.fp16 && self.training.bf16 {
            return Err(FinetuneError::Config(
                "fp16 and bf16 are mutually exclusive".into(),
            ));
        }

        if self.adapter.lora_r == 0 {
            return Err(FinetuneError::Config("lora_r must be > 0".into()));
        }

        if !(0.0..1.0).contains(&self.adapter.lora_dropout) {
            return Err(FinetuneError::Config(
                "lora_dropout must be in [0, 1)".into(),
            ));
        }

        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
