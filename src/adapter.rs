//! Low-rank adapter settings and the PEFT `LoraConfig` builder.
//!
//! [`LoraConfig`] serializes to the `adapter_config.json` layout PEFT reads
//! and writes, so the file produced here can be consumed by any trainer or
//! merge tool built on that format.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::args::AdapterArguments;
use crate::error::{FinetuneError, Result};

/// File name of a serialized adapter config.
pub const ADAPTER_CONFIG_NAME: &str = "adapter_config.json";

/// Which bias terms are trained alongside the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    /// Train no biases.
    #[default]
    None,
    /// Train every bias in the model.
    All,
    /// Train only the biases of adapted layers.
    #[value(name = "lora_only")]
    LoraOnly,
}

impl fmt::Display for LoraBias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoraBias::None => f.write_str("none"),
            LoraBias::All => f.write_str("all"),
            LoraBias::LoraOnly => f.write_str("lora_only"),
        }
    }
}

/// PEFT task type, selecting the model head the adapter wraps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum TaskType {
    /// Causal language modeling.
    #[default]
    #[serde(rename = "CAUSAL_LM")]
    #[value(name = "CAUSAL_LM", alias = "causal_lm")]
    CausalLm,
    /// Sequence-to-sequence language modeling.
    #[serde(rename = "SEQ_2_SEQ_LM")]
    #[value(name = "SEQ_2_SEQ_LM", alias = "seq_2_seq_lm")]
    Seq2SeqLm,
    /// Sequence classification.
    #[serde(rename = "SEQ_CLS")]
    #[value(name = "SEQ_CLS", alias = "seq_cls")]
    SeqCls,
    /// Token classification.
    #[serde(rename = "TOKEN_CLS")]
    #[value(name = "TOKEN_CLS", alias = "token_cls")]
    TokenCls,
    /// Extractive question answering.
    #[serde(rename = "QUESTION_ANS")]
    #[value(name = "QUESTION_ANS", alias = "question_ans")]
    QuestionAns,
    /// Embedding extraction.
    #[serde(rename = "FEATURE_EXTRACTION")]
    #[value(name = "FEATURE_EXTRACTION", alias = "feature_extraction")]
    FeatureExtraction,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::CausalLm => "CAUSAL_LM",
            TaskType::Seq2SeqLm => "SEQ_2_SEQ_LM",
            TaskType::SeqCls => "SEQ_CLS",
            TaskType::TokenCls => "TOKEN_CLS",
            TaskType::QuestionAns => "QUESTION_ANS",
            TaskType::FeatureExtraction => "FEATURE_EXTRACTION",
        };
        f.write_str(name)
    }
}

/// PEFT LoRA configuration.
///
/// # Example
///
/// ```rust
/// use finetune_rs::args::AdapterArguments;
/// use finetune_rs::adapter::build_lora_config;
///
/// let config = build_lora_config(&AdapterArguments::default())
///     .with_base_model("meta-llama/Llama-2-7b-hf");
///
/// assert_eq!(config.r, 64);
/// assert_eq!(config.lora_alpha, 16);
/// assert!((config.scaling() - 0.25).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Always `"LORA"`.
    pub peft_type: String,
    /// Model head the adapter is attached to.
    pub task_type: TaskType,
    /// Rank of the update matrices.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: usize,
    /// Dropout on the adapter input.
    pub lora_dropout: f64,
    /// Bias training policy.
    pub bias: LoraBias,
    /// Module names to adapt. `None` lets the trainer pick per architecture.
    pub target_modules: Option<Vec<String>>,
    /// Model the adapter was trained against.
    pub base_model_name_or_path: Option<String>,
    /// Adapter is frozen for inference.
    pub inference_mode: bool,
    /// Target layers store weights as (fan_in, fan_out).
    pub fan_in_fan_out: bool,
}

impl LoraConfig {
    /// Record the base model the adapter belongs to.
    #[must_use]
    pub fn with_base_model(mut self, base_model: impl Into<String>) -> Self {
        self.base_model_name_or_path = Some(base_model.into());
        self
    }

    /// Multiplier applied to the low-rank update, `alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        if self.r == 0 {
            return 0.0;
        }
        self.lora_alpha as f64 / self.r as f64
    }

    /// Write `adapter_config.json` into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_pretrained<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(ADAPTER_CONFIG_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!("Wrote adapter config to {}", path.display());
        Ok(path)
    }

    /// Read `adapter_config.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn from_pretrained<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_NAME);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            FinetuneError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Build the PEFT LoRA config for a run.
#[must_use]
pub fn build_lora_config(args: &AdapterArguments) -> LoraConfig {
    let target_modules = if args.lora_target_modules.is_empty() {
        None
    } else {
        Some(args.lora_target_modules.clone())
    };

    LoraConfig {
        peft_type: "LORA".into(),
        task_type: args.task_type,
        r: args.lora_r,
        lora_alpha: args.lora_alpha,
        lora_dropout: args.lora_dropout,
        bias: args.bias,
        target_modules,
        base_model_name_or_path: None,
        inference_mode: false,
        fan_in_fan_out: false,
    }
}
