//! # finetune-rs
//!
//! QLoRA fine-tuning launcher for causal language models.
//!
//! Resolves a run description (CLI flags or a YAML/JSON run file) into
//! everything a trainer needs: the `bitsandbytes` 4-bit loading config, the
//! `LoRA` adapter config, a local model snapshot and tokenizer, a tokenized
//! instruction dataset, and the checkpoint to resume from.
//!
//! ## Features
//!
//! - **Five argument groups** - model, data, training, quantization, adapter
//! - **Hub acquisition** - models and datasets from the Hugging Face Hub or local paths
//! - **Checkpoint resume** - `checkpoint-<step>` discovery in the output directory
//! - **Pluggable trainers** - hand the prepared job to an external program
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a run file with every default
//! finetune init run.yaml
//!
//! # Check it
//! finetune validate run.yaml
//!
//! # Prepare the job and launch a trainer
//! finetune run run.yaml --trainer-cmd "python train.py"
//!
//! # Or pass everything as flags
//! finetune train --model-name meta-llama/Llama-2-7b-hf --lora-r 16 --dry-run
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use finetune_rs::{FinetuneArgs, trainer::{finetune, DryRun, PrepareOptions}};
//!
//! # fn main() -> finetune_rs::Result<()> {
//! let args = FinetuneArgs::from_file("run.yaml")?;
//! let outcome = finetune(&args, &PrepareOptions::default(), &mut DryRun)?;
//! println!("stopped at step {}", outcome.global_step);
//! # Ok(())
//! # }
//! ```
//!
//! ## Building Configs
//!
//! ```rust
//! use finetune_rs::FinetuneArgs;
//! use finetune_rs::adapter::build_lora_config;
//! use finetune_rs::quantization::{build_bnb_config, QuantType};
//!
//! let mut args = FinetuneArgs::default();
//! args.adapter.lora_r = 16;
//! args.quantization.bnb_4bit_quant_type = QuantType::Fp4;
//!
//! let lora = build_lora_config(&args.adapter);
//! let bnb = build_bnb_config(&args.quantization);
//!
//! assert_eq!(lora.r, 16);
//! assert_eq!(bnb.bnb_4bit_quant_type, QuantType::Fp4);
//! assert_eq!(bnb.bits(), Some(4));
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod args;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod hub;
pub mod model;
pub mod quantization;
pub mod trainer;

pub use args::FinetuneArgs;
pub use error::{FinetuneError, Result};
pub use trainer::{finetune, prepare, FinetuneJob, TrainerBackend};
