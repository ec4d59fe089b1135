//! CLI entry point for finetune-rs.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finetune_rs::args::TrainingArguments;
use finetune_rs::checkpoint::{checkpoint_step, find_checkpoints, resolve_resume};
use finetune_rs::trainer::{finetune, DryRun, ExternalTrainer, PrepareOptions, TrainerBackend};
use finetune_rs::{FinetuneArgs, FinetuneError, Result};

#[derive(Parser)]
#[command(name = "finetune")]
#[command(about = "QLoRA fine-tuning launcher for causal language models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare a run from flags and launch training
    Train {
        #[command(flatten)]
        args: FinetuneArgs,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Prepare a run from a YAML or JSON run file and launch training
    Run {
        /// Path to run file
        file: PathBuf,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Write a run file with every default filled in
    Init {
        /// Output path for the run file
        #[arg(default_value = "finetune.yaml")]
        output: PathBuf,
    },
    /// Validate a run file
    Validate {
        /// Path to run file
        file: PathBuf,
    },
    /// List checkpoints in an output directory and show the resume target
    Checkpoints {
        /// Training output directory
        dir: PathBuf,
    },
}

#[derive(Args)]
struct LaunchArgs {
    /// Trainer command, invoked with `--job <manifest>`
    #[arg(long, env = "FINETUNE_TRAINER", required_unless_present = "dry_run")]
    trainer_cmd: Option<String>,

    /// Prepare the job without downloading weights or training (overrides --trainer-cmd)
    #[arg(long)]
    dry_run: bool,
}

impl LaunchArgs {
    fn backend(&self) -> Result<Box<dyn TrainerBackend>> {
        if self.dry_run {
            return Ok(Box::new(DryRun));
        }
        match self.trainer_cmd {
            Some(ref command) => Ok(Box::new(ExternalTrainer::from_command_line(command)?)),
            None => Err(FinetuneError::Config(
                "--trainer-cmd or --dry-run is required".into(),
            )),
        }
    }

    fn options(&self) -> PrepareOptions {
        PrepareOptions {
            fetch_weights: !self.dry_run,
        }
    }
}

fn launch(args: &FinetuneArgs, launch: &LaunchArgs) -> Result<()> {
    let mut backend = launch.backend()?;
    let outcome = finetune(args, &launch.options(), backend.as_mut())?;

    println!("✓ Run prepared in: {}", args.training.output_dir.display());
    if launch.dry_run {
        println!("  Dry run, no training performed");
    } else {
        println!("  Training finished at step {}", outcome.global_step);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { args, launch: l } => {
            tracing::info!("Starting run for {}", args.model.model_name);
            launch(&args, &l)?;
        }
        Commands::Run { file, launch: l } => {
            tracing::info!("Starting run from: {}", file.display());
            let args = FinetuneArgs::from_file(&file)?;
            launch(&args, &l)?;
        }
        Commands::Init { output } => {
            FinetuneArgs::default().to_file(&output)?;
            println!("✓ Run file written to: {}", output.display());
        }
        Commands::Validate { file } => {
            tracing::info!("Validating run file: {}", file.display());
            let args = FinetuneArgs::from_file(&file)?;
            args.validate()?;
            println!("✓ Run file is valid");
            println!("  Model: {}", args.model.model_name);
            println!("  Dataset: {}", args.data.hf_data_path);
            println!("  Output: {}", args.training.output_dir.display());
        }
        Commands::Checkpoints { dir } => {
            let checkpoints = find_checkpoints(&dir)?;
            if checkpoints.is_empty() {
                println!("No checkpoints in {}", dir.display());
            }
            for path in &checkpoints {
                match checkpoint_step(path) {
                    Some(step) => println!("  {} (step {step})", path.display()),
                    None => println!("  {}", path.display()),
                }
            }

            let training = TrainingArguments {
                output_dir: dir,
                ..Default::default()
            };
            match resolve_resume(&training)? {
                Some(path) => println!("Resume target: {}", path.display()),
                None => println!("Resume target: none"),
            }
        }
    }

    Ok(())
}
