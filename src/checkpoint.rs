//! Checkpoint discovery and resume resolution.
//!
//! Trainers write intermediate state into `<output_dir>/checkpoint-<step>`.
//! Before a run starts, the output directory is scanned so an interrupted run
//! picks up where it stopped instead of starting over.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::args::TrainingArguments;
use crate::error::{FinetuneError, Result};

/// Prefix of checkpoint entries inside an output directory.
pub const PREFIX_CHECKPOINT_DIR: &str = "checkpoint";

/// Keyword accepted by `resume_from_checkpoint` to pick the newest checkpoint.
pub const RESUME_LATEST: &str = "latest";

/// Step number encoded in a `checkpoint-<step>` name.
#[must_use]
pub fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PREFIX_CHECKPOINT_DIR)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

fn matches_pattern(name: &OsStr) -> bool {
    name.as_encoded_bytes()
        .strip_prefix(PREFIX_CHECKPOINT_DIR.as_bytes())
        .is_some_and(|rest| rest.starts_with(b"-"))
}

/// List every entry of `output_dir` named `checkpoint-*`.
///
/// Files and directories both match, whatever the encoding of the rest of
/// the name. Entries are ordered by step number,
/// entries without a numeric step last, ties by name. A missing directory
/// yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn find_checkpoints<P: AsRef<Path>>(output_dir: P) -> Result<Vec<PathBuf>> {
    let output_dir = output_dir.as_ref();
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if matches_pattern(&entry.file_name()) {
            checkpoints.push(entry.path());
        }
    }

    checkpoints.sort_by_cached_key(|p| {
        (
            checkpoint_step(p).unwrap_or(usize::MAX),
            p.file_name().map(ToOwned::to_owned),
        )
    });

    Ok(checkpoints)
}

/// Newest resumable checkpoint: the `checkpoint-<step>` directory with the largest step.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn latest_checkpoint<P: AsRef<Path>>(output_dir: P) -> Result<Option<PathBuf>> {
    Ok(find_checkpoints(output_dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| checkpoint_step(&p).map(|step| (step, p)))
        .max_by_key(|(step, _)| *step)
        .map(|(_, p)| p))
}

/// Decide which checkpoint, if any, the run resumes from.
///
/// - `resume_from_checkpoint = "latest"` resumes from the newest checkpoint
///   and fails if there is none.
/// - Any other explicit value is a path that must exist.
/// - Otherwise existing checkpoints are resumed unless
///   `overwrite_output_dir` is set.
///
/// # Errors
///
/// Returns [`FinetuneError::Checkpoint`] when an explicitly requested
/// checkpoint cannot be found.
pub fn resolve_resume(training: &TrainingArguments) -> Result<Option<PathBuf>> {
    match training.resume_from_checkpoint.as_deref() {
        Some(RESUME_LATEST) => latest_checkpoint(&training.output_dir)?
            .map(Some)
            .ok_or_else(|| {
                FinetuneError::Checkpoint(format!(
                    "no checkpoint found in {}",
                    training.output_dir.display()
                ))
            }),
        Some(explicit) => {
            let path = PathBuf::from(explicit);
            if path.exists() {
                Ok(Some(path))
            } else {
                Err(FinetuneError::Checkpoint(format!(
                    "checkpoint {explicit} does not exist"
                )))
            }
        }
        None if training.overwrite_output_dir => Ok(None),
        None => {
            let latest = latest_checkpoint(&training.output_dir)?;
            if let Some(ref path) = latest {
                tracing::info!(
                    "Checkpoint detected, resuming training at {}. Pass --overwrite-output-dir to train from scratch.",
                    path.display()
                );
            }
            Ok(latest)
        }
    }
}
