//! Instruction dataset loading and preprocessing.
//!
//! Records follow the Alpaca layout (`instruction`, optional `input`,
//! `output`) and may come from JSONL, JSON or Parquet files, either local or
//! downloaded from a hub dataset repository. [`preprocess_data`] renders each
//! record into a prompt, tokenizes it and masks the prompt out of the labels
//! so only the response contributes to the loss.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use arrow::array::{Array, ArrayRef, LargeStringArray, StringArray};
use indicatif::{ProgressBar, ProgressStyle};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::args::DataArguments;
use crate::error::{FinetuneError, Result};
use crate::hub::HubClient;
use crate::model::PreparedTokenizer;

/// Label value ignored by the loss.
pub const IGNORE_INDEX: i64 = -100;

const DATA_EXTENSIONS: [&str; 3] = ["parquet", "jsonl", "json"];

/// One instruction-following example.
///
/// # Example
///
/// ```rust
/// use finetune_rs::dataset::{format_example, InstructionRecord};
///
/// let record = InstructionRecord {
///     instruction: "Reverse a list in Python.".to_string(),
///     input: String::new(),
///     output: "xs[::-1]".to_string(),
/// };
///
/// let formatted = format_example(&record);
/// assert!(formatted.prompt.ends_with("### Response:\n"));
/// assert_eq!(formatted.text(), format!("{}xs[::-1]", formatted.prompt));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    /// Task description.
    pub instruction: String,
    /// Optional task input.
    #[serde(default)]
    pub input: String,
    /// Expected response.
    pub output: String,
}

/// Prompt and response rendered from a record.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedExample {
    /// Everything up to and including the response header.
    pub prompt: String,
    /// The response.
    pub response: String,
}

impl FormattedExample {
    /// Full training text.
    #[must_use]
    pub fn text(&self) -> String {
        format!("{}{}", self.prompt, self.response)
    }
}

/// Render a record with the instruction/input/response template.
#[must_use]
pub fn format_example(record: &InstructionRecord) -> FormattedExample {
    let mut prompt = format!("### Instruction:\n{}\n\n", record.instruction.trim());
    if !record.input.trim().is_empty() {
        prompt.push_str(&format!("### Input:\n{}\n\n", record.input.trim()));
    }
    prompt.push_str("### Response:\n");

    FormattedExample {
        prompt,
        response: record.output.trim().to_string(),
    }
}

/// A tokenized training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    /// Token ids, ending with EOS.
    pub input_ids: Vec<u32>,
    /// All ones; padding happens at batch time.
    pub attention_mask: Vec<u32>,
    /// Targets, [`IGNORE_INDEX`] over the prompt.
    pub labels: Vec<i64>,
}

/// Resolve the data files of the configured dataset.
///
/// A local file is used directly and a local directory is searched for data
/// files of the requested split. Anything else is treated as a hub dataset
/// id. An empty `hf_data_path` yields no files.
///
/// # Errors
///
/// Returns an error if the hub cannot be reached or no data file matches the split.
pub fn acquire_dataset(
    data: &DataArguments,
    cache_dir: Option<&Path>,
    token: Option<String>,
) -> Result<Vec<PathBuf>> {
    if data.hf_data_path.trim().is_empty() {
        return Ok(Vec::new());
    }

    let local = Path::new(&data.hf_data_path);
    if local.is_file() {
        return Ok(vec![local.to_path_buf()]);
    }

    if local.is_dir() {
        let mut relative = Vec::new();
        collect_relative_files(local, local, &mut relative)?;
        let selected = select_split_files(&relative, &data.data_split);
        if selected.is_empty() {
            return Err(FinetuneError::Dataset(format!(
                "no {} data files in {}",
                data.data_split,
                local.display()
            )));
        }
        return Ok(selected.into_iter().map(|rel| local.join(rel)).collect());
    }

    tracing::info!("Fetching dataset {} from the hub", data.hf_data_path);
    let hub = HubClient::new(cache_dir, token)?;
    let repo = hub.dataset(&data.hf_data_path, None);
    let selected = select_split_files(&repo.list_files()?, &data.data_split);
    if selected.is_empty() {
        return Err(FinetuneError::Dataset(format!(
            "dataset {} has no {} split in a supported format",
            data.hf_data_path, data.data_split
        )));
    }

    selected.iter().map(|file| repo.fetch(file)).collect()
}

fn collect_relative_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_relative_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Data files (by extension) belonging to `split`, sorted.
///
/// A file belongs to a split when a directory on its path is named after the
/// split, or its stem is the split name or starts with `<split>-`.
fn select_split_files(files: &[String], split: &str) -> Vec<String> {
    let mut selected: Vec<String> = files
        .iter()
        .filter(|f| {
            let path = Path::new(f.as_str());
            let is_data = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| DATA_EXTENSIONS.contains(&e));
            is_data && belongs_to_split(path, split)
        })
        .cloned()
        .collect();
    selected.sort();
    selected
}

fn belongs_to_split(path: &Path, split: &str) -> bool {
    let in_split_dir = path
        .parent()
        .is_some_and(|p| p.components().any(|c| c.as_os_str() == split));
    let stem_matches = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| stem == split || stem.starts_with(&format!("{split}-")));
    in_split_dir || stem_matches
}

/// Read records from every file, in order.
///
/// # Errors
///
/// Returns [`FinetuneError::Dataset`] for unsupported extensions or malformed rows.
pub fn load_records<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<InstructionRecord>> {
    let mut records = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let before = records.len();
        match path.extension().and_then(|e| e.to_str()) {
            Some("parquet") => records.extend(load_parquet(path)?),
            Some("jsonl") => records.extend(load_jsonl(path)?),
            Some("json") => records.extend(load_json(path)?),
            _ => {
                return Err(FinetuneError::Dataset(format!(
                    "unsupported data file: {}",
                    path.display()
                )))
            }
        }
        tracing::debug!("Read {} records from {}", records.len() - before, path.display());
    }
    Ok(records)
}

fn load_jsonl(path: &Path) -> Result<Vec<InstructionRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            FinetuneError::Dataset(format!(
                "{}:{}: failed to parse line: {e}",
                path.display(),
                line_no + 1
            ))
        })?;
        records.push(record);
    }

    Ok(records)
}

/// A `.json` file holds either one array of records or JSON lines.
fn load_json(path: &Path) -> Result<Vec<InstructionRecord>> {
    let content = std::fs::read_to_string(path)?;
    if content.trim_start().starts_with('[') {
        serde_json::from_str(&content).map_err(|e| {
            FinetuneError::Dataset(format!("{}: failed to parse: {e}", path.display()))
        })
    } else {
        load_jsonl(path)
    }
}

fn load_parquet(path: &Path) -> Result<Vec<InstructionRecord>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let schema = builder.schema().clone();

    let column_index = |name: &str| {
        schema.index_of(name).map_err(|_| {
            FinetuneError::Dataset(format!(
                "column '{name}' not found in {}. Available columns: {:?}",
                path.display(),
                schema.fields().iter().map(|f| f.name()).collect::<Vec<_>>()
            ))
        })
    };
    let instruction_idx = column_index("instruction")?;
    let output_idx = column_index("output")?;
    let input_idx = schema.index_of("input").ok();

    let mut records = Vec::new();
    for batch in builder.build()? {
        let batch = batch.map_err(|e| {
            FinetuneError::Dataset(format!("failed to read Parquet batch: {e}"))
        })?;

        let instructions = string_values(batch.column(instruction_idx), "instruction")?;
        let outputs = string_values(batch.column(output_idx), "output")?;
        let inputs = match input_idx {
            Some(idx) => string_values(batch.column(idx), "input")?,
            None => vec![None; batch.num_rows()],
        };

        for ((instruction, input), output) in instructions.into_iter().zip(inputs).zip(outputs) {
            let (Some(instruction), Some(output)) = (instruction, output) else {
                continue;
            };
            records.push(InstructionRecord {
                instruction,
                input: input.unwrap_or_default(),
                output,
            });
        }
    }

    Ok(records)
}

fn string_values(column: &ArrayRef, name: &str) -> Result<Vec<Option<String>>> {
    if let Some(array) = column.as_any().downcast_ref::<StringArray>() {
        return Ok((0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
            .collect());
    }
    if let Some(array) = column.as_any().downcast_ref::<LargeStringArray>() {
        return Ok((0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
            .collect());
    }
    Err(FinetuneError::Dataset(format!(
        "column '{name}' is not a string type"
    )))
}

/// Tokenize records into training examples.
///
/// The sequence is truncated so that the EOS token always fits. Records with
/// neither instruction nor output, and records whose prompt fills the whole
/// window, are skipped.
///
/// # Errors
///
/// Returns an error if tokenization fails.
pub fn preprocess_data(
    records: &[InstructionRecord],
    tokenizer: &PreparedTokenizer,
) -> Result<Vec<TokenizedExample>> {
    let max_length = tokenizer.max_length().max(1);
    let eos = tokenizer.eos_token_id();

    let pb = ProgressBar::new(records.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message("tokenizing");

    let mut examples = Vec::with_capacity(records.len());
    let mut skipped = 0usize;

    for record in records {
        pb.inc(1);
        if record.instruction.trim().is_empty() && record.output.trim().is_empty() {
            skipped += 1;
            continue;
        }

        let formatted = format_example(record);
        let prompt_ids = tokenizer.encode(&formatted.prompt, false)?;
        let (mut input_ids, prefix_len) = tokenizer.encode_framed(&formatted.text())?;
        input_ids.truncate(max_length - 1);
        input_ids.push(eos);

        let prompt_len = (prefix_len + prompt_ids.len()).min(input_ids.len());
        if prompt_len == input_ids.len() {
            skipped += 1;
            continue;
        }

        let labels = input_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| if i < prompt_len { IGNORE_INDEX } else { i64::from(id) })
            .collect();

        examples.push(TokenizedExample {
            attention_mask: vec![1; input_ids.len()],
            input_ids,
            labels,
        });
    }

    pb.finish_with_message("tokenized");
    if skipped > 0 {
        tracing::warn!("Skipped {} records with no trainable tokens", skipped);
    }
    tracing::info!("Prepared {} training examples", examples.len());

    Ok(examples)
}

/// Write examples as JSON lines.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_jsonl<P: AsRef<Path>>(examples: &[TokenizedExample], path: P) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for example in examples {
        serde_json::to_writer(&mut writer, example)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
