//! Model snapshot and tokenizer acquisition.
//!
//! A model is named either by a local directory or by a hub id. Either way
//! the result is a [`ModelFiles`] listing the snapshot's config, tokenizer
//! and safetensors weights, ready to be handed to a trainer.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::args::ModelArguments;
use crate::error::{FinetuneError, Result};
use crate::hub::HubClient;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Local paths of a model snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    /// Directory holding `config.json`.
    pub root: PathBuf,
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// `tokenizer_config.json`, if the snapshot ships one.
    pub tokenizer_config: Option<PathBuf>,
    /// Safetensors weight files (one, or every shard).
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Collect the files of a snapshot already on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if `config.json` or `tokenizer.json` is missing or the
    /// weight index cannot be parsed.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();

        let config = root.join(CONFIG_FILE);
        if !config.is_file() {
            return Err(FinetuneError::Model(format!(
                "{CONFIG_FILE} not found in {}",
                root.display()
            )));
        }

        let tokenizer = root.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(FinetuneError::Tokenizer(format!(
                "{TOKENIZER_FILE} not found in {}",
                root.display()
            )));
        }

        let tokenizer_config = Some(root.join(TOKENIZER_CONFIG_FILE)).filter(|p| p.is_file());
        let weights = local_weights(&root)?;
        if weights.is_empty() {
            tracing::warn!("No safetensors weights found in {}", root.display());
        }

        Ok(Self {
            root,
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }

    /// Parse `config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn info(&self) -> Result<ModelInfo> {
        let content = std::fs::read_to_string(&self.config)?;
        serde_json::from_str(&content)
            .map_err(|e| FinetuneError::Model(format!("failed to parse {CONFIG_FILE}: {e}")))
    }
}

fn local_weights(root: &Path) -> Result<Vec<PathBuf>> {
    let single = root.join(SINGLE_WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index = root.join(WEIGHTS_INDEX_FILE);
    if index.is_file() {
        return Ok(shard_names(&index)?
            .into_iter()
            .map(|name| root.join(name))
            .collect());
    }

    let mut weights: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    weights.sort();
    Ok(weights)
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Distinct shard file names listed by a `model.safetensors.index.json`, sorted.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&content).map_err(|e| {
        FinetuneError::Model(format!("failed to parse {WEIGHTS_INDEX_FILE}: {e}"))
    })?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

/// The fields of `config.json` the launcher inspects.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelInfo {
    /// Model classes the checkpoint was saved from.
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Architecture family (`llama`, `mistral`, ...).
    pub model_type: Option<String>,
    /// Vocabulary size.
    pub vocab_size: Option<usize>,
    /// Longest supported context.
    pub max_position_embeddings: Option<usize>,
    /// End-of-sequence id; some configs store a list.
    pub eos_token_id: Option<TokenIds>,
    /// Dtype the weights were saved in.
    pub torch_dtype: Option<String>,
}

/// A single token id or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    /// One id.
    Single(u32),
    /// Several ids; the first is used.
    Many(Vec<u32>),
}

impl TokenIds {
    /// The primary id.
    #[must_use]
    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }
}

impl ModelInfo {
    /// Whether the config declares a causal language modeling head.
    #[must_use]
    pub fn is_causal_lm(&self) -> bool {
        self.architectures.iter().any(|a| a.ends_with("ForCausalLM"))
    }
}

/// Resolve a model to local files, downloading from the hub when needed.
///
/// A `model_name` naming an existing directory is used as is. Otherwise the
/// config and tokenizer files are fetched, plus the weights when
/// `fetch_weights` is set.
///
/// # Errors
///
/// Returns an error if required files cannot be found or downloaded.
pub fn acquire_model(
    args: &ModelArguments,
    cache_dir: Option<&Path>,
    fetch_weights: bool,
) -> Result<ModelFiles> {
    let local = Path::new(&args.model_name);
    if local.is_dir() {
        tracing::info!("Using local model at {}", local.display());
        return ModelFiles::from_dir(local);
    }

    tracing::info!("Fetching {} from the hub", args.model_name);
    let hub = HubClient::new(cache_dir, args.hub_token.clone())?;
    let repo = hub.model(&args.model_name, args.revision.as_deref());

    let config = repo.fetch(CONFIG_FILE)?;
    let tokenizer = repo.fetch(TOKENIZER_FILE)?;
    let tokenizer_config = repo.fetch_optional(TOKENIZER_CONFIG_FILE);

    let weights = if fetch_weights {
        tracing::info!("Downloading weights for {}...", args.model_name);
        match repo.fetch_optional(SINGLE_WEIGHTS_FILE) {
            Some(path) => vec![path],
            None => {
                let index = repo.fetch(WEIGHTS_INDEX_FILE)?;
                shard_names(&index)?
                    .iter()
                    .map(|name| repo.fetch(name))
                    .collect::<Result<Vec<_>>>()?
            }
        }
    } else {
        Vec::new()
    };

    let root = config
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    Ok(ModelFiles {
        root,
        config,
        tokenizer,
        tokenizer_config,
        weights,
    })
}

/// `eos_token` in `tokenizer_config.json`: a bare string or an added-token object.
#[derive(Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

#[derive(Deserialize)]
struct TokenizerConfig {
    eos_token: Option<SpecialToken>,
}

/// Tokenizer with padding and truncation configured for training.
///
/// Llama-family tokenizers ship without a pad token, so the EOS token is
/// used for padding.
pub struct PreparedTokenizer {
    tokenizer: Tokenizer,
    eos_token: String,
    eos_token_id: u32,
    max_length: usize,
}

impl PreparedTokenizer {
    /// Token ids of `text`, truncated to the maximum length.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, add_special_tokens)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode `text` with special tokens, splitting off the ones the
    /// post-processor added.
    ///
    /// Returns the ids without trailing special tokens, and the number of
    /// leading special tokens (such as BOS) they start with.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_framed(&self, text: &str) -> Result<(Vec<u32>, usize)> {
        let encoding = self.tokenizer.encode(text, true)?;
        let mask = encoding.get_special_tokens_mask();
        let leading = mask.iter().take_while(|&&m| m == 1).count();
        let trailing = mask[leading..].iter().rev().take_while(|&&m| m == 1).count();

        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(ids.len() - trailing);
        Ok((ids, leading))
    }

    /// End-of-sequence token.
    #[must_use]
    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    /// End-of-sequence id.
    #[must_use]
    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Padding token (same as EOS).
    #[must_use]
    pub fn pad_token(&self) -> Option<&str> {
        self.tokenizer.get_padding().map(|p| p.pad_token.as_str())
    }

    /// Padding id (same as EOS).
    #[must_use]
    pub fn pad_token_id(&self) -> Option<u32> {
        self.tokenizer.get_padding().map(|p| p.pad_id)
    }

    /// Maximum sequence length.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Underlying tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

/// Load the snapshot's tokenizer and configure it for training.
///
/// # Errors
///
/// Returns [`FinetuneError::Tokenizer`] if the tokenizer cannot be loaded or
/// no EOS token can be determined.
pub fn load_tokenizer(files: &ModelFiles, max_length: usize) -> Result<PreparedTokenizer> {
    let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
        FinetuneError::Tokenizer(format!(
            "failed to load {}: {e}",
            files.tokenizer.display()
        ))
    })?;

    let eos_token = resolve_eos_token(files, &tokenizer)?;
    let eos_token_id = tokenizer.token_to_id(&eos_token).ok_or_else(|| {
        FinetuneError::Tokenizer(format!("EOS token {eos_token:?} is not in the vocabulary"))
    })?;

    tokenizer.with_padding(Some(PaddingParams {
        pad_id: eos_token_id,
        pad_token: eos_token.clone(),
        ..Default::default()
    }));
    tokenizer.with_truncation(Some(TruncationParams {
        max_length,
        ..Default::default()
    }))?;

    tracing::info!(
        "Loaded tokenizer with vocab size {} (pad = eos = {:?})",
        tokenizer.get_vocab_size(true),
        eos_token
    );

    Ok(PreparedTokenizer {
        tokenizer,
        eos_token,
        eos_token_id,
        max_length,
    })
}

fn resolve_eos_token(files: &ModelFiles, tokenizer: &Tokenizer) -> Result<String> {
    if let Some(path) = &files.tokenizer_config {
        let content = std::fs::read_to_string(path)?;
        let config: TokenizerConfig = serde_json::from_str(&content).map_err(|e| {
            FinetuneError::Tokenizer(format!("failed to parse {TOKENIZER_CONFIG_FILE}: {e}"))
        })?;
        match config.eos_token {
            Some(SpecialToken::Plain(token) | SpecialToken::Added { content: token }) => {
                return Ok(token);
            }
            None => {}
        }
    }

    files
        .info()?
        .eos_token_id
        .as_ref()
        .and_then(TokenIds::first)
        .and_then(|id| tokenizer.id_to_token(id))
        .ok_or_else(|| {
            FinetuneError::Tokenizer(format!(
                "no EOS token declared in {} or {}",
                TOKENIZER_CONFIG_FILE, CONFIG_FILE
            ))
        })
}
