//! Error types for finetune-rs.
//!
//! Every fallible operation in the crate returns [`Result`], so callers can
//! propagate with `?` and match on the variant they care about.
//!
//! # Example
//!
//! ```rust
//! use finetune_rs::{FinetuneArgs, FinetuneError};
//!
//! let mut args = FinetuneArgs::default();
//! args.adapter.lora_r = 0;
//!
//! match args.validate() {
//!     Err(FinetuneError::Config(msg)) => assert!(msg.contains("lora_r")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for finetune-rs operations.
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Errors that can occur while preparing or launching a fine-tuning run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FinetuneError {
    /// Invalid argument combination.
    #[error("configuration error: {0}")]
    Config(String),

    /// Run file could not be parsed as YAML.
    #[error("invalid run file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hugging Face Hub request failed.
    #[error("hub error: {0}")]
    Hub(String),

    /// Model snapshot is missing files or is malformed.
    #[error("model error: {0}")]
    Model(String),

    /// Tokenizer could not be loaded or configured.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Trainer backend failed.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for FinetuneError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FinetuneError::Template(err.to_string())
    }
}

impl From<tokenizers::Error> for FinetuneError {
    fn from(err: tokenizers::Error) -> Self {
        FinetuneError::Tokenizer(err.to_string())
    }
}

impl From<hf_hub::api::sync::ApiError> for FinetuneError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        FinetuneError::Hub(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for FinetuneError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        FinetuneError::Dataset(format!("parquet: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_display() {
        let error = FinetuneError::Config("lora_r must be > 0".to_string());
        assert_eq!(error.to_string(), "configuration error: lora_r must be > 0");
    }

    #[test]
    fn test_checkpoint_error_display() {
        let error = FinetuneError::Checkpoint("no checkpoint found".to_string());
        assert_eq!(error.to_string(), "checkpoint error: no checkpoint found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: FinetuneError = io_error.into();
        assert!(matches!(error, FinetuneError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: FinetuneError = yaml_error.into();
        assert!(error.to_string().contains("invalid run file"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: FinetuneError = json_error.into();
        assert!(error.to_string().starts_with("json error"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: FinetuneError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_tokenizer_error_conversion() {
        let result = tokenizers::Tokenizer::from_file("/nonexistent/tokenizer.json");
        if let Err(tokenizer_error) = result {
            let error: FinetuneError = tokenizer_error.into();
            assert!(error.to_string().contains("tokenizer error"));
        }
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(template_error) = ProgressStyle::default_bar().template("{bar:abc}") {
            let error: FinetuneError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: FinetuneError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(error.source().is_some());
    }
}
