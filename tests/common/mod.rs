//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

/// Word-level tokenizer over a tiny vocabulary, split on whitespace.
pub const TINY_TOKENIZER: &str = r####"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "<unk>": 0, "<s>": 1, "</s>": 2, "###": 3, "Instruction": 4, "Input": 5,
      "Response": 6, ":": 7, "write": 8, "a": 9, "loop": 10, "for": 11,
      "in": 12, "range": 13, "print": 14, "hello": 15, "python": 16
    },
    "unk_token": "<unk>"
  }
}"####;

pub const TINY_CONFIG: &str = r#"{
  "architectures": ["LlamaForCausalLM"],
  "model_type": "llama",
  "vocab_size": 17,
  "max_position_embeddings": 64,
  "eos_token_id": 2
}"#;

/// Write a minimal model snapshot under `root/model`.
pub fn write_tiny_model(root: &Path) -> PathBuf {
    let dir = root.join("model");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.json"), TINY_CONFIG).unwrap();
    fs::write(dir.join("tokenizer.json"), TINY_TOKENIZER).unwrap();
    fs::write(dir.join("tokenizer_config.json"), r#"{"eos_token": "</s>"}"#).unwrap();
    dir
}

/// Write `rows` instruction records as JSON lines.
pub fn write_records(path: &Path, rows: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let line = r#"{"instruction": "write a loop", "input": "range", "output": "for hello in range print hello"}"#;
    fs::write(path, format!("{line}\n").repeat(rows)).unwrap();
}
