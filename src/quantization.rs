//! 4-bit quantization settings and the `bitsandbytes` config builder.
//!
//! [`build_bnb_config`] maps the user-facing [`QuantizationArguments`] onto
//! [`BitsAndBytesConfig`], which serializes to the `quantization_config`
//! object a Hugging Face causal LM expects when it is loaded in 4 bits.
//!
//! # Example
//!
//! ```rust
//! use finetune_rs::args::QuantizationArguments;
//! use finetune_rs::quantization::{build_bnb_config, QuantType};
//!
//! let args = QuantizationArguments {
//!     bnb_4bit_quant_type: QuantType::Fp4,
//!     use_nested_quant: true,
//!     ..Default::default()
//! };
//!
//! let config = build_bnb_config(&args);
//! assert_eq!(config.bnb_4bit_quant_type, QuantType::Fp4);
//! assert!(config.bnb_4bit_use_double_quant);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::args::QuantizationArguments;
use crate::error::Result;

/// File name used when the quantization config is written next to a run.
pub const QUANTIZATION_CONFIG_NAME: &str = "quantization_config.json";

/// 4-bit quantization data type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit float.
    Fp4,
    /// 4-bit `NormalFloat`.
    #[default]
    Nf4,
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantType::Fp4 => f.write_str("fp4"),
            QuantType::Nf4 => f.write_str("nf4"),
        }
    }
}

/// Dtype used for matmuls against the dequantized 4-bit weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    /// IEEE half precision.
    #[default]
    Float16,
    /// Brain float.
    Bfloat16,
    /// Single precision.
    Float32,
}

impl fmt::Display for ComputeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDtype::Float16 => f.write_str("float16"),
            ComputeDtype::Bfloat16 => f.write_str("bfloat16"),
            ComputeDtype::Float32 => f.write_str("float32"),
        }
    }
}

/// `bitsandbytes` quantization config in the shape stored under
/// `quantization_config` in a model's `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitsAndBytesConfig {
    /// Always `"bitsandbytes"`.
    pub quant_method: String,
    /// Load the base model in 4 bits.
    pub load_in_4bit: bool,
    /// Load the base model in 8 bits. Never set by this launcher.
    pub load_in_8bit: bool,
    /// Outlier threshold for 8-bit matmul.
    pub llm_int8_threshold: f64,
    /// Compute dtype for 4-bit layers.
    pub bnb_4bit_compute_dtype: ComputeDtype,
    /// 4-bit data type.
    pub bnb_4bit_quant_type: QuantType,
    /// Quantize the quantization constants as well.
    pub bnb_4bit_use_double_quant: bool,
    /// Storage type of the packed 4-bit weights.
    pub bnb_4bit_quant_storage: String,
}

impl BitsAndBytesConfig {
    /// Whether any quantization is requested.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.load_in_4bit || self.load_in_8bit
    }

    /// Effective weight bit width, `None` when the model stays in full precision.
    #[must_use]
    pub fn bits(&self) -> Option<u8> {
        if self.load_in_4bit {
            Some(4)
        } else if self.load_in_8bit {
            Some(8)
        } else {
            None
        }
    }

    /// Write the config as pretty JSON into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be written.
    pub fn save_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let path = dir.as_ref().join(QUANTIZATION_CONFIG_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Build the `bitsandbytes` config for a run.
#[must_use]
pub fn build_bnb_config(args: &QuantizationArguments) -> BitsAndBytesConfig {
    BitsAndBytesConfig {
        quant_method: "bitsandbytes".into(),
        load_in_4bit: args.load_in_4bit,
        load_in_8bit: false,
        llm_int8_threshold: 6.0,
        bnb_4bit_compute_dtype: args.bnb_4bit_compute_dtype,
        bnb_4bit_quant_type: args.bnb_4bit_quant_type,
        bnb_4bit_use_double_quant: args.use_nested_quant,
        bnb_4bit_quant_storage: "uint8".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn quant_type() -> impl Strategy<Value = QuantType> {
        prop_oneof![Just(QuantType::Fp4), Just(QuantType::Nf4)]
    }

    fn compute_dtype() -> impl Strategy<Value = ComputeDtype> {
        prop_oneof![
            Just(ComputeDtype::Float16),
            Just(ComputeDtype::Bfloat16),
            Just(ComputeDtype::Float32),
        ]
    }

    proptest! {
        #[test]
        fn prop_builder_preserves_fields(
            load_in_4bit in any::<bool>(),
            use_nested_quant in any::<bool>(),
            quant in quant_type(),
            dtype in compute_dtype(),
        ) {
            let args = QuantizationArguments {
                load_in_4bit,
                bnb_4bit_compute_dtype: dtype,
                bnb_4bit_quant_type: quant,
                use_nested_quant,
            };
            let config = build_bnb_config(&args);

            prop_assert_eq!(config.load_in_4bit, load_in_4bit);
            prop_assert_eq!(config.bnb_4bit_use_double_quant, use_nested_quant);
            prop_assert_eq!(config.bnb_4bit_quant_type, quant);
            prop_assert_eq!(config.bnb_4bit_compute_dtype, dtype);
        }
    }

    #[test]
    fn test_quant_type_not_taken_from_compute_dtype() {
        let args = QuantizationArguments {
            bnb_4bit_compute_dtype: ComputeDtype::Bfloat16,
            bnb_4bit_quant_type: QuantType::Fp4,
            ..Default::default()
        };
        let json = serde_json::to_value(build_bnb_config(&args)).unwrap();
        assert_eq!(json["bnb_4bit_quant_type"], "fp4");
        assert_eq!(json["bnb_4bit_compute_dtype"], "bfloat16");
    }

    #[test]
    fn test_default_config_shape() {
        let config = build_bnb_config(&QuantizationArguments::default());
        assert_eq!(config.quant_method, "bitsandbytes");
        assert_eq!(config.bits(), Some(4));
        assert!(config.is_quantized());
        assert!(!config.load_in_8bit);
        assert!(!config.bnb_4bit_use_double_quant);
        assert_eq!(config.bnb_4bit_quant_type, QuantType::Nf4);
        assert_eq!(config.bnb_4bit_compute_dtype, ComputeDtype::Float16);
    }

    #[test]
    fn test_unquantized_config() {
        let args = QuantizationArguments {
            load_in_4bit: false,
            ..Default::default()
        };
        let config = build_bnb_config(&args);
        assert!(!config.is_quantized());
        assert_eq!(config.bits(), None);
    }

    #[test]
    fn test_save_to_dir() {
        let dir = TempDir::new().unwrap();
        let config = build_bnb_config(&QuantizationArguments::default());
        let path = config.save_to_dir(dir.path()).unwrap();

        assert!(path.ends_with(QUANTIZATION_CONFIG_NAME));
        let restored: BitsAndBytesConfig =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_display_matches_serde() {
        for quant in [QuantType::Fp4, QuantType::Nf4] {
            let json = serde_json::to_string(&quant).unwrap();
            assert_eq!(json, format!("\"{quant}\""));
        }
        for dtype in [ComputeDtype::Float16, ComputeDtype::Bfloat16, ComputeDtype::Float32] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{dtype}\""));
        }
    }
}
